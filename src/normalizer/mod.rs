//! Source normalization
//!
//! Language-specific text rewriting that turns a user snippet into a
//! program the profile's compile/run commands accept. Pure text in, text
//! out; nothing is evaluated here.
//!
//! This module does NOT:
//! - Decide whether code is allowed (see `security`)
//! - Write files (the sandbox stages the result)

mod java;

pub use java::normalize_java;

use crate::languages::{LanguageProfile, NormalizeRule};

/// Code ready to be staged, and the file name it must be staged under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSource {
    pub filename: String,
    pub code: String,
}

/// Apply the profile's normalization rule to `code`
pub fn normalize(profile: &LanguageProfile, code: &str) -> NormalizedSource {
    let code = match &profile.normalize {
        NormalizeRule::None => code.to_string(),
        NormalizeRule::EnsureInclude { header } => ensure_include(code, header),
        NormalizeRule::JavaMain { class_name } => normalize_java(code, class_name),
    };

    NormalizedSource {
        filename: profile.source_file.clone(),
        code,
    }
}

/// Prepend `header` unless the code already mentions its target.
///
/// For `#include <stdio.h>` the target is `<stdio.h>`, so an existing
/// `#include<stdio.h>` (no space) also counts.
fn ensure_include(code: &str, header: &str) -> String {
    let token = match (header.find('<'), header.rfind('>')) {
        (Some(start), Some(end)) if start < end => &header[start..=end],
        _ => header.trim(),
    };

    if code.contains(token) {
        code.to_string()
    } else {
        format!("{}\n{}", header, code)
    }
}
