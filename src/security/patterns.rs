//! Gate configuration: size limits and forbidden-construct patterns
//!
//! Everything here is data loaded from `security.toml`, so new patterns can
//! be added without touching code.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_SECURITY: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/security.toml"));

/// Pattern list applied to every language
pub const COMMON_KEY: &str = "common";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSecurityConfig {
    #[serde(default = "default_max_code_bytes")]
    max_code_bytes: usize,
    #[serde(default = "default_max_stdin_bytes")]
    max_stdin_bytes: usize,
    #[serde(default = "default_violation_threshold")]
    violation_threshold: u32,
    violation_window_secs: Option<u64>,
    #[serde(default)]
    patterns: HashMap<String, Vec<RawPattern>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPattern {
    name: String,
    regex: String,
}

fn default_max_code_bytes() -> usize {
    64 * 1024
}

fn default_max_stdin_bytes() -> usize {
    1024 * 1024
}

fn default_violation_threshold() -> u32 {
    3
}

/// One named forbidden construct
#[derive(Debug, Clone)]
pub struct ForbiddenPattern {
    pub name: String,
    pub regex: Regex,
}

/// Compiled per-language pattern lists
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    common: Vec<ForbiddenPattern>,
    by_language: HashMap<String, Vec<ForbiddenPattern>>,
}

impl PatternSet {
    /// First pattern matching `code`, language-specific lists before common ones
    pub fn find_match(&self, language: &str, code: &str) -> Option<&ForbiddenPattern> {
        self.by_language
            .get(language)
            .into_iter()
            .flatten()
            .chain(self.common.iter())
            .find(|pattern| pattern.regex.is_match(code))
    }

    pub fn len(&self) -> usize {
        self.common.len() + self.by_language.values().map(Vec::len).sum::<usize>()
    }
}

/// Parsed and compiled gate configuration
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub max_code_bytes: usize,
    pub max_stdin_bytes: usize,
    pub violation_threshold: u32,
    pub violation_window: Option<Duration>,
    pub patterns: PatternSet,
}

impl SecurityConfig {
    /// Load from `path`, or from the embedded default file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&content)
            }
            None => Self::from_toml_str(DEFAULT_SECURITY),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawSecurityConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            what: "security configuration".to_string(),
            source,
        })?;

        if raw.max_code_bytes == 0 || raw.max_stdin_bytes == 0 {
            return Err(ConfigError::Security(
                "size limits must be greater than zero".to_string(),
            ));
        }
        if raw.violation_threshold == 0 {
            return Err(ConfigError::Security(
                "violation_threshold must be at least 1".to_string(),
            ));
        }
        if raw.violation_window_secs == Some(0) {
            return Err(ConfigError::Security(
                "violation_window_secs must be greater than zero when set".to_string(),
            ));
        }

        let mut patterns = PatternSet::default();
        for (language, raw_patterns) in raw.patterns {
            let language = language.trim().to_lowercase();
            let compiled = raw_patterns
                .into_iter()
                .map(|p| {
                    Regex::new(&p.regex)
                        .map(|regex| ForbiddenPattern {
                            name: p.name.clone(),
                            regex,
                        })
                        .map_err(|source| ConfigError::Pattern {
                            language: language.clone(),
                            name: p.name,
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            if language == COMMON_KEY {
                patterns.common = compiled;
            } else {
                patterns.by_language.insert(language, compiled);
            }
        }

        Ok(Self {
            max_code_bytes: raw.max_code_bytes,
            max_stdin_bytes: raw.max_stdin_bytes,
            violation_threshold: raw.violation_threshold,
            violation_window: raw.violation_window_secs.map(Duration::from_secs),
            patterns,
        })
    }
}
