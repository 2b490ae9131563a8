//! Language profile registry
//!
//! Static mapping from a language key to everything the sandbox needs to
//! build and run it: container image, source file name, compile and run
//! argv, normalization rule and resource ceilings. Loaded once at startup
//! and read-only afterwards.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_LANGUAGES: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Upper bound for any configured run timeout. Callers keep their own
/// backstop above this.
pub const MAX_RUN_TIMEOUT_MS: u64 = 60_000;

/// Resource ceilings for one language.
///
/// Every profile carries a complete set; fields missing from the TOML are
/// filled from the defaults below at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    /// Memory ceiling for the run step in MB (swap is pinned to the same value)
    pub memory_mb: u32,
    /// CPU share, in cores
    pub cpus: f32,
    /// Maximum concurrent processes/threads inside the container
    pub pids: u32,
    /// Wall-clock limit for the run step
    pub timeout_ms: u64,
    /// Size of the writable /tmp tmpfs in MB
    pub tmpfs_mb: u32,
    /// Wall-clock limit for the compile step
    pub compile_timeout_ms: u64,
    /// Memory ceiling for the compile step in MB
    pub compile_memory_mb: u32,
    /// Process/thread ceiling for the compile step
    pub compile_pids: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpus: 1.0,
            pids: 64,
            timeout_ms: 5_000,
            tmpfs_mb: 64,
            compile_timeout_ms: 15_000,
            compile_memory_mb: 1024,
            compile_pids: 256,
        }
    }
}

impl SandboxLimits {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    /// Worst-case time the sandbox itself may take, plus the caller's margin.
    /// Used for the caller-layer safety timer.
    pub fn backstop(&self, has_compile_step: bool, margin: Duration) -> Duration {
        let compile = if has_compile_step {
            self.compile_timeout()
        } else {
            Duration::ZERO
        };
        compile + self.run_timeout() + margin
    }
}

/// Language-specific source rewriting applied before staging
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum NormalizeRule {
    /// Pass the code through untouched
    #[default]
    None,
    /// Prepend a header line (e.g. `#include <stdio.h>`) when it is absent
    EnsureInclude { header: String },
    /// Force a single public class with a fixed name and a static main
    JavaMain {
        #[serde(default = "default_class_name")]
        class_name: String,
    },
}

fn default_class_name() -> String {
    "Main".to_string()
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    /// Canonical language key (e.g. "cpp")
    pub key: String,
    /// Container image reference
    pub image: String,
    /// Name of the source file inside the staging directory (e.g. "main.cpp")
    pub source_file: String,
    /// Compile argv (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run argv
    pub run_command: Vec<String>,
    /// Extra environment passed into the container (KEY=VALUE)
    pub env: Vec<String>,
    /// Source normalization rule
    pub normalize: NormalizeRule,
    /// Resource ceilings
    pub limits: SandboxLimits,
}

impl LanguageProfile {
    pub fn has_compile_step(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLanguageProfile {
    image: String,
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    normalize: Option<NormalizeRule>,
    #[serde(default)]
    limits: RawLimits,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLimits {
    memory_mb: Option<u32>,
    cpus: Option<f32>,
    pids: Option<u32>,
    timeout_ms: Option<u64>,
    tmpfs_mb: Option<u32>,
    compile_timeout_ms: Option<u64>,
    compile_memory_mb: Option<u32>,
    compile_pids: Option<u32>,
}

impl RawLimits {
    fn resolve(self) -> SandboxLimits {
        let d = SandboxLimits::default();
        SandboxLimits {
            memory_mb: self.memory_mb.unwrap_or(d.memory_mb),
            cpus: self.cpus.unwrap_or(d.cpus),
            pids: self.pids.unwrap_or(d.pids),
            timeout_ms: self.timeout_ms.unwrap_or(d.timeout_ms),
            tmpfs_mb: self.tmpfs_mb.unwrap_or(d.tmpfs_mb),
            compile_timeout_ms: self.compile_timeout_ms.unwrap_or(d.compile_timeout_ms),
            compile_memory_mb: self.compile_memory_mb.unwrap_or(d.compile_memory_mb),
            compile_pids: self.compile_pids.unwrap_or(d.compile_pids),
        }
    }
}

/// Registry of language profiles, keyed by lower-cased name and aliases
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    by_name: HashMap<String, Arc<LanguageProfile>>,
}

impl LanguageRegistry {
    /// Load profiles from `path`, or from the embedded default file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&content)
            }
            None => Self::from_toml_str(DEFAULT_LANGUAGES),
        }
    }

    /// Parse and validate a languages TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw_profiles: HashMap<String, RawLanguageProfile> =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                what: "language profiles".to_string(),
                source,
            })?;

        let mut by_name = HashMap::new();

        for (name, raw) in raw_profiles {
            let key = name.trim().to_lowercase();
            let aliases = raw.aliases.clone();
            let profile = Arc::new(build_profile(&key, raw)?);

            for alias in std::iter::once(key.clone()).chain(aliases) {
                let alias = alias.trim().to_lowercase();
                if let Some(existing) = by_name.insert(alias.clone(), profile.clone()) {
                    return Err(ConfigError::Profile {
                        language: key,
                        reason: format!("name `{}` already used by `{}`", alias, existing.key),
                    });
                }
            }
        }

        Ok(Self { by_name })
    }

    /// Resolve a language key or alias, case-insensitively
    pub fn resolve(&self, language: &str) -> Option<Arc<LanguageProfile>> {
        self.by_name.get(&language.trim().to_lowercase()).cloned()
    }

    /// Canonical keys of all supported languages, sorted
    pub fn languages(&self) -> Vec<String> {
        self.by_name
            .values()
            .map(|p| p.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Each distinct profile once
    pub fn profiles(&self) -> Vec<Arc<LanguageProfile>> {
        let mut seen = BTreeSet::new();
        let mut profiles: Vec<_> = self
            .by_name
            .values()
            .filter(|p| seen.insert(p.key.clone()))
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.key.cmp(&b.key));
        profiles
    }
}

fn build_profile(key: &str, raw: RawLanguageProfile) -> Result<LanguageProfile, ConfigError> {
    let invalid = |reason: String| ConfigError::Profile {
        language: key.to_string(),
        reason,
    };

    validate_image_name(&raw.image).map_err(invalid)?;

    if raw.source_file.trim().is_empty() || raw.source_file.contains('/') {
        return Err(invalid(format!("bad source_file {:?}", raw.source_file)));
    }

    let run_command = into_command(&raw.run_command);
    if run_command.is_empty() {
        return Err(invalid("run_command is empty".to_string()));
    }

    let compile_command = match raw.compile_command {
        Some(cmd) => {
            let cmd = into_command(&cmd);
            if cmd.is_empty() {
                return Err(invalid("compile_command is empty".to_string()));
            }
            Some(cmd)
        }
        None => None,
    };

    for var in &raw.env {
        if !var.contains('=') || var.starts_with('=') {
            return Err(invalid(format!("env entry {:?} is not KEY=VALUE", var)));
        }
    }

    let limits = raw.limits.resolve();
    if limits.memory_mb == 0
        || limits.pids == 0
        || limits.timeout_ms == 0
        || limits.tmpfs_mb == 0
        || limits.compile_timeout_ms == 0
        || limits.compile_memory_mb == 0
        || limits.compile_pids == 0
        || !(limits.cpus > 0.0)
    {
        return Err(invalid("limits must be greater than zero".to_string()));
    }
    if limits.timeout_ms > MAX_RUN_TIMEOUT_MS {
        return Err(invalid(format!(
            "timeout_ms {} exceeds maximum {}",
            limits.timeout_ms, MAX_RUN_TIMEOUT_MS
        )));
    }

    Ok(LanguageProfile {
        key: key.to_string(),
        image: raw.image,
        source_file: raw.source_file,
        compile_command,
        run_command,
        env: raw.env,
        normalize: raw.normalize.unwrap_or_default(),
        limits,
    })
}

/// Image references end up as a CLI argument; keep them to the usual charset
fn validate_image_name(image: &str) -> Result<(), String> {
    if image.is_empty() || image.len() > 256 {
        return Err(format!("bad image reference {:?}", image));
    }
    if image.starts_with(['-', '.', ':']) {
        return Err(format!("image reference {:?} starts with {:?}", image, &image[..1]));
    }
    if let Some(ch) = image
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || "-.:/_@".contains(*ch)))
    {
        return Err(format!("image reference contains invalid character {:?}", ch));
    }
    Ok(())
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
