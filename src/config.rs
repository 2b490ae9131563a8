//! Worker configuration
//!
//! Loaded once at startup from environment variables (and `.env` via
//! dotenvy in `main`). Every knob has a default so a bare worker starts.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process-wide configuration for the execution worker
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// List key jobs are popped from
    pub queue_name: String,
    /// Language profile file (None = embedded default)
    pub languages_path: Option<PathBuf>,
    /// Gate configuration file (None = embedded default)
    pub security_path: Option<PathBuf>,
    /// Container runtime CLI binary
    pub runtime_binary: String,
    /// Parent directory of per-run staging directories
    pub staging_root: PathBuf,
    /// Maximum simultaneous sandbox runs
    pub max_concurrent_runs: usize,
    /// Extra time the caller-layer backstop allows beyond the sandbox limits
    pub backstop_margin: Duration,
    /// Pull every profile image at startup
    pub prepull_images: bool,
    /// Expiry of result lists in Redis (seconds)
    pub result_ttl_secs: u64,
    /// Combined output cap per run (bytes)
    pub max_output_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "executor:queue".to_string(),
            languages_path: None,
            security_path: None,
            runtime_binary: "docker".to_string(),
            staging_root: env::temp_dir().join("executor"),
            max_concurrent_runs: 4,
            backstop_margin: Duration::from_millis(5_000),
            prepull_images: false,
            result_ttl_secs: 300,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_name: env::var("EXECUTOR_QUEUE").unwrap_or(defaults.queue_name),
            languages_path: env::var("LANGUAGES_CONFIG").ok().map(PathBuf::from),
            security_path: env::var("SECURITY_CONFIG").ok().map(PathBuf::from),
            runtime_binary: env::var("CONTAINER_RUNTIME").unwrap_or(defaults.runtime_binary),
            staging_root: env::var("STAGING_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_root),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", defaults.max_concurrent_runs)
                .max(1),
            backstop_margin: Duration::from_millis(env_parse("BACKSTOP_MARGIN_MS", 5_000u64)),
            prepull_images: env_parse("PREPULL_IMAGES", defaults.prepull_images),
            result_ttl_secs: env_parse("RESULT_TTL_SECS", defaults.result_ttl_secs),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", defaults.max_output_bytes),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_name, "executor:queue");
        assert_eq!(config.runtime_binary, "docker");
        assert_eq!(config.max_concurrent_runs, 4);
        assert!(config.languages_path.is_none());
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("EXECUTOR_TEST_ENV_PARSE", "not-a-number");
        assert_eq!(env_parse("EXECUTOR_TEST_ENV_PARSE", 7u32), 7);
        std::env::set_var("EXECUTOR_TEST_ENV_PARSE", " 12 ");
        assert_eq!(env_parse("EXECUTOR_TEST_ENV_PARSE", 7u32), 12);
        std::env::remove_var("EXECUTOR_TEST_ENV_PARSE");
    }
}
