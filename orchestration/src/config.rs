//! Environment-driven configuration.

use std::path::PathBuf;

/// Default stream broker URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Default project tag for channel namespacing.
pub const DEFAULT_PROJECT: &str = "wave";

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct WaveConfig {
    /// Stream broker URL (`REDIS_URL`).
    pub redis_url: String,
    /// Durable store location (`DATABASE_URL`); `None` means in-place
    /// under the working directory.
    pub database_path: Option<PathBuf>,
    /// Project tag (`WAVE_PROJECT`).
    pub project: String,
    /// Dispatch through the task queue instead of inline
    /// (`WAVE_DISTRIBUTED`).
    pub distributed: bool,
    /// Emergency-stop marker path (`WAVE_EMERGENCY_STOP_FILE`).
    pub emergency_stop_file: PathBuf,
    /// Retry budget per gate (`WAVE_MAX_RETRIES`).
    pub max_retries: u32,
    /// Coverage floor for gate-3 (`WAVE_REQUIRED_COVERAGE`).
    pub required_coverage: f64,
}

impl WaveConfig {
    /// Load configuration from the environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            redis_url: env_string("REDIS_URL", DEFAULT_REDIS_URL),
            database_path: std::env::var("DATABASE_URL").ok().map(PathBuf::from),
            project: env_string("WAVE_PROJECT", DEFAULT_PROJECT),
            distributed: env_bool("WAVE_DISTRIBUTED"),
            emergency_stop_file: PathBuf::from(env_string(
                "WAVE_EMERGENCY_STOP_FILE",
                crate::safety::emergency_stop::DEFAULT_STOP_FILE,
            )),
            max_retries: env_parse("WAVE_MAX_RETRIES", 3),
            required_coverage: env_parse("WAVE_REQUIRED_COVERAGE", 70.0),
        }
    }
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            database_path: None,
            project: DEFAULT_PROJECT.to_string(),
            distributed: false,
            emergency_stop_file: PathBuf::from(
                crate::safety::emergency_stop::DEFAULT_STOP_FILE,
            ),
            max_retries: 3,
            required_coverage: 70.0,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|value| {
            matches!(
                value.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WaveConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379/0");
        assert_eq!(config.project, "wave");
        assert!(!config.distributed);
        assert_eq!(
            config.emergency_stop_file,
            PathBuf::from(".claude/EMERGENCY-STOP")
        );
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_env_bool_parsing() {
        assert!(!env_bool("WAVE_TEST_UNSET_FLAG"));
        std::env::set_var("WAVE_TEST_FLAG_ON", "true");
        assert!(env_bool("WAVE_TEST_FLAG_ON"));
        std::env::set_var("WAVE_TEST_FLAG_OFF", "0");
        assert!(!env_bool("WAVE_TEST_FLAG_OFF"));
        std::env::remove_var("WAVE_TEST_FLAG_ON");
        std::env::remove_var("WAVE_TEST_FLAG_OFF");
    }
}
