use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which isolation provider runs submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Docker,
    Local,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(Backend::Docker),
            "local" => Ok(Backend::Local),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub max_workers: usize,
    pub problems_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub backend: Backend,
    /// Limits used for prewarmed sandboxes
    pub default_time_limit_secs: f64,
    pub default_memory_limit_mb: u64,
    pub pool_freshness: Duration,
    pub compile_timeout: Duration,
    /// Memory cap of the sandbox a submission is compiled in
    pub compile_memory_limit_mb: u64,
    pub output_limit_bytes: usize,
    /// How many terminal submissions the server keeps around
    pub submission_retention: usize,
    pub image_python: String,
    pub image_cpp: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            max_workers: parse_var("MAX_WORKERS").unwrap_or(3).max(1),
            problems_dir: env::var("PROBLEMS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("problems")),
            artifacts_dir: env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("tmp")),
            backend: parse_var("JUDGE_BACKEND").unwrap_or(Backend::Docker),
            default_time_limit_secs: parse_var("DEFAULT_TIME_LIMIT_SECS").unwrap_or(2.0),
            default_memory_limit_mb: parse_var("DEFAULT_MEMORY_LIMIT_MB").unwrap_or(100),
            pool_freshness: Duration::from_secs(parse_var("POOL_FRESHNESS_SECS").unwrap_or(30)),
            compile_timeout: Duration::from_millis(
                parse_var("COMPILE_TIMEOUT_MS").unwrap_or(10_000),
            ),
            compile_memory_limit_mb: parse_var("COMPILE_MEMORY_LIMIT_MB").unwrap_or(512),
            output_limit_bytes: parse_var("OUTPUT_LIMIT_BYTES").unwrap_or(1024 * 1024),
            submission_retention: parse_var("SUBMISSION_RETENTION").unwrap_or(100),
            image_python: env::var("IMAGE_PYTHON")
                .unwrap_or_else(|_| "python:3.12-slim".to_string()),
            image_cpp: env::var("IMAGE_CPP").unwrap_or_else(|_| "gcc:12".to_string()),
            port: parse_var("PORT").unwrap_or(3000),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.default_time_limit_secs, 2.0);
        assert_eq!(config.default_memory_limit_mb, 100);
        assert_eq!(config.pool_freshness, Duration::from_secs(30));
        assert_eq!(config.compile_memory_limit_mb, 512);
        assert_eq!(config.backend, Backend::Docker);
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("LOCAL".parse::<Backend>(), Ok(Backend::Local));
        assert_eq!("docker".parse::<Backend>(), Ok(Backend::Docker));
        assert!("firecracker".parse::<Backend>().is_err());
    }
}
