use serde::Deserialize;
use anyhow::Result;
use dotenvy::dotenv;
use std::str::FromStr;
use std::time::Duration;

pub const MAX_CHUNK_SIZE: usize = 10_000;
pub const MAX_BATCH_SIZE: usize = 500;

fn default_max_file_size() -> usize {
    // 50 MB in bytes
    50 * 1024 * 1024
}

fn default_streaming_threshold() -> usize {
    // 5 MB in bytes
    5 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub max_file_size: usize,
    /// Files above this size skip the whole-file analyzers.
    pub streaming_threshold: usize,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub engine: EngineConfig,
    pub session_idle_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub analysis_concurrency: usize,
    pub server_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_string(),
            connect_timeout: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(30_000),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1_000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            streaming_threshold: default_streaming_threshold(),
            chunk_size: 1_000,
            batch_size: 100,
            engine: EngineConfig::default(),
            session_idle_timeout: Duration::from_secs(600),
            session_sweep_interval: Duration::from_secs(60),
            analysis_concurrency: 4,
            server_port: 3000,
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        // Load .env file first
        dotenv().ok();

        let defaults = Config::default();
        let engine_defaults = EngineConfig::default();

        let engine = EngineConfig {
            base_url: std::env::var("ENGINE_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(engine_defaults.base_url),
            connect_timeout: env_or("ENGINE_CONNECT_TIMEOUT_MS", 5_000u64).map(Duration::from_millis)?,
            request_timeout: env_or("ENGINE_REQUEST_TIMEOUT_MS", 30_000u64).map(Duration::from_millis)?,
            retry_attempts: env_or("ENGINE_RETRY_ATTEMPTS", engine_defaults.retry_attempts)?.max(1),
            retry_backoff: env_or("ENGINE_RETRY_BACKOFF_MS", 1_000u64).map(Duration::from_millis)?,
        };

        Ok(Config {
            max_file_size: env_or("SHEET_MAX_FILE_SIZE", defaults.max_file_size)?,
            streaming_threshold: env_or("SHEET_STREAMING_THRESHOLD", defaults.streaming_threshold)?,
            chunk_size: env_or("SHEET_CHUNK_SIZE", defaults.chunk_size)?.clamp(1, MAX_CHUNK_SIZE),
            batch_size: env_or("SHEET_BATCH_SIZE", defaults.batch_size)?.clamp(1, MAX_BATCH_SIZE),
            engine,
            session_idle_timeout: env_or("SESSION_IDLE_TIMEOUT_SECS", 600u64).map(Duration::from_secs)?,
            session_sweep_interval: env_or("SESSION_SWEEP_INTERVAL_SECS", 60u64).map(Duration::from_secs)?,
            analysis_concurrency: env_or("ANALYSIS_CONCURRENCY", defaults.analysis_concurrency)?.max(1),
            server_port: env_or("SERVER_PORT", defaults.server_port)?,
        })
    }
}

pub fn load_config() -> Result<Config> {
    let config = Config::new()?;
    tracing::info!(
        "Configuration loaded: engine={}, max_file_size={}B, chunk_size={}, batch_size={}",
        config.engine.base_url,
        config.max_file_size,
        config.chunk_size,
        config.batch_size
    );
    Ok(config)
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_limits() {
        let config = Config::default();
        assert_eq!(config.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.chunk_size, 1_000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.engine.retry_attempts, 3);
        assert_eq!(config.session_idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn env_or_rejects_malformed_numbers() {
        std::env::set_var("SHEET_INSIGHT_TEST_BAD_NUMBER", "ten");
        let parsed: Result<usize> = env_or("SHEET_INSIGHT_TEST_BAD_NUMBER", 1);
        assert!(parsed.is_err());
        std::env::remove_var("SHEET_INSIGHT_TEST_BAD_NUMBER");

        let fallback: usize = env_or("SHEET_INSIGHT_TEST_UNSET", 7).unwrap();
        assert_eq!(fallback, 7);
    }
}
