use crate::error::ConfigError;
use std::env;
use std::time::Duration;

pub const ENV_BASE_URL: &str = "OPWATCH_BASE_URL";
pub const ENV_RESOURCE_PREFIX: &str = "OPWATCH_RESOURCE_PREFIX";
pub const ENV_TOKEN: &str = "OPWATCH_TOKEN";
pub const ENV_POLL_INTERVAL_MS: &str = "OPWATCH_POLL_INTERVAL_MS";
pub const ENV_POLL_JITTER_PCT: &str = "OPWATCH_POLL_JITTER_PCT";
pub const ENV_MAX_FAILED_POLLS: &str = "OPWATCH_MAX_FAILED_POLLS";
pub const ENV_MAX_POLL_SECS: &str = "OPWATCH_MAX_POLL_SECS";
pub const ENV_REFRESH_WINDOW_MS: &str = "OPWATCH_REFRESH_WINDOW_MS";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "OPWATCH_HTTP_TIMEOUT_SECS";
pub const ENV_VERIFY_FAILED_TARGETS: &str = "OPWATCH_VERIFY_FAILED_TARGETS";
pub const ENV_DB_URL: &str = "OPWATCH_DB_URL";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_RESOURCE_PREFIX: &str = "docker";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_POLL_JITTER_PCT: u64 = 20;
pub const DEFAULT_MAX_FAILED_POLLS: u64 = 30;
pub const DEFAULT_MAX_POLL_SECS: u64 = 3_600; // 0 disables the duration cap
pub const DEFAULT_REFRESH_WINDOW_MS: u64 = 500;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub base_url: String,
    pub resource_prefix: String,
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub poll_jitter_pct: u8,
    pub max_failed_polls: u32,
    pub max_poll_duration: Option<Duration>,
    pub refresh_window: Duration,
    pub http_timeout: Duration,
    pub verify_failed_targets: bool,
    pub db_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            resource_prefix: DEFAULT_RESOURCE_PREFIX.to_string(),
            token: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_jitter_pct: DEFAULT_POLL_JITTER_PCT as u8,
            max_failed_polls: DEFAULT_MAX_FAILED_POLLS as u32,
            max_poll_duration: Some(Duration::from_secs(DEFAULT_MAX_POLL_SECS)),
            refresh_window: Duration::from_millis(DEFAULT_REFRESH_WINDOW_MS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            verify_failed_targets: true,
            db_url: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from any name → value source. Unset or blank values
    /// fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                }),
                None => Ok(default),
            }
        };

        let jitter = number(ENV_POLL_JITTER_PCT, DEFAULT_POLL_JITTER_PCT)?;
        if jitter > 90 {
            return Err(ConfigError::Invalid {
                name: ENV_POLL_JITTER_PCT,
                value: jitter.to_string(),
            });
        }
        let interval_ms = number(ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS)?;
        if interval_ms == 0 {
            return Err(ConfigError::Invalid {
                name: ENV_POLL_INTERVAL_MS,
                value: "0".to_string(),
            });
        }
        let max_failed = number(ENV_MAX_FAILED_POLLS, DEFAULT_MAX_FAILED_POLLS)?.max(1);
        let max_secs = number(ENV_MAX_POLL_SECS, DEFAULT_MAX_POLL_SECS)?;

        let verify = match get(ENV_VERIFY_FAILED_TARGETS) {
            Some(raw) => parse_flag(&raw).ok_or(ConfigError::Invalid {
                name: ENV_VERIFY_FAILED_TARGETS,
                value: raw,
            })?,
            None => true,
        };

        Ok(Self {
            base_url: get(ENV_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            resource_prefix: lookup(ENV_RESOURCE_PREFIX)
                .map(|value| value.trim().trim_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_RESOURCE_PREFIX.to_string()),
            token: get(ENV_TOKEN),
            poll_interval: Duration::from_millis(interval_ms),
            poll_jitter_pct: jitter as u8,
            max_failed_polls: max_failed.min(u32::MAX as u64) as u32,
            max_poll_duration: (max_secs > 0).then(|| Duration::from_secs(max_secs)),
            refresh_window: Duration::from_millis(number(
                ENV_REFRESH_WINDOW_MS,
                DEFAULT_REFRESH_WINDOW_MS,
            )?),
            http_timeout: Duration::from_secs(
                number(ENV_HTTP_TIMEOUT_SECS, DEFAULT_HTTP_TIMEOUT_SECS)?.max(1),
            ),
            verify_failed_targets: verify,
            db_url: get(ENV_DB_URL),
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
