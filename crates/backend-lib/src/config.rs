// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable prefix; nested keys use `__`
pub const ENV_PREFIX: &str = "CROWDPULSE_";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Data directory path
    pub data_dir: PathBuf,
    /// Log level
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: String,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Session lifecycle settings
    pub session: SessionSettings,
    /// Rate limiting settings
    pub rate_limit: RateLimitSettings,
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Sessions idle longer than this are evicted by the sweep
    pub idle_timeout_secs: u64,
    /// How often the sweep runs
    pub sweep_interval_secs: u64,
    /// How long an ended session's responses stay in the archive
    pub archive_retention_secs: u64,
    /// Join code length
    pub code_length: usize,
    /// Random draws before the timestamp fallback
    pub max_code_attempts: usize,
}

/// One category's window and budget
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowLimit {
    pub window_secs: u64,
    pub max_requests: u32,
}

/// Rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Block duration once a limit is exceeded
    pub block_secs: u64,
    /// How often expired records are purged
    pub cleanup_interval_secs: u64,
    pub connection: WindowLimit,
    pub join: WindowLimit,
    pub response: WindowLimit,
    pub command: WindowLimit,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            outbound_buffer: 64,
            session: SessionSettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            archive_retention_secs: 24 * 60 * 60,
            code_length: 6,
            max_code_attempts: 10,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            block_secs: 5 * 60,
            cleanup_interval_secs: 60,
            connection: WindowLimit {
                window_secs: 60,
                max_requests: 30,
            },
            join: WindowLimit {
                window_secs: 60,
                max_requests: 10,
            },
            response: WindowLimit {
                window_secs: 10,
                max_requests: 20,
            },
            command: WindowLimit {
                window_secs: 60,
                max_requests: 100,
            },
        }
    }
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn archive_retention(&self) -> Duration {
        Duration::from_secs(self.archive_retention_secs)
    }
}

impl Settings {
    /// Load settings with an explicit TOML file. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            bail!("invalid log level: {}", self.log_level);
        }
        if !LOG_FORMATS.contains(&self.log_format.as_str()) {
            bail!("invalid log format: {}", self.log_format);
        }
        if self.outbound_buffer == 0 {
            bail!("outbound_buffer must be greater than zero");
        }
        if self.session.idle_timeout_secs == 0 || self.session.sweep_interval_secs == 0 {
            bail!("session idle timeout and sweep interval must be greater than zero");
        }
        if !(crate::validation::MIN_CODE_LENGTH..=crate::validation::MAX_CODE_LENGTH)
            .contains(&self.session.code_length)
        {
            bail!("session code_length must be between 4 and 12");
        }
        let limits = [
            ("connection", self.rate_limit.connection),
            ("join", self.rate_limit.join),
            ("response", self.rate_limit.response),
            ("command", self.rate_limit.command),
        ];
        for (name, limit) in limits {
            if limit.window_secs == 0 || limit.max_requests == 0 {
                bail!("rate limit {name} must have a non-zero window and budget");
            }
        }
        Ok(())
    }
}
