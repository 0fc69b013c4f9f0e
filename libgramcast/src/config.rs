//! Configuration management for Gramcast

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

pub const DEFAULT_API_BASE: &str = "https://graph.instagram.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub instagram: InstagramConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// TOML file holding `access_token`, `account_id` and `expires_at`
    #[serde(default = "default_token_file")]
    pub token_file: String,
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_file: default_token_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingConfig {
    /// Lifetime of an in-flight publish job, renewed on each progress step
    #[serde(default = "default_job_ttl")]
    pub job_ttl_secs: u64,
    /// Age after which a publish lease may be taken over
    #[serde(default = "default_lease_stale")]
    pub lease_stale_secs: u64,
    /// Target width/height ratio for the fallback crop
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: default_job_ttl(),
            lease_stale_secs: default_lease_stale(),
            aspect_ratio: default_aspect_ratio(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl PublishingConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Zone in which naive schedule times are interpreted, e.g. "+02:00"
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            utc_offset: default_utc_offset(),
        }
    }
}

impl SchedulingConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory cropped JPEGs are written to
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Public URL under which `temp_dir` is served to Instagram
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default = "default_temp_max_age")]
    pub temp_max_age_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            public_base_url: String::new(),
            temp_max_age_secs: default_temp_max_age(),
        }
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_token_file() -> String {
    "~/.config/gramcast/instagram.toml".to_string()
}

fn default_job_ttl() -> u64 {
    300
}

fn default_lease_stale() -> u64 {
    180
}

fn default_aspect_ratio() -> f64 {
    1.0
}

fn default_request_timeout() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    60
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_temp_dir() -> String {
    "~/.local/share/gramcast/temp".to_string()
}

fn default_temp_max_age() -> u64 {
    24 * 60 * 60
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;

        if let Ok(db_path) = std::env::var("GRAMCAST_DB_PATH") {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }

        if !(self.publishing.aspect_ratio.is_finite() && self.publishing.aspect_ratio > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "publishing.aspect_ratio".to_string(),
                reason: "must be a positive number".to_string(),
            }
            .into());
        }

        if self.publishing.job_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "publishing.job_ttl_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }

        self.check_poll_interval(self.scheduling.poll_interval_secs)?;
        self.scheduling.offset()?;
        Ok(())
    }

    /// A processing post is only followed up on the next poll, so its job
    /// must still be stored by then
    pub fn check_poll_interval(&self, poll_interval_secs: u64) -> Result<()> {
        if poll_interval_secs >= self.publishing.job_ttl_secs {
            return Err(ConfigError::InvalidValue {
                field: "scheduling.poll_interval_secs".to_string(),
                reason: format!(
                    "{}s must be shorter than publishing.job_ttl_secs ({}s)",
                    poll_interval_secs, self.publishing.job_ttl_secs
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/gramcast/gramcast.db".to_string(),
            },
            instagram: InstagramConfig::default(),
            publishing: PublishingConfig::default(),
            scheduling: SchedulingConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("GRAMCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("gramcast").join("config.toml"))
}

/// Expand `~` in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Parse a UTC offset such as "+02:00", "-0530" or "Z"
pub fn parse_utc_offset(input: &str) -> Result<FixedOffset> {
    let invalid = || ConfigError::InvalidValue {
        field: "scheduling.utc_offset".to_string(),
        reason: format!("'{}' is not an offset like +02:00", input),
    };

    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| invalid().into());
    }

    let (sign, rest) = if let Some(rest) = trimmed.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(invalid().into());
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid().into());
    }

    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid().into());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| invalid().into())
}
