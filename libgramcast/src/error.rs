//! Error types for Gramcast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GramcastError>;

#[derive(Error, Debug)]
pub enum GramcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Instagram API error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Image processing failed: {0}")]
    Media(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl GramcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            GramcastError::InvalidInput(_) => 3,
            GramcastError::Credential(_) => 2,
            GramcastError::Remote(RemoteError::Authentication(_)) => 2,
            GramcastError::Config(_) => 2,
            GramcastError::Remote(_) => 1,
            GramcastError::Database(_) => 1,
            GramcastError::Media(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Unknown scheduled post status: {0}")]
    UnknownStatus(String),

    #[error("Job store lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failures talking to the Instagram Graph API
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("API returned error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Response missing {0}")]
    MissingField(String),
}
