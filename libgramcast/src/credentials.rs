//! Instagram credential management
//!
//! The publish workflow needs a long-lived access token and the Instagram
//! account id it belongs to. Acquiring the first token (the OAuth dance) is
//! done elsewhere; this module stores the result, reports whether it is
//! still usable, and exchanges it for a fresh one before it lapses.
//!
//! Token file format (TOML):
//!
//! ```toml
//! access_token = "IGQ..."
//! account_id = "17841400000000000"
//! expires_at = 1767225600
//! ```

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{GramcastError, Result};
use crate::graph::PublishClient;

/// Lifetime Instagram grants a long-lived token, used when a refresh
/// response does not say
pub const TOKEN_LIFETIME_SECS: i64 = 60 * 24 * 60 * 60;

/// Tokens expiring within this window are refreshed
pub const REFRESH_BUFFER_SECS: i64 = 7 * 24 * 60 * 60;

/// Bearer token plus the account it acts for
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: SecretString,
    pub account_id: String,
}

impl Credential {
    pub fn new(token: &str, account_id: &str) -> Self {
        Self {
            token: SecretString::from(token.to_string()),
            account_id: account_id.to_string(),
        }
    }
}

/// Source of the credential used for publishing
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credential, if one is stored
    fn credential(&self) -> Option<Credential>;

    /// Unix timestamp at which the token stops working, if known
    fn expires_at(&self) -> Option<i64>;

    /// Whether a credential is present and not yet expired
    fn is_valid(&self) -> bool {
        match (self.credential(), self.expires_at()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(expires_at)) => chrono::Utc::now().timestamp() < expires_at,
        }
    }

    /// Whether the token is missing an expiry or expires within a week
    fn needs_refresh(&self) -> bool {
        if self.credential().is_none() {
            return false;
        }
        match self.expires_at() {
            None => true,
            Some(expires_at) => {
                chrono::Utc::now().timestamp() >= expires_at - REFRESH_BUFFER_SECS
            }
        }
    }

    /// Exchange the current token for a fresh one and store it
    async fn refresh(&self, client: &dyn PublishClient) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredToken {
    credential: Credential,
    expires_at: Option<i64>,
}

impl StoredToken {
    async fn refreshed(&self, client: &dyn PublishClient) -> Result<Self> {
        let fresh = client.refresh_token(&self.credential).await?;
        let lifetime = fresh.expires_in.unwrap_or(TOKEN_LIFETIME_SECS);

        Ok(Self {
            credential: Credential::new(&fresh.access_token, &self.credential.account_id),
            expires_at: Some(chrono::Utc::now().timestamp() + lifetime),
        })
    }
}

/// Credential held in memory, e.g. from environment variables or tests
pub struct StaticCredentials {
    token: Mutex<Option<StoredToken>>,
}

impl StaticCredentials {
    pub fn new(credential: Credential, expires_at: Option<i64>) -> Self {
        Self {
            token: Mutex::new(Some(StoredToken {
                credential,
                expires_at,
            })),
        }
    }

    /// A provider with no credential at all
    pub fn empty() -> Self {
        Self {
            token: Mutex::new(None),
        }
    }

    /// Read `GRAMCAST_ACCESS_TOKEN` and `GRAMCAST_ACCOUNT_ID`
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("GRAMCAST_ACCESS_TOKEN").ok()?;
        let account_id = std::env::var("GRAMCAST_ACCOUNT_ID").ok()?;
        if token.is_empty() || account_id.is_empty() {
            return None;
        }
        Some(Self::new(Credential::new(&token, &account_id), None))
    }

    fn snapshot(&self) -> Option<StoredToken> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn credential(&self) -> Option<Credential> {
        self.snapshot().map(|t| t.credential)
    }

    fn expires_at(&self) -> Option<i64> {
        self.snapshot().and_then(|t| t.expires_at)
    }

    async fn refresh(&self, client: &dyn PublishClient) -> Result<()> {
        let current = self
            .snapshot()
            .ok_or_else(|| GramcastError::Credential("No access token to refresh".to_string()))?;
        let fresh = current.refreshed(client).await?;

        if let Ok(mut guard) = self.token.lock() {
            *guard = Some(fresh);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    access_token: String,
    account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refreshed_at: Option<i64>,
}

/// Credential stored in a TOML token file, rewritten on refresh
pub struct FileCredentials {
    path: PathBuf,
    token: Mutex<Option<StoredToken>>,
}

impl FileCredentials {
    /// Load the token file at `path`
    ///
    /// A missing file yields a provider with no credential; a file that
    /// exists but cannot be parsed is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let token = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                GramcastError::Credential(format!(
                    "Failed to read token file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let file: TokenFile = toml::from_str(&content).map_err(|e| {
                GramcastError::Credential(format!(
                    "Invalid token file {}: {}",
                    path.display(),
                    e
                ))
            })?;

            if file.access_token.is_empty() || file.account_id.is_empty() {
                None
            } else {
                Some(StoredToken {
                    credential: Credential::new(&file.access_token, &file.account_id),
                    expires_at: file.expires_at,
                })
            }
        } else {
            tracing::debug!("Token file {} not found", path.display());
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            token: Mutex::new(token),
        })
    }

    /// Write a token to `path`, creating parent directories
    pub fn save(path: &Path, credential: &Credential, expires_at: Option<i64>) -> Result<()> {
        let file = TokenFile {
            access_token: credential.token.expose_secret().to_string(),
            account_id: credential.account_id.clone(),
            expires_at,
            refreshed_at: Some(chrono::Utc::now().timestamp()),
        };
        let content = toml::to_string(&file).map_err(|e| {
            GramcastError::Credential(format!("Failed to encode token file: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GramcastError::Credential(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(path, content).map_err(|e| {
            GramcastError::Credential(format!(
                "Failed to write token file {}: {}",
                path.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(
                |e| GramcastError::Credential(format!("Failed to set permissions: {}", e)),
            )?;
        }

        Ok(())
    }

    fn snapshot(&self) -> Option<StoredToken> {
        self.token.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl CredentialProvider for FileCredentials {
    fn credential(&self) -> Option<Credential> {
        self.snapshot().map(|t| t.credential)
    }

    fn expires_at(&self) -> Option<i64> {
        self.snapshot().and_then(|t| t.expires_at)
    }

    async fn refresh(&self, client: &dyn PublishClient) -> Result<()> {
        let current = self
            .snapshot()
            .ok_or_else(|| GramcastError::Credential("No access token to refresh".to_string()))?;
        let fresh = current.refreshed(client).await?;

        Self::save(&self.path, &fresh.credential, fresh.expires_at)?;
        tracing::info!(
            "Refreshed Instagram access token, valid until {}",
            fresh.expires_at.unwrap_or_default()
        );

        if let Ok(mut guard) = self.token.lock() {
            *guard = Some(fresh);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::mock::MockPublishClient;
    use serial_test::serial;
    use tempfile::TempDir;

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[test]
    fn test_credential_debug_hides_token() {
        let credential = Credential::new("super-secret", "acct");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("acct"));
    }

    #[test]
    fn test_validity_and_refresh_window() {
        let fresh = StaticCredentials::new(Credential::new("t", "a"), Some(now() + 30 * 86_400));
        assert!(fresh.is_valid());
        assert!(!fresh.needs_refresh());

        let expiring = StaticCredentials::new(Credential::new("t", "a"), Some(now() + 3 * 86_400));
        assert!(expiring.is_valid());
        assert!(expiring.needs_refresh());

        let expired = StaticCredentials::new(Credential::new("t", "a"), Some(now() - 10));
        assert!(!expired.is_valid());

        let no_expiry = StaticCredentials::new(Credential::new("t", "a"), None);
        assert!(no_expiry.is_valid());
        assert!(no_expiry.needs_refresh());
    }

    #[test]
    fn test_empty_provider() {
        let provider = StaticCredentials::empty();
        assert!(provider.credential().is_none());
        assert!(!provider.is_valid());
        assert!(!provider.needs_refresh());
    }

    #[tokio::test]
    async fn test_static_refresh_replaces_token() {
        let client = MockPublishClient::new();
        let provider = StaticCredentials::new(Credential::new("old", "acct"), Some(now() + 100));

        provider.refresh(&client).await.unwrap();

        let credential = provider.credential().unwrap();
        assert_eq!(credential.token.expose_secret(), "refreshed-token");
        assert_eq!(credential.account_id, "acct");
        assert!(provider.expires_at().unwrap() > now() + 59 * 86_400);
        assert_eq!(client.refresh_calls(), 1);
    }

    #[test]
    fn test_missing_token_file_is_empty_provider() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FileCredentials::load(&temp_dir.path().join("none.toml")).unwrap();
        assert!(provider.credential().is_none());
    }

    #[test]
    fn test_invalid_token_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("token.toml");
        std::fs::write(&path, "access_token = ").unwrap();

        let result = FileCredentials::load(&path);
        assert!(matches!(result, Err(GramcastError::Credential(_))));
    }

    #[tokio::test]
    async fn test_file_refresh_rewrites_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ig").join("token.toml");
        FileCredentials::save(&path, &Credential::new("old", "acct"), Some(now() + 100)).unwrap();

        let provider = FileCredentials::load(&path).unwrap();
        assert!(provider.needs_refresh());
        provider.refresh(&MockPublishClient::new()).await.unwrap();

        let reloaded = FileCredentials::load(&path).unwrap();
        assert_eq!(
            reloaded.credential().unwrap().token.expose_secret(),
            "refreshed-token"
        );
        assert!(!reloaded.needs_refresh());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("GRAMCAST_ACCESS_TOKEN", "env-token");
        std::env::set_var("GRAMCAST_ACCOUNT_ID", "env-acct");
        let provider = StaticCredentials::from_env();
        std::env::remove_var("GRAMCAST_ACCESS_TOKEN");
        std::env::remove_var("GRAMCAST_ACCOUNT_ID");

        let credential = provider.unwrap().credential().unwrap();
        assert_eq!(credential.account_id, "env-acct");
        assert!(StaticCredentials::from_env().is_none());
    }
}
