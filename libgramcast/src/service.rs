//! Service layer for Gramcast
//!
//! `GramcastService` turns a loaded [`Config`] into the components every
//! binary needs, so `gram-post`, `gram-queue` and `gram-send` share one
//! wiring and one SQLite database: a job started by one tool can be advanced
//! by another.
//!
//! ```no_run
//! use libgramcast::service::GramcastService;
//! use libgramcast::Config;
//!
//! # async fn example() -> libgramcast::Result<()> {
//! let service = GramcastService::from_config(Config::load()?).await?;
//! let report = service.reporter().status("gram_job_...").await;
//! println!("{}", serde_json::to_string(&report).unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{expand_path, Config};
use crate::credentials::{CredentialProvider, FileCredentials, StaticCredentials};
use crate::crop::{cleanup_temp_dir, jpeg::JpegCropper, ImageCropper};
use crate::db::Database;
use crate::error::{ConfigError, Result};
use crate::graph::{instagram::InstagramClient, PublishClient};
use crate::publisher::{PublishSettings, Publisher};
use crate::scheduler::Scheduler;
use crate::status::StatusReporter;

pub struct GramcastService {
    config: Arc<Config>,
    db: Database,
    client: Arc<dyn PublishClient>,
    credentials: Arc<dyn CredentialProvider>,
    publisher: Arc<Publisher>,
    scheduler: Scheduler,
    reporter: StatusReporter,
}

impl GramcastService {
    /// Create a service with default configuration
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Build the real Graph client, token store and JPEG cropper for `config`
    ///
    /// Credentials come from `GRAMCAST_ACCESS_TOKEN`/`GRAMCAST_ACCOUNT_ID`
    /// when both are set, otherwise from `instagram.token_file`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let client: Arc<dyn PublishClient> = Arc::new(InstagramClient::new(
            &config.instagram.api_base,
            config.publishing.request_timeout(),
        )?);

        let credentials: Arc<dyn CredentialProvider> = match StaticCredentials::from_env() {
            Some(env) => {
                debug!("Using Instagram credential from environment");
                Arc::new(env)
            }
            None => Arc::new(FileCredentials::load(&expand_path(
                &config.instagram.token_file,
            ))?),
        };

        let cropper: Arc<dyn ImageCropper> = Arc::new(JpegCropper::new(
            expand_path(&config.media.temp_dir),
            &config.media.public_base_url,
        ));

        Self::with_components(config, client, credentials, cropper).await
    }

    /// Wire explicit collaborators around the configured database
    pub async fn with_components(
        config: Config,
        client: Arc<dyn PublishClient>,
        credentials: Arc<dyn CredentialProvider>,
        cropper: Arc<dyn ImageCropper>,
    ) -> Result<Self> {
        let db_path = expand_path(&config.database.path);
        let db_path_str = db_path
            .to_str()
            .ok_or_else(|| ConfigError::MissingField("Invalid database path".to_string()))?;
        let db = Database::new(db_path_str).await?;

        let offset = config.scheduling.offset()?;
        let publisher = Arc::new(Publisher::new(
            Arc::clone(&client),
            Arc::clone(&credentials),
            Arc::clone(&cropper),
            Arc::new(db.clone()),
            db.clone(),
            PublishSettings::from(&config.publishing),
        ));
        let scheduler = Scheduler::new(db.clone(), Arc::clone(&publisher), cropper, offset);
        let reporter = StatusReporter::new(Arc::clone(&publisher));

        Ok(Self {
            config: Arc::new(config),
            db,
            client,
            credentials,
            publisher,
            scheduler,
            reporter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn credentials(&self) -> &dyn CredentialProvider {
        self.credentials.as_ref()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    /// Refresh the access token if it expires within the refresh window
    ///
    /// Returns whether a refresh happened.
    pub async fn refresh_credentials_if_needed(&self) -> Result<bool> {
        if !self.credentials.needs_refresh() {
            return Ok(false);
        }
        self.credentials.refresh(self.client.as_ref()).await?;
        info!("Instagram access token refreshed");
        Ok(true)
    }

    /// Delete cropped images older than `media.temp_max_age_secs`
    pub fn cleanup_temp_files(&self) -> Result<usize> {
        cleanup_temp_dir(
            &expand_path(&self.config.media.temp_dir),
            Duration::from_secs(self.config.media.temp_max_age_secs),
        )
    }
}
