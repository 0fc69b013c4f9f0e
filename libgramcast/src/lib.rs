//! Gramcast - publish images to Instagram from the command line
//!
//! This library drives the Instagram Graph API container workflow: cropping
//! images, creating and polling containers, assembling carousels, and
//! publishing, with durable job state so a post can be resumed by a later,
//! independent invocation.

pub mod config;
pub mod credentials;
pub mod crop;
pub mod db;
pub mod error;
pub mod graph;
pub mod jobs;
pub mod logging;
pub mod publisher;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{Credential, CredentialProvider, FileCredentials, StaticCredentials};
pub use db::Database;
pub use error::{GramcastError, Result};
pub use jobs::{JobStore, MemoryJobStore};
pub use publisher::{Outcome, Progress, PublishSettings, Publisher};
pub use scheduler::{NewScheduledPost, Scheduler, TickReport};
pub use service::GramcastService;
pub use status::{StatusReport, StatusReporter};
pub use types::{
    CropRect, ImageSource, PublishJob, PublishRequest, PublishResult, ScheduledPost,
    ScheduledStatus, SharedImage,
};
