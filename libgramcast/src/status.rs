//! Caller-facing view of a publish job
//!
//! Checking status advances the job: [`StatusReporter::status`] runs one
//! round of [`Publisher::continue_job`] and translates the outcome.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::publisher::{Outcome, Progress, Publisher};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusReport {
    /// Containers are still being processed by Instagram
    Processing {
        job_key: String,
        ready_count: usize,
        pending_count: usize,
        total_count: usize,
    },
    /// All containers are ready and another caller is publishing
    Publishing {
        job_key: String,
        ready_count: usize,
        pending_count: usize,
        total_count: usize,
    },
    Completed {
        success: bool,
        media_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        permalink: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
        message: String,
    },
    Error {
        message: String,
    },
    NotFound,
}

impl StatusReport {
    /// Whether polling again could change the report
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing { .. } | Self::Publishing { .. })
    }
}

impl From<Outcome> for StatusReport {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed(result) => Self::Completed {
                success: result.success,
                media_id: result.media_id,
                permalink: result.permalink,
                warning: result.warning,
                message: result.message,
            },
            Outcome::Processing(Progress {
                job_key,
                ready,
                pending,
                total,
                publishing: true,
            }) => Self::Publishing {
                job_key,
                ready_count: ready,
                pending_count: pending,
                total_count: total,
            },
            Outcome::Processing(Progress {
                job_key,
                ready,
                pending,
                total,
                publishing: false,
            }) => Self::Processing {
                job_key,
                ready_count: ready,
                pending_count: pending,
                total_count: total,
            },
            Outcome::Failed(message) => Self::Error { message },
            Outcome::NotFound => Self::NotFound,
        }
    }
}

pub struct StatusReporter {
    publisher: Arc<Publisher>,
}

impl StatusReporter {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    /// Advance the job one round and report where it stands
    pub async fn status(&self, job_key: &str) -> StatusReport {
        self.publisher.continue_job(job_key).await.into()
    }
}
