//! Time-expiring storage for in-flight publish jobs
//!
//! A job must survive between independent invocations (a CLI poll, a daemon
//! tick) but must not outlive the remote containers it refers to, so every
//! entry carries a ttl and silently disappears once it lapses. Writers renew
//! the ttl by writing the job again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{DbError, Result};
use crate::types::PublishJob;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store `job` under `key`, replacing any previous value, for `ttl`
    async fn put(&self, key: &str, job: &PublishJob, ttl: Duration) -> Result<()>;

    /// Fetch a live job; expired entries read as absent
    async fn get(&self, key: &str) -> Result<Option<PublishJob>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local job store
///
/// Only useful when every invocation shares one process (tests, a single
/// daemon). The binaries use the SQLite store on [`crate::db::Database`].
#[derive(Default)]
pub struct MemoryJobStore {
    entries: Mutex<HashMap<String, (PublishJob, Instant)>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, expires)| *expires > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, (PublishJob, Instant)>>> {
        self.entries.lock().map_err(|_| DbError::LockPoisoned.into())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, key: &str, job: &PublishJob, ttl: Duration) -> Result<()> {
        self.lock()?
            .insert(key.to_string(), (job.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<PublishJob>> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        entries.retain(|_, (_, expires)| *expires > now);

        Ok(entries.get(key).map(|(job, _)| job.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PublishJob {
        PublishJob::new("post-1".to_string(), vec![], "caption".to_string(), false)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryJobStore::new();
        let job = job();

        store.put(&job.key, &job, Duration::from_secs(60)).await.unwrap();
        let loaded = store.get(&job.key).await.unwrap().unwrap();
        assert_eq!(loaded.correlation_id, "post-1");
        assert_eq!(store.len(), 1);

        store.delete(&job.key).await.unwrap();
        assert!(store.get(&job.key).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_entry_expires_without_cleanup() {
        let store = MemoryJobStore::new();
        let job = job();

        store.put(&job.key, &job, Duration::from_millis(30)).await.unwrap();
        assert!(store.get(&job.key).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get(&job.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_renews_ttl() {
        let store = MemoryJobStore::new();
        let job = job();

        store.put(&job.key, &job, Duration::from_millis(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.put(&job.key, &job, Duration::from_millis(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.get(&job.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_poisoned_lock_is_an_error() {
        let store = std::sync::Arc::new(MemoryJobStore::new());
        let job = job();
        store.put(&job.key, &job, Duration::from_secs(60)).await.unwrap();

        let poisoner = std::sync::Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison the job store");
        })
        .join();

        assert!(store.get(&job.key).await.is_err());
        assert!(store.put(&job.key, &job, Duration::from_secs(60)).await.is_err());
        assert!(store.delete(&job.key).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let store = MemoryJobStore::new();
        assert!(store.get("gram_job_missing").await.unwrap().is_none());
        store.delete("gram_job_missing").await.unwrap();
    }
}
