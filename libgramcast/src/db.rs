//! Database operations for Gramcast

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::jobs::JobStore;
use crate::types::{PublishJob, ScheduledPost, ScheduledStatus, SharedImage};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Store a newly scheduled post
    pub async fn create_scheduled_post(&self, post: &ScheduledPost) -> Result<()> {
        let images = serde_json::to_string(&post.images).map_err(DbError::Corrupt)?;
        let crops = serde_json::to_string(&post.crops).map_err(DbError::Corrupt)?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_posts
                (id, correlation_id, images, crops, caption, publish_at, created_at,
                 status, error_message, job_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.correlation_id)
        .bind(images)
        .bind(crops)
        .bind(&post.caption)
        .bind(post.publish_at)
        .bind(post.created_at)
        .bind(post.status.as_str())
        .bind(&post.error_message)
        .bind(&post.job_key)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a scheduled post by ID
    pub async fn get_scheduled_post(&self, id: &str) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query(
            r#"
            SELECT id, correlation_id, images, crops, caption, publish_at, created_at,
                   status, error_message, job_key
            FROM scheduled_posts WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| scheduled_post_from_row(&r)).transpose()
    }

    /// List scheduled posts, optionally for one correlation id, soonest first
    pub async fn list_scheduled_posts(
        &self,
        correlation_id: Option<&str>,
    ) -> Result<Vec<ScheduledPost>> {
        let rows = match correlation_id {
            Some(correlation_id) => sqlx::query(
                r#"
                SELECT id, correlation_id, images, crops, caption, publish_at, created_at,
                       status, error_message, job_key
                FROM scheduled_posts
                WHERE correlation_id = ?
                ORDER BY publish_at ASC, created_at ASC
                "#,
            )
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                r#"
                SELECT id, correlation_id, images, crops, caption, publish_at, created_at,
                       status, error_message, job_key
                FROM scheduled_posts
                ORDER BY publish_at ASC, created_at ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(scheduled_post_from_row).collect()
    }

    /// Posts the scheduler still has work for: pending and processing
    pub async fn get_active_scheduled_posts(&self) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, images, crops, caption, publish_at, created_at,
                   status, error_message, job_key
            FROM scheduled_posts
            WHERE status IN ('pending', 'processing')
            ORDER BY publish_at ASC, created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(scheduled_post_from_row).collect()
    }

    /// Update a scheduled post's status, error message and job key together
    pub async fn update_scheduled_status(
        &self,
        id: &str,
        status: ScheduledStatus,
        error_message: Option<&str>,
        job_key: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_posts SET status = ?, error_message = ?, job_key = ? WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(job_key)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Remove a scheduled post, returning whether it existed
    pub async fn delete_scheduled_post(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_posts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Append ledger entries, skipping images already recorded for the same
    /// correlation id. Returns how many were new.
    pub async fn record_shared_images(&self, entries: &[SharedImage]) -> Result<usize> {
        let mut inserted = 0;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO shared_images
                    (correlation_id, image_id, media_id, permalink, shared_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.correlation_id)
            .bind(&entry.image_id)
            .bind(&entry.media_id)
            .bind(&entry.permalink)
            .bind(entry.shared_at)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }

    /// Images already posted for a correlation id, oldest first
    pub async fn get_shared_images(&self, correlation_id: &str) -> Result<Vec<SharedImage>> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, image_id, media_id, permalink, shared_at
            FROM shared_images
            WHERE correlation_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| SharedImage {
                correlation_id: r.get("correlation_id"),
                image_id: r.get("image_id"),
                media_id: r.get("media_id"),
                permalink: r.get("permalink"),
                shared_at: r.get("shared_at"),
            })
            .collect())
    }

    /// Delete expired publish jobs, returning how many were removed
    pub async fn purge_expired_jobs(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM publish_jobs WHERE expires_at_ms <= ?")
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

fn scheduled_post_from_row(r: &SqliteRow) -> Result<ScheduledPost> {
    let images: String = r.get("images");
    let crops: String = r.get("crops");
    let status: String = r.get("status");

    Ok(ScheduledPost {
        id: r.get("id"),
        correlation_id: r.get("correlation_id"),
        images: serde_json::from_str(&images).map_err(DbError::Corrupt)?,
        crops: serde_json::from_str(&crops).map_err(DbError::Corrupt)?,
        caption: r.get("caption"),
        publish_at: r.get("publish_at"),
        created_at: r.get("created_at"),
        status: ScheduledStatus::parse(&status).ok_or(DbError::UnknownStatus(status))?,
        error_message: r.get("error_message"),
        job_key: r.get("job_key"),
    })
}

#[async_trait]
impl JobStore for Database {
    async fn put(&self, key: &str, job: &PublishJob, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(job).map_err(DbError::Corrupt)?;
        let expires_at_ms = chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;

        sqlx::query(
            r#"
            INSERT INTO publish_jobs (key, payload, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                expires_at_ms = excluded.expires_at_ms
            "#,
        )
        .bind(key)
        .bind(payload)
        .bind(expires_at_ms)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<PublishJob>> {
        self.purge_expired_jobs().await?;

        let row = sqlx::query("SELECT payload FROM publish_jobs WHERE key = ? AND expires_at_ms > ?")
            .bind(key)
            .bind(chrono::Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        match row {
            Some(r) => {
                let payload: String = r.get("payload");
                Ok(Some(serde_json::from_str(&payload).map_err(DbError::Corrupt)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM publish_jobs WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GramcastError;
    use crate::types::{CropRect, ImageSource};
    use tempfile::TempDir;

    async fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        (db, temp_dir)
    }

    fn scheduled(id: &str, correlation_id: &str, publish_at: i64) -> ScheduledPost {
        ScheduledPost {
            id: id.to_string(),
            correlation_id: correlation_id.to_string(),
            images: vec![ImageSource {
                id: "img-1".to_string(),
                reference: "/photos/1.jpg".to_string(),
                width: 1000,
                height: 500,
            }],
            crops: vec![Some(CropRect {
                x: 250.0,
                y: 0.0,
                width: 500.0,
                height: 500.0,
            })],
            caption: "Sunset".to_string(),
            publish_at,
            created_at: 1_700_000_000,
            status: ScheduledStatus::Pending,
            error_message: None,
            job_key: None,
        }
    }

    #[tokio::test]
    async fn test_database_initialization_with_invalid_path() {
        #[cfg(unix)]
        let invalid_path = "/tmp/test\0invalid.db";

        #[cfg(windows)]
        let invalid_path = "C:\\invalid<>path\\test.db";

        let result = Database::new(invalid_path).await;
        assert!(matches!(result, Err(GramcastError::Database(_))));
    }

    #[tokio::test]
    async fn test_database_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("test.db");

        Database::new(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_scheduled_post_roundtrip() {
        let (db, _temp_dir) = setup_test_db().await;
        let post = scheduled("s1", "post-7", 1_800_000_000);

        db.create_scheduled_post(&post).await.unwrap();
        let loaded = db.get_scheduled_post("s1").await.unwrap().unwrap();

        assert_eq!(loaded.correlation_id, "post-7");
        assert_eq!(loaded.images, post.images);
        assert_eq!(loaded.crops, post.crops);
        assert_eq!(loaded.status, ScheduledStatus::Pending);
        assert!(db.get_scheduled_post("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_correlation_id_orders_by_time() {
        let (db, _temp_dir) = setup_test_db().await;
        db.create_scheduled_post(&scheduled("late", "post-1", 300)).await.unwrap();
        db.create_scheduled_post(&scheduled("early", "post-1", 100)).await.unwrap();
        db.create_scheduled_post(&scheduled("other", "post-2", 200)).await.unwrap();

        let ids: Vec<String> = db
            .list_scheduled_posts(Some("post-1"))
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);

        assert_eq!(db.list_scheduled_posts(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_active_posts_exclude_failed() {
        let (db, _temp_dir) = setup_test_db().await;
        db.create_scheduled_post(&scheduled("a", "p", 100)).await.unwrap();
        db.create_scheduled_post(&scheduled("b", "p", 100)).await.unwrap();
        db.create_scheduled_post(&scheduled("c", "p", 100)).await.unwrap();

        db.update_scheduled_status("b", ScheduledStatus::Failed, Some("boom"), None)
            .await
            .unwrap();
        db.update_scheduled_status("c", ScheduledStatus::Processing, None, Some("gram_job_x"))
            .await
            .unwrap();

        let active: Vec<String> = db
            .get_active_scheduled_posts()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&"a".to_string()));
        assert!(active.contains(&"c".to_string()));

        let failed = db.get_scheduled_post("b").await.unwrap().unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        let processing = db.get_scheduled_post("c").await.unwrap().unwrap();
        assert_eq!(processing.job_key.as_deref(), Some("gram_job_x"));
    }

    #[tokio::test]
    async fn test_delete_scheduled_post() {
        let (db, _temp_dir) = setup_test_db().await;
        db.create_scheduled_post(&scheduled("a", "p", 100)).await.unwrap();

        assert!(db.delete_scheduled_post("a").await.unwrap());
        assert!(!db.delete_scheduled_post("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_images_are_not_duplicated() {
        let (db, _temp_dir) = setup_test_db().await;
        let entry = |image_id: &str, media_id: &str| SharedImage {
            correlation_id: "post-1".to_string(),
            image_id: image_id.to_string(),
            media_id: media_id.to_string(),
            permalink: None,
            shared_at: 1,
        };

        let first = db
            .record_shared_images(&[entry("img-1", "M1"), entry("img-2", "M1")])
            .await
            .unwrap();
        assert_eq!(first, 2);

        let second = db
            .record_shared_images(&[entry("img-2", "M2"), entry("img-3", "M2")])
            .await
            .unwrap();
        assert_eq!(second, 1);

        let shared = db.get_shared_images("post-1").await.unwrap();
        assert_eq!(shared.len(), 3);
        assert_eq!(shared[1].image_id, "img-2");
        assert_eq!(shared[1].media_id, "M1");
        assert!(db.get_shared_images("post-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_store_put_get_delete() {
        let (db, _temp_dir) = setup_test_db().await;
        let job = PublishJob::new("post-1".to_string(), vec![], "caption".to_string(), true);

        db.put(&job.key, &job, Duration::from_secs(60)).await.unwrap();
        let loaded = db.get(&job.key).await.unwrap().unwrap();
        assert_eq!(loaded.key, job.key);
        assert!(loaded.carousel);

        db.delete(&job.key).await.unwrap();
        assert!(db.get(&job.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_store_expiry() {
        let (db, _temp_dir) = setup_test_db().await;
        let job = PublishJob::new("post-1".to_string(), vec![], String::new(), false);

        db.put(&job.key, &job, Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(db.get(&job.key).await.unwrap().is_none());
        assert_eq!(db.purge_expired_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_job_store_put_replaces() {
        let (db, _temp_dir) = setup_test_db().await;
        let mut job = PublishJob::new("post-1".to_string(), vec![], String::new(), false);
        db.put(&job.key, &job, Duration::from_secs(60)).await.unwrap();

        job.acquire_lease(42);
        db.put(&job.key, &job, Duration::from_secs(60)).await.unwrap();

        let loaded = db.get(&job.key).await.unwrap().unwrap();
        assert!(loaded.publishing);
        assert_eq!(loaded.publishing_started, Some(42));
    }
}
