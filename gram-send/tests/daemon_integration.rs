//! Integration tests for the gram-send daemon

use anyhow::Result;
use assert_cmd::Command;
use libgramcast::{Database, ImageSource, ScheduledPost, ScheduledStatus};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct TestEnv {
    temp_dir: TempDir,
    config_path: PathBuf,
    db_path: PathBuf,
}

impl TestEnv {
    async fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");
        let db_path = temp_dir.path().join("gramcast.db");
        let token_path = temp_dir.path().join("instagram.toml");
        let media_dir = temp_dir.path().join("temp");

        let config = format!(
            r#"
[database]
path = "{}"

[instagram]
token_file = "{}"

[scheduling]
poll_interval_secs = 1

[media]
temp_dir = "{}"
"#,
            toml_path(&db_path),
            toml_path(&token_path),
            toml_path(&media_dir)
        );
        fs::write(&config_path, config)?;

        // Initialize database
        Database::new(&db_path.to_string_lossy()).await?;

        Ok(Self {
            temp_dir,
            config_path,
            db_path,
        })
    }

    async fn db(&self) -> Result<Database> {
        Ok(Database::new(&self.db_path.to_string_lossy()).await?)
    }

    /// A scheduled post whose image file exists
    async fn schedule(&self, id: &str, offset_secs: i64) -> Result<()> {
        let image = self.temp_dir.path().join(format!("{}.jpg", id));
        fs::write(&image, b"not really a jpeg")?;

        let now = chrono::Utc::now().timestamp();
        let post = ScheduledPost {
            id: id.to_string(),
            correlation_id: "post-1".to_string(),
            images: vec![ImageSource {
                id: format!("{}.jpg", id),
                reference: image.to_string_lossy().to_string(),
                width: 100,
                height: 100,
            }],
            crops: Vec::new(),
            caption: "From the queue".to_string(),
            publish_at: now + offset_secs,
            created_at: now,
            status: ScheduledStatus::Pending,
            error_message: None,
            job_key: None,
        };
        self.db().await?.create_scheduled_post(&post).await?;
        Ok(())
    }

    fn cmd(&self) -> Result<Command> {
        let mut cmd = Command::cargo_bin("gram-send")?;
        cmd.env("GRAMCAST_CONFIG", &self.config_path)
            .env_remove("GRAMCAST_DB_PATH")
            .env_remove("GRAMCAST_ACCESS_TOKEN")
            .env_remove("GRAMCAST_ACCOUNT_ID");
        Ok(cmd)
    }
}

fn toml_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "\\\\")
}

#[tokio::test]
async fn test_once_with_empty_queue() -> Result<()> {
    let env = TestEnv::new().await?;

    env.cmd()?.arg("--once").assert().success();
    Ok(())
}

#[tokio::test]
async fn test_once_marks_due_post_failed_without_credential() -> Result<()> {
    let env = TestEnv::new().await?;
    env.schedule("sched_due", -10).await?;
    env.schedule("sched_later", 3600).await?;

    env.cmd()?.arg("--once").assert().success();

    let db = env.db().await?;
    let due = db
        .get_scheduled_post("sched_due")
        .await?
        .expect("failed post kept");
    assert_eq!(due.status, ScheduledStatus::Failed);
    assert!(due
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("No Instagram account")));

    let later = db
        .get_scheduled_post("sched_later")
        .await?
        .expect("future post kept");
    assert_eq!(later.status, ScheduledStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn test_failed_post_is_not_retried() -> Result<()> {
    let env = TestEnv::new().await?;
    env.schedule("sched_due", -10).await?;

    env.cmd()?.arg("--once").assert().success();
    let first = env.db().await?.get_scheduled_post("sched_due").await?;

    env.cmd()?.arg("--once").assert().success();
    let second = env.db().await?.get_scheduled_post("sched_due").await?;

    let (first, second) = (first.expect("kept"), second.expect("kept"));
    assert_eq!(first.status, ScheduledStatus::Failed);
    assert_eq!(second.status, ScheduledStatus::Failed);
    assert_eq!(first.error_message, second.error_message);
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_fails() -> Result<()> {
    let env = TestEnv::new().await?;
    fs::write(&env.config_path, "invalid toml content [[[")?;

    env.cmd()?.arg("--once").assert().code(2);
    Ok(())
}

#[tokio::test]
async fn test_invalid_utc_offset_fails() -> Result<()> {
    let env = TestEnv::new().await?;
    let config = fs::read_to_string(&env.config_path)?.replace(
        "poll_interval_secs = 1",
        "poll_interval_secs = 1\nutc_offset = \"somewhere\"",
    );
    fs::write(&env.config_path, config)?;

    env.cmd()?.arg("--once").assert().code(2);
    Ok(())
}

#[tokio::test]
async fn test_poll_interval_not_below_job_ttl_fails() -> Result<()> {
    let env = TestEnv::new().await?;

    env.cmd()?
        .args(["--once", "--poll-interval", "300"])
        .assert()
        .code(2)
        .stderr(predicates::str::contains("job_ttl_secs"));

    let config = fs::read_to_string(&env.config_path)?
        .replace("poll_interval_secs = 1", "poll_interval_secs = 600");
    fs::write(&env.config_path, config)?;
    env.cmd()?.arg("--once").assert().code(2);
    Ok(())
}
