//! Integration tests for gram-queue

use anyhow::Result;
use assert_cmd::Command;
use libgramcast::{Database, ImageSource, ScheduledPost, ScheduledStatus, SharedImage};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct TestEnv {
    _temp_dir: TempDir,
    config_path: PathBuf,
    db_path: PathBuf,
}

impl TestEnv {
    fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");
        let db_path = temp_dir.path().join("gramcast.db");
        let token_path = temp_dir.path().join("instagram.toml");

        let config = format!(
            r#"
[database]
path = "{}"

[instagram]
token_file = "{}"
"#,
            toml_path(&db_path),
            toml_path(&token_path)
        );
        fs::write(&config_path, config)?;

        Ok(Self {
            _temp_dir: temp_dir,
            config_path,
            db_path,
        })
    }

    async fn db(&self) -> Result<Database> {
        Ok(Database::new(&self.db_path.to_string_lossy()).await?)
    }

    fn cmd(&self) -> Result<Command> {
        let mut cmd = Command::cargo_bin("gram-queue")?;
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

fn scheduled(id: &str, correlation_id: &str, offset_secs: i64) -> ScheduledPost {
    let now = chrono::Utc::now().timestamp();
    ScheduledPost {
        id: id.to_string(),
        correlation_id: correlation_id.to_string(),
        images: vec![ImageSource {
            id: "a.jpg".to_string(),
            reference: "/photos/a.jpg".to_string(),
            width: 1080,
            height: 1080,
        }],
        crops: Vec::new(),
        caption: "Queued".to_string(),
        publish_at: now + offset_secs,
        created_at: now,
        status: ScheduledStatus::Pending,
        error_message: None,
        job_key: None,
    }
}

#[tokio::test]
async fn test_list_empty_queue() -> Result<()> {
    let env = TestEnv::new()?;

    env.cmd()?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    Ok(())
}

#[tokio::test]
async fn test_list_text_and_filter() -> Result<()> {
    let env = TestEnv::new()?;
    let db = env.db().await?;
    db.create_scheduled_post(&scheduled("sched_one", "post-1", 7200))
        .await?;
    db.create_scheduled_post(&scheduled("sched_two", "post-2", 3 * 86400))
        .await?;

    env.cmd()?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("sched_one | post-1 | 1 image | pending"))
        .stdout(predicate::str::contains("sched_two"));

    env.cmd()?
        .args(["list", "--correlation-id", "post-2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sched_two"))
        .stdout(predicate::str::contains("sched_one").not());
    Ok(())
}

#[tokio::test]
async fn test_list_json_includes_failure_message() -> Result<()> {
    let env = TestEnv::new()?;
    let db = env.db().await?;
    db.create_scheduled_post(&scheduled("sched_bad", "post-1", -60))
        .await?;
    db.update_scheduled_status("sched_bad", ScheduledStatus::Failed, Some("boom"), None)
        .await?;

    let output = env.cmd()?.args(["list", "--format", "json"]).output()?;
    assert!(output.status.success());

    let posts: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(posts[0]["id"], "sched_bad");
    assert_eq!(posts[0]["status"], "failed");
    assert_eq!(posts[0]["error_message"], "boom");
    Ok(())
}

#[tokio::test]
async fn test_status_of_unknown_job() -> Result<()> {
    let env = TestEnv::new()?;

    env.cmd()?
        .args(["status", "gram_job_missing"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));

    let output = env
        .cmd()?
        .args(["status", "gram_job_missing", "--format", "json"])
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["status"], "not_found");
    Ok(())
}

#[tokio::test]
async fn test_shared_lists_ledger() -> Result<()> {
    let env = TestEnv::new()?;
    let db = env.db().await?;
    db.record_shared_images(&[
        SharedImage {
            correlation_id: "post-5".to_string(),
            image_id: "a.jpg".to_string(),
            media_id: "1789".to_string(),
            permalink: Some("https://www.instagram.com/p/abc/".to_string()),
            shared_at: 1_700_000_000,
        },
        SharedImage {
            correlation_id: "post-5".to_string(),
            image_id: "b.jpg".to_string(),
            media_id: "1789".to_string(),
            permalink: None,
            shared_at: 1_700_000_000,
        },
    ])
    .await?;

    env.cmd()?
        .args(["shared", "post-5"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "a.jpg | 1789 | https://www.instagram.com/p/abc/",
        ))
        .stdout(predicate::str::contains("b.jpg | 1789 | -"));

    env.cmd()?
        .args(["shared", "post-unknown"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    Ok(())
}

#[tokio::test]
async fn test_invalid_format_is_invalid_input() -> Result<()> {
    let env = TestEnv::new()?;

    env.cmd()?
        .args(["list", "--format", "yaml"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Invalid format"));
    Ok(())
}

#[tokio::test]
async fn test_missing_config_is_config_error() -> Result<()> {
    let env = TestEnv::new()?;
    fs::remove_file(&env.config_path)?;

    env.cmd()?.arg("list").assert().code(2);
    Ok(())
}
