use crate::core::model::{DownloadRecord, DownloadStatus};
use anyhow::Context;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// Append-only log of finished downloads. The live registry never reads it back.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryEntry {
    pub id: String,
    pub url: String,
    pub title: String,
    pub engine: String,
    pub status: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl HistoryStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first open
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
              row_id INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL,
              url TEXT NOT NULL,
              title TEXT NOT NULL,
              engine TEXT NOT NULL,
              status TEXT NOT NULL,
              error_type TEXT NULL,
              error_message TEXT NULL,
              started_at INTEGER NOT NULL,
              finished_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_downloads_finished
            ON downloads(finished_at);
            "#,
        )
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn now_epoch() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub async fn record_outcome(&self, record: &DownloadRecord) -> anyhow::Result<()> {
        anyhow::ensure!(record.status.is_terminal(), "record {} is still {}", record.id, record.status);

        let (error_type, error_message) = match (&record.status, &record.error_detail) {
            (DownloadStatus::Failed, Some(e)) => (Some(e.parsed_type.as_str()), Some(e.original_message.as_str())),
            _ => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO downloads
              (id, url, title, engine, status, error_type, error_message, started_at, finished_at)
            VALUES
              (?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
            .bind(record.id.as_str())
            .bind(record.url.as_str())
            .bind(record.title.as_str())
            .bind(record.engine.as_str())
            .bind(record.status.as_str())
            .bind(error_type)
            .bind(error_message)
            .bind(record.created_at.timestamp())
            .bind(Self::now_epoch())
            .execute(&self.pool)
            .await
            .with_context(|| format!("insert history for {}", record.id))?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent(&self, limit: u32) -> anyhow::Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, title, engine, status, error_type, error_message, started_at, finished_at
            FROM downloads
            ORDER BY finished_at DESC, row_id DESC
            LIMIT ?;
            "#,
        )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| HistoryEntry {
                id: r.get::<String, _>("id"),
                url: r.get::<String, _>("url"),
                title: r.get::<String, _>("title"),
                engine: r.get::<String, _>("engine"),
                status: r.get::<String, _>("status"),
                error_type: r.try_get::<Option<String>, _>("error_type").ok().flatten(),
                error_message: r.try_get::<Option<String>, _>("error_message").ok().flatten(),
                started_at: r.get::<i64, _>("started_at"),
                finished_at: r.get::<i64, _>("finished_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DownloadRequest, ErrorCategory, ErrorDetail};
    use chrono::Utc;

    #[tokio::test]
    async fn records_terminal_outcomes_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("db/history.sqlite")).await.unwrap();

        let mut done = DownloadRecord::admitted(&DownloadRequest::new("a", "https://x.test/a"), "yt-dlp", Utc::now());
        done.status = DownloadStatus::Completed;
        store.record_outcome(&done).await.unwrap();

        let mut failed = DownloadRecord::admitted(&DownloadRequest::new("b", "https://x.test/b"), "yt-dlp", Utc::now());
        failed.status = DownloadStatus::Failed;
        failed.error_detail = Some(ErrorDetail {
            original_message: "Private video".to_string(),
            parsed_type: ErrorCategory::PrivateVideo,
            source: "yt-dlp".to_string(),
        });
        store.record_outcome(&failed).await.unwrap();

        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "b");
        assert_eq!(rows[0].error_type.as_deref(), Some("PRIVATE_VIDEO"));
        assert_eq!(rows[1].id, "a");
        assert_eq!(rows[1].status, "completed");
        assert_eq!(rows[1].error_type, None);

        assert_eq!(store.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn live_records_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(&dir.path().join("h.sqlite")).await.unwrap();
        let live = DownloadRecord::admitted(&DownloadRequest::new("a", "https://x.test/a"), "yt-dlp", Utc::now());
        assert!(store.record_outcome(&live).await.is_err());
    }
}
