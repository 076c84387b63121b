//! Download history collaborator
//!
//! The engine records every completed file here, and bulk jobs can ask it
//! whether a file was already fetched.

use crate::error::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modelfetch_types::FileInfo;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn is_downloaded(&self, model_id: &str, file_id: &str) -> Result<bool, FetchError>;

    async fn record_download(
        &self,
        task_id: Uuid,
        file_info: &FileInfo,
        file_path: &Path,
        completed_at: DateTime<Utc>,
    ) -> Result<(), FetchError>;
}

/// One row of download history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub task_id: Uuid,
    pub model_id: String,
    pub file_id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub size: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

/// Process-local history, lost on exit
#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<HashMap<(String, String), HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().values().cloned().collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn is_downloaded(&self, model_id: &str, file_id: &str) -> Result<bool, FetchError> {
        Ok(self
            .records
            .lock()
            .contains_key(&(model_id.to_string(), file_id.to_string())))
    }

    async fn record_download(
        &self,
        task_id: Uuid,
        file_info: &FileInfo,
        file_path: &Path,
        completed_at: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        let record = HistoryRecord {
            task_id,
            model_id: file_info.model_id.clone(),
            file_id: file_info.id.clone(),
            file_name: file_info.name.clone(),
            file_path: file_path.to_path_buf(),
            size: file_info.expected_size,
            completed_at,
        };
        self.records
            .lock()
            .insert((record.model_id.clone(), record.file_id.clone()), record);
        Ok(())
    }
}

/// SQLite-backed history in a single `downloads` table
#[derive(Clone, Debug)]
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    /// Open or create the history database
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, FetchError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                model_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                size INTEGER,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (model_id, file_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        debug!("Opened download history at {:?}", path);
        Ok(Self { pool })
    }

    /// Most recent downloads first
    pub async fn recent(&self, limit: u32) -> Result<Vec<HistoryRecord>, FetchError> {
        let rows = sqlx::query(
            "SELECT task_id, model_id, file_id, file_name, file_path, size, completed_at
             FROM downloads ORDER BY completed_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<HistoryRecord, FetchError> {
    let task_id: String = row.try_get("task_id")?;
    let completed_at: String = row.try_get("completed_at")?;
    let size: Option<i64> = row.try_get("size")?;
    let file_path: String = row.try_get("file_path")?;

    Ok(HistoryRecord {
        task_id: Uuid::parse_str(&task_id).map_err(|e| FetchError::Parse(e.to_string()))?,
        model_id: row.try_get("model_id")?,
        file_id: row.try_get("file_id")?,
        file_name: row.try_get("file_name")?,
        file_path: PathBuf::from(file_path),
        size: size.map(|s| s as u64),
        completed_at: DateTime::parse_from_rfc3339(&completed_at)
            .map_err(|e| FetchError::Parse(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn is_downloaded(&self, model_id: &str, file_id: &str) -> Result<bool, FetchError> {
        let row = sqlx::query("SELECT 1 FROM downloads WHERE model_id = ? AND file_id = ?")
            .bind(model_id)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record_download(
        &self,
        task_id: Uuid,
        file_info: &FileInfo,
        file_path: &Path,
        completed_at: DateTime<Utc>,
    ) -> Result<(), FetchError> {
        sqlx::query(
            r#"
            INSERT INTO downloads (model_id, file_id, task_id, file_name, file_path, size, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(model_id, file_id) DO UPDATE SET
                task_id = excluded.task_id,
                file_name = excluded.file_name,
                file_path = excluded.file_path,
                size = excluded.size,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&file_info.model_id)
        .bind(&file_info.id)
        .bind(task_id.to_string())
        .bind(&file_info.name)
        .bind(file_path.to_string_lossy().to_string())
        .bind(file_info.expected_size.map(|s| s as i64))
        .bind(completed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(model_id: &str, id: &str) -> FileInfo {
        FileInfo::new(id, format!("https://example.com/{}.bin", id))
            .with_model_id(model_id)
            .with_size(10)
    }

    #[tokio::test]
    async fn test_memory_history() {
        let history = MemoryHistory::new();
        assert!(!history.is_downloaded("1", "a").await.unwrap());

        history
            .record_download(Uuid::new_v4(), &file("1", "a"), Path::new("/tmp/a.bin"), Utc::now())
            .await
            .unwrap();

        assert!(history.is_downloaded("1", "a").await.unwrap());
        assert!(!history.is_downloaded("2", "a").await.unwrap());
        assert_eq!(history.records().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_history_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("history").join("downloads.db");
        let task_id = Uuid::new_v4();

        {
            let history = SqliteHistory::open(&db_path).await.unwrap();
            history
                .record_download(task_id, &file("7", "42"), Path::new("/data/42.bin"), Utc::now())
                .await
                .unwrap();
            // Recording twice keeps one row
            history
                .record_download(task_id, &file("7", "42"), Path::new("/data/42.bin"), Utc::now())
                .await
                .unwrap();
        }

        let history = SqliteHistory::open(&db_path).await.unwrap();
        assert!(history.is_downloaded("7", "42").await.unwrap());
        assert!(!history.is_downloaded("7", "43").await.unwrap());

        let recent = history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].task_id, task_id);
        assert_eq!(recent[0].size, Some(10));
        assert_eq!(recent[0].file_path, PathBuf::from("/data/42.bin"));
    }
}
