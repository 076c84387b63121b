//! Download task - runs one file from first byte to verified artifact
//!
//! A run wraps transfer attempts in the retry executor, re-resolves an
//! expired download URL once, then verifies, renames, scans and records
//! the finished file.

use crate::engine::manager::EngineShared;
use crate::engine::transfer::{part_path, ProgressMeter, Transfer};
use crate::engine::verify::verify_file;
use crate::error::FetchError;
use crate::retry::{classify_default, RetryExecutor};
use chrono::{DateTime, Utc};
use modelfetch_types::{CoreEvent, DownloadTask, FileInfo, ScanVerdict};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Why a running task was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Pause,
    Cancel,
}

/// A registered task and the controls of its current run
pub(crate) struct TaskEntry {
    pub task: DownloadTask,
    /// Token of the current run; present only while DOWNLOADING
    pub run: Option<CancellationToken>,
    pub stop: Option<StopReason>,
}

impl TaskEntry {
    pub fn new(task: DownloadTask) -> Self {
        Self {
            task,
            run: None,
            stop: None,
        }
    }
}

/// One run of a task
pub(crate) struct TaskRun {
    pub task_id: Uuid,
    pub file_info: FileInfo,
    pub destination: PathBuf,
    pub entry: Arc<Mutex<TaskEntry>>,
    pub token: CancellationToken,
    pub shared: Arc<EngineShared>,
}

impl TaskRun {
    /// Download, verify and publish the file, returning its completion time
    pub async fn execute(&self) -> Result<DateTime<Utc>, FetchError> {
        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = part_path(&self.destination);
        let bytes = self.transfer_with_reresolve(&temp_path).await?;
        info!("Task {} transferred {} bytes", self.task_id, bytes);

        self.finalize(&temp_path).await
    }

    /// Retry transfers; an expired URL is re-resolved once through the API
    async fn transfer_with_reresolve(&self, temp_path: &Path) -> Result<u64, FetchError> {
        let mut url = self.file_info.url.clone();
        let mut resolved = false;

        loop {
            let detect_expiry = !resolved && self.shared.api.is_some();
            match self.transfer_with_retry(&url, temp_path, detect_expiry).await {
                Err(FetchError::UrlExpired { status }) if detect_expiry => {
                    let api = match &self.shared.api {
                        Some(api) => api,
                        None => return Err(FetchError::UrlExpired { status }),
                    };
                    warn!(
                        "Download URL for task {} rejected with {}, resolving a fresh one",
                        self.task_id, status
                    );
                    url = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => return Err(FetchError::Cancelled),
                        fresh = api.resolve_download_url(&self.file_info.id) => fresh?,
                    };
                    resolved = true;
                }
                other => return other,
            }
        }
    }

    async fn transfer_with_retry(
        &self,
        url: &str,
        temp_path: &Path,
        detect_expiry: bool,
    ) -> Result<u64, FetchError> {
        let task_id = self.task_id;
        let event_tx = self.shared.event_tx.clone();

        RetryExecutor::new(&self.shared.retry)
            .interruptible(&self.token)
            .on_retry(move |record| {
                let _ = event_tx.send(CoreEvent::TaskRetrying {
                    task_id,
                    attempt: record.attempt,
                    delay_ms: record
                        .next_delay
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or_default(),
                    error: record.error.clone().unwrap_or_default(),
                });
            })
            .execute(
                |_| {
                    self.entry.lock().task.attempt_count += 1;
                    self.transfer(url, temp_path, detect_expiry).run()
                },
                classify_default,
            )
            .await
            .result
    }

    fn transfer(&self, url: &str, temp_path: &Path, detect_expiry: bool) -> Transfer {
        let config = &self.shared.config;
        Transfer {
            task_id: self.task_id,
            url: url.to_string(),
            temp_path: temp_path.to_path_buf(),
            expected_size: self.file_info.expected_size,
            client: self.shared.client.clone(),
            token: self.token.clone(),
            entry: self.entry.clone(),
            progress: ProgressMeter::new(
                self.task_id,
                config.progress_interval(),
                config.progress_bytes,
                self.shared.event_tx.clone(),
            ),
            read_timeout: config.read_timeout(),
            detect_expiry,
        }
    }

    async fn finalize(&self, temp_path: &Path) -> Result<DateTime<Utc>, FetchError> {
        if let Some(expected) = &self.file_info.expected_hash {
            if let Err(e) = verify_file(temp_path, expected).await {
                if matches!(e, FetchError::HashMismatch { .. }) {
                    error!("Task {} failed verification: {}", self.task_id, e);
                    if let Err(rm) = tokio::fs::remove_file(temp_path).await {
                        warn!("Failed to remove corrupt file {:?}: {}", temp_path, rm);
                    }
                    self.entry.lock().task.bytes_downloaded = 0;
                }
                return Err(e);
            }
            info!("Task {} passed {:?} verification", self.task_id, expected.algorithm);
        }

        tokio::fs::rename(temp_path, &self.destination).await?;

        if let Some(scanner) = &self.shared.scanner {
            match scanner.scan(&self.destination).await? {
                ScanVerdict::Safe => {}
                ScanVerdict::Suspicious => {
                    warn!(
                        "Security scanner flagged {:?} as suspicious",
                        self.destination
                    );
                }
                ScanVerdict::Malicious => {
                    error!(
                        "Security scanner flagged {:?} as malicious, deleting",
                        self.destination
                    );
                    if let Err(rm) = tokio::fs::remove_file(&self.destination).await {
                        warn!("Failed to remove {:?}: {}", self.destination, rm);
                    }
                    return Err(FetchError::Malicious(self.destination.clone()));
                }
            }
        }

        let completed_at = Utc::now();
        if let Some(history) = &self.shared.history {
            if let Err(e) = history
                .record_download(self.task_id, &self.file_info, &self.destination, completed_at)
                .await
            {
                warn!("Failed to record history for task {}: {}", self.task_id, e);
            }
        }

        Ok(completed_at)
    }
}
