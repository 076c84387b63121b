//! Transfer attempt - moves the bytes of one file into its `.part` file
//!
//! A transfer resumes from whatever the temp file already holds, asks the
//! server for the remaining range and appends to the file. Pause and cancel
//! are observed while waiting for the response and between body chunks,
//! never in the middle of a write.

use crate::engine::download_task::TaskEntry;
use crate::error::{retry_after, FetchError};
use fs2::FileExt;
use futures::StreamExt;
use modelfetch_types::{CoreEvent, ProgressUpdate};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Temp path a download is written to before the final rename
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// One HTTP attempt for a task
pub(crate) struct Transfer {
    pub task_id: Uuid,
    pub url: String,
    pub temp_path: PathBuf,
    pub expected_size: Option<u64>,
    pub client: Client,
    pub token: CancellationToken,
    pub entry: Arc<Mutex<TaskEntry>>,
    pub progress: ProgressMeter,
    pub read_timeout: Duration,
    /// Report 401/403/410 as an expired URL instead of a client error
    pub detect_expiry: bool,
}

impl Transfer {
    /// Run the attempt, returning the size of the completed temp file
    pub async fn run(mut self) -> Result<u64, FetchError> {
        let std_file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.temp_path)?;
        std_file.try_lock_exclusive().map_err(|e| {
            FetchError::Disk(std::io::Error::new(
                e.kind(),
                format!("{:?} is locked by another writer", self.temp_path),
            ))
        })?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut offset = file.metadata().await?.len();

        if let Some(expected) = self.expected_size {
            if offset == expected && expected > 0 {
                info!("Task {} already has all {} bytes on disk", self.task_id, offset);
                self.set_bytes(offset);
                return Ok(offset);
            }
            if offset > expected {
                warn!(
                    "Task {} temp file is larger than expected ({} > {}), restarting",
                    self.task_id, offset, expected
                );
                file.set_len(0).await?;
                offset = 0;
            }
        }
        self.set_bytes(offset);

        let mut request = self.client.get(&self.url);
        if offset > 0 {
            info!("Resuming task {} from byte {}", self.task_id, offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(FetchError::Cancelled),
            result = tokio::time::timeout(self.read_timeout, request.send()) => match result {
                Err(_) => return Err(FetchError::Timeout),
                Ok(response) => response.map_err(FetchError::from_transport)?,
            },
        };

        let status = response.status();
        let mut total = self.expected_size;

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let start = content_range_start(response.headers());
                if start != Some(offset) {
                    warn!(
                        "Task {} asked for byte {} but the server sent {:?}, discarding partial file",
                        self.task_id, offset, start
                    );
                    file.set_len(0).await?;
                    self.set_bytes(0);
                    return Err(FetchError::RangeNotSatisfiable);
                }
                if let Some(size) = content_range_total(response.headers()) {
                    total = Some(size);
                }
            }
            StatusCode::OK => {
                if offset > 0 {
                    warn!(
                        "Server ignored range request for task {}, restarting from byte 0",
                        self.task_id
                    );
                    file.set_len(0).await?;
                    offset = 0;
                    self.set_bytes(0);
                }
                if total.is_none() {
                    total = content_length(response.headers());
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                if offset > 0 && content_range_total(response.headers()) == Some(offset) {
                    info!("Task {} temp file is already complete", self.task_id);
                    return Ok(offset);
                }
                warn!("Range not satisfiable for task {}, discarding partial file", self.task_id);
                file.set_len(0).await?;
                self.set_bytes(0);
                return Err(FetchError::RangeNotSatisfiable);
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE
                if self.detect_expiry =>
            {
                return Err(FetchError::UrlExpired {
                    status: status.as_u16(),
                });
            }
            _ => {
                let after = retry_after(response.headers());
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::from_status(status, after, body));
            }
        }

        if let Some(size) = total {
            let mut entry = self.entry.lock();
            if entry.task.total_bytes.is_none() {
                entry.task.total_bytes = Some(size);
            }
        }
        self.progress.set_total(total);

        file.seek(SeekFrom::Start(offset)).await?;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    file.flush().await?;
                    debug!("Task {} interrupted at byte {}", self.task_id, offset);
                    return Err(FetchError::Cancelled);
                }
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(FetchError::Timeout);
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    file.flush().await?;
                    return Err(FetchError::from_transport(e));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk).await?;
            offset += chunk.len() as u64;
            self.set_bytes(offset);
            self.progress.record(offset);
        }

        file.flush().await?;
        file.sync_all().await?;
        self.progress.finish(offset);

        if let Some(expected) = total {
            if offset < expected {
                return Err(FetchError::IncompleteTransfer {
                    expected,
                    actual: offset,
                });
            }
        }

        debug!("Task {} transfer finished ({} bytes)", self.task_id, offset);
        Ok(offset)
    }

    fn set_bytes(&self, bytes: u64) {
        self.entry.lock().task.bytes_downloaded = bytes;
    }
}

/// Total size from `Content-Range: bytes 0-99/12345` or `bytes */12345`
fn content_range_total(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .filter(|total| *total != "*")
        .and_then(|total| total.trim().parse().ok())
}

/// First byte from `Content-Range: bytes 100-199/1000`
fn content_range_start(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes "))
        .and_then(|v| v.split('-').next())
        .and_then(|start| start.trim().parse().ok())
}

fn content_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Throttled progress reporting with a smoothed speed estimate
pub(crate) struct ProgressMeter {
    task_id: Uuid,
    total: Option<u64>,
    interval: Duration,
    bytes_step: u64,
    last_emit: Instant,
    last_bytes: u64,
    speed: f64,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl ProgressMeter {
    const ALPHA: f64 = 0.3;

    pub fn new(
        task_id: Uuid,
        interval: Duration,
        bytes_step: u64,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            task_id,
            total: None,
            interval,
            bytes_step: bytes_step.max(1),
            last_emit: Instant::now(),
            last_bytes: 0,
            speed: 0.0,
            event_tx,
        }
    }

    fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    /// Emit if enough time or bytes have passed since the last update
    fn record(&mut self, downloaded: u64) {
        let due_by_time = self.last_emit.elapsed() >= self.interval;
        let due_by_bytes = downloaded.saturating_sub(self.last_bytes) >= self.bytes_step;
        if due_by_time || due_by_bytes {
            self.emit(downloaded);
        }
    }

    fn finish(&mut self, downloaded: u64) {
        self.emit(downloaded);
    }

    fn emit(&mut self, downloaded: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_emit).as_secs_f64();
        let delta = downloaded.saturating_sub(self.last_bytes) as f64;

        if elapsed > 0.0 {
            let instant = delta / elapsed;
            self.speed = if self.speed == 0.0 {
                instant
            } else {
                Self::ALPHA * instant + (1.0 - Self::ALPHA) * self.speed
            };
        }

        let speed = self.speed as u64;
        let eta = match self.total {
            Some(total) if speed > 0 => Some(total.saturating_sub(downloaded) / speed),
            _ => None,
        };

        let _ = self.event_tx.send(CoreEvent::Progress(ProgressUpdate {
            task_id: self.task_id,
            bytes_downloaded: downloaded,
            total_bytes: self.total,
            instantaneous_speed: speed,
            eta,
        }));

        self.last_emit = now;
        self.last_bytes = downloaded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/data/model.safetensors")),
            PathBuf::from("/data/model.safetensors.part")
        );
    }

    #[test]
    fn test_content_range_total() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/1000"));
        assert_eq!(content_range_total(&headers), Some(1000));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes */500"));
        assert_eq!(content_range_total(&headers), Some(500));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-9/*"));
        assert_eq!(content_range_total(&headers), None);
    }

    #[test]
    fn test_content_range_start() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range_start(&headers), None);

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/1000"));
        assert_eq!(content_range_start(&headers), Some(100));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes */500"));
        assert_eq!(content_range_start(&headers), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_throttled() {
        let (tx, mut rx) = broadcast::channel(64);
        let mut meter = ProgressMeter::new(Uuid::new_v4(), Duration::from_millis(500), 1000, tx);
        meter.set_total(Some(10_000));

        meter.record(10);
        meter.record(20);
        assert!(rx.try_recv().is_err());

        meter.record(1_500);
        assert!(matches!(
            rx.try_recv(),
            Ok(CoreEvent::Progress(ProgressUpdate { bytes_downloaded: 1_500, .. }))
        ));

        tokio::time::advance(Duration::from_millis(600)).await;
        meter.record(1_600);
        match rx.try_recv() {
            Ok(CoreEvent::Progress(update)) => {
                assert_eq!(update.bytes_downloaded, 1_600);
                assert!(update.instantaneous_speed > 0);
                assert!(update.eta.is_some());
            }
            other => panic!("expected progress, got {:?}", other),
        }

        meter.finish(1_600);
        assert!(rx.try_recv().is_ok());
    }
}
