//! Download engine - registry and state machine of all download tasks
//!
//! Tasks move PENDING -> DOWNLOADING -> COMPLETED, with PAUSED, FAILED and
//! CANCELLED branches. Every status change happens under the task's lock
//! and is broadcast as a `CoreEvent`.

use crate::api::ApiClient;
use crate::config::EngineConfig;
use crate::engine::download_task::{StopReason, TaskEntry, TaskRun};
use crate::engine::transfer::part_path;
use crate::error::FetchError;
use crate::history::HistoryStore;
use crate::retry::RetryPolicy;
use crate::scanner::SecurityScanner;
use chrono::{DateTime, Utc};
use futures::Stream;
use modelfetch_types::{CoreEvent, DownloadTask, FileInfo, Priority, TaskError, TaskStatus};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 1024;

/// Everything a running task needs from its engine
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub client: Client,
    pub retry: RetryPolicy,
    pub api: Option<ApiClient>,
    pub history: Option<Arc<dyn HistoryStore>>,
    pub scanner: Option<Arc<dyn SecurityScanner>>,
    pub event_tx: broadcast::Sender<CoreEvent>,
}

/// Which statuses `activate` may start from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationPolicy {
    /// Explicit user start: PENDING, PAUSED, FAILED and CANCELLED tasks run
    Restart,
    /// Scheduler dispatch: only PENDING and PAUSED tasks run
    Dispatch,
}

/// A task that has entered DOWNLOADING and must be driven to a stop
pub struct ActiveTransfer {
    task_id: Uuid,
    entry: Arc<Mutex<TaskEntry>>,
    token: CancellationToken,
    lease: DestinationLease,
}

impl ActiveTransfer {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

/// In-process claim on a destination path, released on drop
struct DestinationLease {
    path: PathBuf,
    leases: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for DestinationLease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.path);
    }
}

/// Builder for [`DownloadEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    api: Option<ApiClient>,
    history: Option<Arc<dyn HistoryStore>>,
    scanner: Option<Arc<dyn SecurityScanner>>,
    event_tx: Option<broadcast::Sender<CoreEvent>>,
}

impl EngineBuilder {
    /// Client used to re-resolve expired download URLs
    pub fn api_client(mut self, api: ApiClient) -> Self {
        self.api = Some(api);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn SecurityScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Share an existing event channel instead of creating one
    pub fn event_sender(mut self, event_tx: broadcast::Sender<CoreEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn build(self) -> Result<DownloadEngine, FetchError> {
        let client = Client::builder()
            .user_agent(self.config.user_agent.clone())
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .build()?;

        let event_tx = self
            .event_tx
            .unwrap_or_else(|| broadcast::channel(EVENT_CAPACITY).0);

        Ok(DownloadEngine {
            shared: Arc::new(EngineShared {
                retry: RetryPolicy::from_settings(&self.config.retry),
                config: self.config,
                client,
                api: self.api,
                history: self.history,
                scanner: self.scanner,
                event_tx,
            }),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            leases: Arc::new(Mutex::new(HashSet::new())),
        })
    }
}

/// Owns every download task and runs them on request
#[derive(Clone)]
pub struct DownloadEngine {
    shared: Arc<EngineShared>,
    tasks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<TaskEntry>>>>>,
    leases: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DownloadEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            api: None,
            history: None,
            scanner: None,
            event_tx: None,
        }
    }

    /// Engine with no API client, history or scanner attached
    pub fn new(config: EngineConfig) -> Result<Self, FetchError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn history(&self) -> Option<&Arc<dyn HistoryStore>> {
        self.shared.history.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.shared.event_tx.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<CoreEvent> {
        self.shared.event_tx.clone()
    }

    /// Events as a stream; lagged receivers silently skip what they missed
    pub fn events(&self) -> impl Stream<Item = CoreEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok())
    }

    /// Register a task writing to the download directory
    pub fn create_task(&self, file_info: FileInfo, priority: Priority) -> Result<Uuid, FetchError> {
        let destination = self
            .shared
            .config
            .download_dir
            .join(sanitize_file_name(&file_info.name));
        self.create_task_at(file_info, priority, destination)
    }

    /// Register a task writing to an explicit destination
    pub fn create_task_at(
        &self,
        file_info: FileInfo,
        priority: Priority,
        destination: PathBuf,
    ) -> Result<Uuid, FetchError> {
        let parsed = url::Url::parse(&file_info.url)
            .map_err(|_| FetchError::InvalidUrl(file_info.url.clone()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(file_info.url.clone()));
        }

        let mut tasks = self.tasks.write();

        let taken = tasks
            .values()
            .any(|entry| entry.lock().task.destination == destination);
        if taken {
            return Err(FetchError::DestinationConflict(destination));
        }

        let task = DownloadTask::new(file_info, destination, priority);
        let task_id = task.task_id;
        debug!("Created task {} for {:?}", task_id, task.destination);
        tasks.insert(task_id, Arc::new(Mutex::new(TaskEntry::new(task))));

        Ok(task_id)
    }

    /// Move a task into DOWNLOADING
    ///
    /// Returns `None` when the policy does not allow the task's current
    /// status to start. The transition happens under the task lock, so a
    /// concurrent cancel is either seen here or delivered to the new run.
    pub fn activate(
        &self,
        task_id: Uuid,
        policy: ActivationPolicy,
    ) -> Result<Option<ActiveTransfer>, FetchError> {
        let entry = self.entry(task_id)?;
        let mut guard = entry.lock();

        let allowed = match guard.task.status {
            TaskStatus::Pending | TaskStatus::Paused => true,
            TaskStatus::Failed | TaskStatus::Cancelled => policy == ActivationPolicy::Restart,
            TaskStatus::Completed => false,
            TaskStatus::Downloading => {
                return Err(FetchError::InvalidOperation(format!(
                    "Task {} is already downloading",
                    task_id
                )));
            }
        };
        if !allowed {
            debug!(
                "Task {} not started from {:?} ({:?})",
                task_id, guard.task.status, policy
            );
            return Ok(None);
        }

        let lease = self.lease(&guard.task.destination)?;
        let token = CancellationToken::new();

        guard.run = Some(token.clone());
        guard.stop = None;
        guard.task.last_error = None;
        guard.task.status = TaskStatus::Downloading;
        info!("Task {} downloading: {}", task_id, guard.task.file_info.name);
        self.emit_status(task_id, TaskStatus::Downloading, None);
        drop(guard);

        Ok(Some(ActiveTransfer {
            task_id,
            entry,
            token,
            lease,
        }))
    }

    /// Drive an activated task until it completes, fails, pauses or is cancelled
    pub async fn drive(&self, transfer: ActiveTransfer) -> TaskStatus {
        let ActiveTransfer {
            task_id,
            entry,
            token,
            lease,
        } = transfer;

        let (file_info, destination) = {
            let guard = entry.lock();
            (guard.task.file_info.clone(), guard.task.destination.clone())
        };

        let run = TaskRun {
            task_id,
            file_info,
            destination,
            entry: entry.clone(),
            token,
            shared: self.shared.clone(),
        };
        let result = run.execute().await;

        let status = self.settle(task_id, &entry, result);
        drop(lease);
        status
    }

    /// Run a task in place and return its final status
    pub async fn run(&self, task_id: Uuid) -> Result<TaskStatus, FetchError> {
        match self.activate(task_id, ActivationPolicy::Restart)? {
            Some(transfer) => Ok(self.drive(transfer).await),
            None => self
                .task(task_id)
                .map(|t| t.status)
                .ok_or(FetchError::NotFound(task_id)),
        }
    }

    /// Start a task in the background
    pub fn start(&self, task_id: Uuid) -> Result<(), FetchError> {
        self.spawn(task_id, ActivationPolicy::Restart)
    }

    fn spawn(&self, task_id: Uuid, policy: ActivationPolicy) -> Result<(), FetchError> {
        if let Some(transfer) = self.activate(task_id, policy)? {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.drive(transfer).await;
            });
        }
        Ok(())
    }

    /// Pause a task; a running transfer stops at its next read boundary
    pub fn pause(&self, task_id: Uuid) -> Result<(), FetchError> {
        let entry = self.entry(task_id)?;
        let mut guard = entry.lock();

        match guard.task.status {
            TaskStatus::Downloading => {
                guard.stop = Some(StopReason::Pause);
                if let Some(token) = &guard.run {
                    token.cancel();
                }
                info!("Signaled pause for task {}", task_id);
                Ok(())
            }
            TaskStatus::Pending => {
                guard.task.status = TaskStatus::Paused;
                self.emit_status(task_id, TaskStatus::Paused, None);
                Ok(())
            }
            TaskStatus::Paused => Ok(()),
            status => Err(FetchError::InvalidOperation(format!(
                "Cannot pause task {} in status {:?}",
                task_id, status
            ))),
        }
    }

    /// Resume a paused task in the background
    pub fn resume(&self, task_id: Uuid) -> Result<(), FetchError> {
        let status = self
            .task(task_id)
            .map(|t| t.status)
            .ok_or(FetchError::NotFound(task_id))?;

        match status {
            TaskStatus::Paused => self.spawn(task_id, ActivationPolicy::Dispatch),
            status => Err(FetchError::InvalidOperation(format!(
                "Cannot resume task {} in status {:?}",
                task_id, status
            ))),
        }
    }

    /// Cancel a task; the partial file is kept for a later restart
    pub fn cancel(&self, task_id: Uuid) -> Result<(), FetchError> {
        let entry = self.entry(task_id)?;
        let mut guard = entry.lock();

        match guard.task.status {
            TaskStatus::Downloading => {
                guard.stop = Some(StopReason::Cancel);
                if let Some(token) = &guard.run {
                    token.cancel();
                }
                info!("Signaled cancel for task {}", task_id);
            }
            TaskStatus::Pending | TaskStatus::Paused => {
                guard.task.status = TaskStatus::Cancelled;
                info!("Cancelled task {}", task_id);
                self.emit_status(task_id, TaskStatus::Cancelled, None);
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {}
        }
        Ok(())
    }

    /// Fail a waiting task that could not be dispatched
    pub(crate) fn reject(&self, task_id: Uuid, error: &FetchError) {
        let Ok(entry) = self.entry(task_id) else {
            return;
        };
        let mut guard = entry.lock();

        if matches!(guard.task.status, TaskStatus::Pending | TaskStatus::Paused) {
            let task_error = error.to_task_error();
            guard.task.status = TaskStatus::Failed;
            guard.task.last_error = Some(task_error.clone());
            warn!("Task {} rejected: {}", task_id, error);
            self.emit_status(task_id, TaskStatus::Failed, Some(task_error));
        }
    }

    pub fn task(&self, task_id: Uuid) -> Option<DownloadTask> {
        let entry = self.tasks.read().get(&task_id).cloned()?;
        let task = entry.lock().task.clone();
        Some(task)
    }

    /// Snapshots of the given tasks, skipping unknown ids
    pub fn tasks(&self, task_ids: &[Uuid]) -> Vec<DownloadTask> {
        task_ids.iter().filter_map(|id| self.task(*id)).collect()
    }

    pub fn all_tasks(&self) -> Vec<DownloadTask> {
        let entries: Vec<_> = self.tasks.read().values().cloned().collect();
        entries.iter().map(|e| e.lock().task.clone()).collect()
    }

    /// Forget a task that is not downloading
    pub async fn remove_task(
        &self,
        task_id: Uuid,
        delete_partial: bool,
    ) -> Result<DownloadTask, FetchError> {
        let removed = {
            let mut tasks = self.tasks.write();
            let entry = tasks.get(&task_id).ok_or(FetchError::NotFound(task_id))?;
            if entry.lock().task.status == TaskStatus::Downloading {
                return Err(FetchError::InvalidOperation(format!(
                    "Task {} is downloading",
                    task_id
                )));
            }
            tasks.remove(&task_id)
        };

        let task = match removed {
            Some(entry) => entry.lock().task.clone(),
            None => return Err(FetchError::NotFound(task_id)),
        };

        if delete_partial {
            let temp_path = part_path(&task.destination);
            if tokio::fs::try_exists(&temp_path).await.unwrap_or(false) {
                if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                    warn!("Failed to remove {:?}: {}", temp_path, e);
                }
            }
        }

        debug!("Removed task {}", task_id);
        Ok(task)
    }

    fn entry(&self, task_id: Uuid) -> Result<Arc<Mutex<TaskEntry>>, FetchError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(FetchError::NotFound(task_id))
    }

    fn lease(&self, path: &Path) -> Result<DestinationLease, FetchError> {
        let mut leases = self.leases.lock();
        if !leases.insert(path.to_path_buf()) {
            return Err(FetchError::DestinationConflict(path.to_path_buf()));
        }
        Ok(DestinationLease {
            path: path.to_path_buf(),
            leases: self.leases.clone(),
        })
    }

    /// Record the outcome of a run and announce it
    fn settle(
        &self,
        task_id: Uuid,
        entry: &Mutex<TaskEntry>,
        result: Result<DateTime<Utc>, FetchError>,
    ) -> TaskStatus {
        let mut guard = entry.lock();
        let stop = guard.stop.take();
        guard.run = None;

        let (status, error) = match result {
            Ok(completed_at) => {
                guard.task.completed_at = Some(completed_at);
                if guard.task.total_bytes.is_none() {
                    guard.task.total_bytes = Some(guard.task.bytes_downloaded);
                }
                info!("Task {} completed: {:?}", task_id, guard.task.destination);
                (TaskStatus::Completed, None)
            }
            Err(FetchError::Cancelled) => match stop {
                Some(StopReason::Pause) => {
                    info!(
                        "Task {} paused at {} bytes",
                        task_id, guard.task.bytes_downloaded
                    );
                    (TaskStatus::Paused, None)
                }
                _ => {
                    info!("Task {} cancelled", task_id);
                    (TaskStatus::Cancelled, None)
                }
            },
            Err(e) => {
                error!("Task {} failed: {}", task_id, e);
                (TaskStatus::Failed, Some(e.to_task_error()))
            }
        };

        guard.task.status = status;
        guard.task.last_error = error.clone();
        self.emit_status(task_id, status, error);
        status
    }

    fn emit_status(&self, task_id: Uuid, status: TaskStatus, error: Option<TaskError>) {
        let _ = self.shared.event_tx.send(CoreEvent::TaskStatusChanged {
            task_id,
            status,
            error,
        });
    }
}

/// Replace characters that are not allowed in file names
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, BackoffKind, RetrySettings};
    use crate::engine::testing::StallingServer;
    use crate::history::MemoryHistory;
    use async_trait::async_trait;
    use modelfetch_types::{ErrorKind, ExpectedHash, ScanVerdict};
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MIB: usize = 1024 * 1024;

    fn engine_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            download_dir: dir.to_path_buf(),
            read_timeout_secs: 5,
            progress_interval_ms: 10,
            retry: RetrySettings {
                max_attempts: 3,
                strategy: BackoffKind::Exponential,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..EngineConfig::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn file_at(server: &MockServer, name: &str) -> FileInfo {
        FileInfo::new(name, format!("{}/files/{}", server.uri(), name))
    }

    async fn wait_for_status(
        rx: &mut broadcast::Receiver<CoreEvent>,
        task_id: Uuid,
        wanted: TaskStatus,
    ) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(CoreEvent::TaskStatusChanged { task_id: id, status, .. }) =
                    rx.recv().await
                {
                    if id == task_id && status == wanted {
                        return;
                    }
                }
            }
        })
        .await
        .expect("task never reached the expected status");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("model.safetensors"), "model.safetensors");
        assert_eq!(sanitize_file_name("../a/b:c?.bin"), "_a_b_c_.bin");
        assert_eq!(sanitize_file_name(" .. "), "download");
    }

    #[tokio::test]
    async fn test_download_with_verified_hash() {
        let server = MockServer::start().await;
        let body = payload(64 * 1024);
        Mock::given(method("GET"))
            .and(path("/files/model.safetensors"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(MemoryHistory::new());
        let engine = DownloadEngine::builder(engine_config(dir.path()))
            .history(history.clone())
            .build()
            .unwrap();

        let info = file_at(&server, "model.safetensors")
            .with_model_id("9")
            .with_size(body.len() as u64)
            .with_hash(ExpectedHash::sha256(sha256_hex(&body)));
        let task_id = engine.create_task(info, Priority::Normal).unwrap();

        let status = engine.run(task_id).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let destination = dir.path().join("model.safetensors");
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
        assert!(!part_path(&destination).exists());

        let task = engine.task(task_id).unwrap();
        assert_eq!(task.bytes_downloaded, body.len() as u64);
        assert_eq!(task.attempt_count, 1);
        assert!(task.completed_at.is_some());
        assert!(history.is_downloaded("9", "model.safetensors").await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_sends_range_from_partial_file() {
        let server = MockServer::start().await;
        let body = payload(10 * MIB);
        let half = 5 * MIB;
        Mock::given(method("GET"))
            .and(path("/files/big.bin"))
            .and(header("range", "bytes=5242880-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(body[half..].to_vec())
                    .append_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", half, body.len() - 1, body.len()).as_str(),
                    ),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("big.bin");
        tokio::fs::write(part_path(&destination), &body[..half])
            .await
            .unwrap();

        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let info = file_at(&server, "big.bin")
            .with_size(body.len() as u64)
            .with_hash(ExpectedHash::sha256(sha256_hex(&body)));
        let task_id = engine.create_task(info, Priority::Normal).unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Completed);
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_from_zero() {
        let server = MockServer::start().await;
        let body = payload(4096);
        Mock::given(method("GET"))
            .and(path("/files/data.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("data.bin");
        tokio::fs::write(part_path(&destination), vec![0xFFu8; 100])
            .await
            .unwrap();

        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let task_id = engine
            .create_task(file_at(&server, "data.bin"), Priority::Normal)
            .unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Completed);
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(
            requests[0].headers.get("range").unwrap().to_str().unwrap(),
            "bytes=100-"
        );
    }

    #[tokio::test]
    async fn test_hash_mismatch_fails_and_deletes() {
        let server = MockServer::start().await;
        let body = payload(2048);
        Mock::given(method("GET"))
            .and(path("/files/corrupt.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let info = file_at(&server, "corrupt.bin")
            .with_hash(ExpectedHash::sha256(sha256_hex(b"something else")));
        let task_id = engine.create_task(info, Priority::Normal).unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Failed);

        let task = engine.task(task_id).unwrap();
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::HashMismatch);
        let destination = dir.path().join("corrupt.bin");
        assert!(!destination.exists());
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/missing.bin"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let task_id = engine
            .create_task(file_at(&server, "missing.bin"), Priority::Normal)
            .unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Failed);
        let task = engine.task(task_id).unwrap();
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::ClientError);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        let body = payload(1024);
        Mock::given(method("GET"))
            .and(path("/files/flaky.bin"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/flaky.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let mut rx = engine.subscribe();
        let task_id = engine
            .create_task(file_at(&server, "flaky.bin"), Priority::Normal)
            .unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Completed);
        assert_eq!(engine.task(task_id).unwrap().attempt_count, 3);

        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CoreEvent::TaskRetrying { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_short_body_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/short.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(100)))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let info = file_at(&server, "short.bin").with_size(1000);
        let task_id = engine.create_task(info, Priority::Normal).unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Failed);
        let task = engine.task(task_id).unwrap();
        assert_eq!(task.attempt_count, 3);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::MaxAttemptsExceeded);
    }

    #[tokio::test]
    async fn test_complete_partial_skips_network() {
        let server = MockServer::start().await;
        let body = payload(512);

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("done.bin");
        tokio::fs::write(part_path(&destination), &body).await.unwrap();

        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let info = file_at(&server, "done.bin")
            .with_size(body.len() as u64)
            .with_hash(ExpectedHash::sha256(sha256_hex(&body)));
        let task_id = engine.create_task(info, Priority::Normal).unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Completed);
        assert!(server.received_requests().await.unwrap().is_empty());
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_duplicate_destination_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();

        engine
            .create_task(FileInfo::new("1", "https://example.com/a/model.bin"), Priority::Normal)
            .unwrap();
        let err = engine
            .create_task(FileInfo::new("2", "https://example.com/b/model.bin"), Priority::High)
            .unwrap_err();
        assert!(matches!(err, FetchError::DestinationConflict(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();

        let err = engine
            .create_task(FileInfo::new("1", "ftp://example.com/model.bin"), Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
        tokio_test::assert_err!(engine.create_task(
            FileInfo::new("2", "not a url").with_name("model.bin"),
            Priority::Normal
        ));
        assert!(engine.all_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let task_id = engine
            .create_task(FileInfo::new("1", "https://example.com/x.bin"), Priority::Normal)
            .unwrap();

        engine.cancel(task_id).unwrap();
        assert_eq!(engine.task(task_id).unwrap().status, TaskStatus::Cancelled);
        assert!(engine
            .activate(task_id, ActivationPolicy::Dispatch)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_pause_and_resume_in_flight() {
        let server = MockServer::start().await;
        let body = payload(2048);
        Mock::given(method("GET"))
            .and(path("/files/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.clone())
                    .set_delay(Duration::from_secs(30)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/slow.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let mut rx = engine.subscribe();
        let task_id = engine
            .create_task(file_at(&server, "slow.bin"), Priority::Normal)
            .unwrap();

        engine.start(task_id).unwrap();
        assert_eq!(engine.task(task_id).unwrap().status, TaskStatus::Downloading);

        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.pause(task_id).unwrap();
        wait_for_status(&mut rx, task_id, TaskStatus::Paused).await;

        engine.resume(task_id).unwrap();
        wait_for_status(&mut rx, task_id, TaskStatus::Completed).await;
        assert_eq!(
            tokio::fs::read(dir.path().join("slow.bin")).await.unwrap(),
            body
        );
    }

    #[tokio::test]
    async fn test_expired_url_is_resolved_again() {
        let server = MockServer::start().await;
        let body = payload(1024);
        let fresh = format!("{}/signed/fresh.bin", server.uri());

        Mock::given(method("GET"))
            .and(path("/signed/stale.bin"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/download/55"))
            .respond_with(ResponseTemplate::new(307).append_header("Location", fresh.as_str()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/signed/fresh.bin"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/signed/fresh.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let api = ApiClient::new(&ApiConfig {
            base_url: server.uri(),
            min_interval_ms: 1,
            rate_limit_floor_ms: 1,
            ..ApiConfig::default()
        })
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::builder(engine_config(dir.path()))
            .api_client(api)
            .build()
            .unwrap();
        let info = FileInfo::new("55", format!("{}/signed/stale.bin", server.uri()))
            .with_name("resolved.bin");
        let task_id = engine.create_task(info, Priority::Normal).unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Completed);
        assert_eq!(
            tokio::fs::read(dir.path().join("resolved.bin")).await.unwrap(),
            body
        );
    }

    struct RejectAll;

    #[async_trait]
    impl SecurityScanner for RejectAll {
        async fn scan(&self, _path: &Path) -> Result<ScanVerdict, FetchError> {
            Ok(ScanVerdict::Malicious)
        }
    }

    #[tokio::test]
    async fn test_malicious_file_is_removed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/evil.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(64)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::builder(engine_config(dir.path()))
            .scanner(Arc::new(RejectAll))
            .build()
            .unwrap();
        let task_id = engine
            .create_task(file_at(&server, "evil.bin"), Priority::Normal)
            .unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(
            engine.task(task_id).unwrap().last_error.unwrap().kind,
            ErrorKind::Malicious
        );
        assert!(!dir.path().join("evil.bin").exists());
    }

    #[tokio::test]
    async fn test_stalled_response_headers_time_out() {
        let server = MockServer::start().await;
        let body = payload(1024);
        Mock::given(method("GET"))
            .and(path("/files/stuck.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body.clone())
                    .set_delay(Duration::from_secs(3)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/stuck.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(EngineConfig {
            read_timeout_secs: 1,
            ..engine_config(dir.path())
        })
        .unwrap();
        let mut rx = engine.subscribe();
        let task_id = engine
            .create_task(file_at(&server, "stuck.bin"), Priority::Normal)
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(10), engine.run(task_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(engine.task(task_id).unwrap().attempt_count, 2);

        let mut timeouts = 0;
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::TaskRetrying { error, .. } = event {
                assert_eq!(error, FetchError::Timeout.to_string());
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 1);
    }

    #[tokio::test]
    async fn test_mismatched_content_range_restarts_from_zero() {
        let server = MockServer::start().await;
        let body = payload(4096);
        Mock::given(method("GET"))
            .and(path("/files/shifted.bin"))
            .and(header("range", "bytes=1000-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(body.clone())
                    .append_header("Content-Range", "bytes 0-4095/4096"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/shifted.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("shifted.bin");
        tokio::fs::write(part_path(&destination), &body[..1000])
            .await
            .unwrap();

        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let task_id = engine
            .create_task(file_at(&server, "shifted.bin"), Priority::Normal)
            .unwrap();

        assert_eq!(engine.run(task_id).await.unwrap(), TaskStatus::Completed);
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
        assert_eq!(engine.task(task_id).unwrap().attempt_count, 2);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].headers.get("range").is_none());
    }

    #[tokio::test]
    async fn test_pause_keeps_partial_bytes_and_resumes_with_range() {
        let body = payload(256 * 1024);
        let stall_at = 100_000;
        let server = StallingServer::start("stall.bin", body.clone(), stall_at).await;

        let dir = tempfile::tempdir().unwrap();
        let engine = DownloadEngine::new(engine_config(dir.path())).unwrap();
        let mut rx = engine.subscribe();
        let task_id = engine
            .create_task(FileInfo::new("stall", server.url.clone()), Priority::Normal)
            .unwrap();

        engine.start(task_id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.task(task_id).unwrap().bytes_downloaded < stall_at as u64 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        engine.pause(task_id).unwrap();
        wait_for_status(&mut rx, task_id, TaskStatus::Paused).await;

        let destination = dir.path().join("stall.bin");
        assert_eq!(engine.task(task_id).unwrap().bytes_downloaded, stall_at as u64);
        assert_eq!(
            tokio::fs::metadata(part_path(&destination)).await.unwrap().len(),
            stall_at as u64
        );

        engine.resume(task_id).unwrap();
        wait_for_status(&mut rx, task_id, TaskStatus::Completed).await;

        assert_eq!(
            *server.ranges.lock(),
            vec![None, Some(format!("bytes={}-", stall_at))]
        );
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), body);
    }
}
