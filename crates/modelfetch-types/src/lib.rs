//! Shared types for modelfetch
//!
//! This crate contains the data structures shared between the core
//! library and the CLI: file descriptors, task and job records, progress
//! events and the catalog API models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// File Types
// ============================================================================

/// Digest algorithm used for integrity verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// Expected digest of a file, stored as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedHash {
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

impl ExpectedHash {
    pub fn new(algorithm: HashAlgorithm, digest: impl Into<String>) -> Self {
        Self {
            algorithm,
            digest: digest.into().trim().to_lowercase(),
        }
    }

    pub fn sha256(digest: impl Into<String>) -> Self {
        Self::new(HashAlgorithm::Sha256, digest)
    }

    /// Compare against a computed hex digest, ignoring case
    pub fn matches(&self, actual: &str) -> bool {
        self.digest.eq_ignore_ascii_case(actual.trim())
    }
}

/// Immutable descriptor of a remote file to download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    /// Catalog model this file belongs to
    #[serde(default)]
    pub model_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub expected_hash: Option<ExpectedHash>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl FileInfo {
    /// Create a descriptor whose name is taken from the last URL path segment
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let name = url::Url::parse(&url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|s| s.filter(|p| !p.is_empty()).last().map(str::to_string))
            })
            .unwrap_or_else(|| "download".to_string());

        Self {
            id: id.into(),
            model_id: String::new(),
            name,
            url,
            expected_size: None,
            expected_hash: None,
            content_type: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_hash(mut self, hash: ExpectedHash) -> Self {
        self.expected_hash = Some(hash);
        self
    }
}

// ============================================================================
// Task Types
// ============================================================================

/// Status of a single download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks only move again on an explicit restart
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Scheduling priority; higher priorities are dispatched first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Classification of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    ClientError,
    ServerError,
    HashMismatch,
    Disk,
    Cancelled,
    MaxAttemptsExceeded,
    DestinationConflict,
    Malicious,
    Parse,
    Other,
}

/// Serializable record of why a task failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A unit of work: one file moving from the catalog to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub task_id: Uuid,
    pub file_info: FileInfo,
    pub destination: PathBuf,
    pub status: TaskStatus,
    pub bytes_downloaded: u64,
    /// Known or discovered size of the file
    pub total_bytes: Option<u64>,
    pub attempt_count: u32,
    pub priority: Priority,
    pub last_error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(file_info: FileInfo, destination: PathBuf, priority: Priority) -> Self {
        let total_bytes = file_info.expected_size;
        Self {
            task_id: Uuid::new_v4(),
            file_info,
            destination,
            status: TaskStatus::Pending,
            bytes_downloaded: 0,
            total_bytes,
            attempt_count: 0,
            priority,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ============================================================================
// Job Types
// ============================================================================

/// Dispatch policy for the tasks of a bulk job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStrategy {
    Sequential,
    #[default]
    Parallel,
    Adaptive,
}

/// Aggregate status of a bulk job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

/// Bounds for the adaptive batch strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveLimits {
    /// Concurrency the job starts with
    pub baseline: usize,
    /// Ceiling the controller never exceeds
    pub hard_cap: usize,
}

/// Options for a bulk job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_concurrent: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub priority: Priority,
    /// Skip files the history store already knows about
    #[serde(default)]
    pub skip_downloaded: bool,
    #[serde(default)]
    pub adaptive: Option<AdaptiveLimits>,
}

impl JobOptions {
    /// `max_concurrent` has no default and must be supplied by the caller
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            fail_fast: false,
            priority: Priority::Normal,
            skip_downloaded: false,
            adaptive: None,
        }
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn skip_downloaded(mut self, skip: bool) -> Self {
        self.skip_downloaded = skip;
        self
    }

    pub fn with_adaptive(mut self, baseline: usize, hard_cap: usize) -> Self {
        self.adaptive = Some(AdaptiveLimits { baseline, hard_cap });
        self
    }
}

/// A named collection of download tasks managed as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub job_id: Uuid,
    pub name: String,
    pub task_ids: Vec<Uuid>,
    pub batch_strategy: BatchStrategy,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Files filtered out because they were already downloaded
    pub skipped: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BulkJob {
    pub fn new(name: String, batch_strategy: BatchStrategy, options: JobOptions) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            name,
            task_ids: Vec::new(),
            batch_strategy,
            options,
            status: JobStatus::Pending,
            skipped: 0,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Point-in-time aggregate of a job's tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_tasks: usize,
    pub pending_count: usize,
    pub active_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub cancelled_count: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

/// Final report of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub succeeded: usize,
    pub failed: Vec<(Uuid, TaskError)>,
    pub cancelled: usize,
    pub skipped: usize,
}

impl std::fmt::Display for JobSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{:?}]: {} succeeded, {} failed, {} cancelled, {} skipped",
            self.name,
            self.status,
            self.succeeded,
            self.failed.len(),
            self.cancelled,
            self.skipped
        )
    }
}

// ============================================================================
// Events
// ============================================================================

/// Ephemeral progress sample for a running task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: Uuid,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second
    pub instantaneous_speed: u64,
    /// Seconds remaining, when both size and speed are known
    pub eta: Option<u64>,
}

/// Events emitted by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Progress(ProgressUpdate),
    TaskStatusChanged {
        task_id: Uuid,
        status: TaskStatus,
        error: Option<TaskError>,
    },
    TaskRetrying {
        task_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobStatusChanged {
        job_id: Uuid,
        status: JobStatus,
    },
}

// ============================================================================
// Security Scanner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanVerdict {
    Safe,
    Suspicious,
    Malicious,
}

// ============================================================================
// Catalog API Types
// ============================================================================

/// Query parameters for the catalog search endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    pub tag: Option<String>,
    pub username: Option<String>,
    pub sort: Option<String>,
    pub period: Option<String>,
    pub nsfw: Option<bool>,
    #[serde(default)]
    pub base_models: Vec<String>,
    /// Page size requested from the server
    pub limit: Option<u32>,
}

impl SearchParams {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    /// Flatten into query pairs, repeating keys for list values
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(query) = &self.query {
            pairs.push(("query".to_string(), query.clone()));
        }
        for t in &self.types {
            pairs.push(("types".to_string(), t.clone()));
        }
        if let Some(tag) = &self.tag {
            pairs.push(("tag".to_string(), tag.clone()));
        }
        if let Some(username) = &self.username {
            pairs.push(("username".to_string(), username.clone()));
        }
        if let Some(sort) = &self.sort {
            pairs.push(("sort".to_string(), sort.clone()));
        }
        if let Some(period) = &self.period {
            pairs.push(("period".to_string(), period.clone()));
        }
        if let Some(nsfw) = self.nsfw {
            pairs.push(("nsfw".to_string(), nsfw.to_string()));
        }
        for base in &self.base_models {
            pairs.push(("baseModels".to_string(), base.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub username: String,
    #[serde(default)]
    pub image: Option<String>,
}

/// A catalog model with its versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: u64,
    pub name: String,
    #[serde(default, rename = "type")]
    pub model_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub creator: Option<Creator>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub files: Vec<ModelFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    pub id: u64,
    pub name: String,
    /// Size as reported by the catalog, in kilobytes
    #[serde(default, rename = "sizeKB")]
    pub size_kb: Option<f64>,
    #[serde(default, rename = "type")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl ModelFile {
    /// Build a download descriptor, preferring the catalog's SHA256 digest
    pub fn to_file_info(&self, model_id: u64, fallback_url: &str) -> FileInfo {
        let expected_hash = self
            .hashes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("sha256"))
            .map(|(_, v)| ExpectedHash::sha256(v.clone()));

        FileInfo {
            id: self.id.to_string(),
            model_id: model_id.to_string(),
            name: self.name.clone(),
            url: self
                .download_url
                .clone()
                .unwrap_or_else(|| fallback_url.to_string()),
            expected_size: self.size_kb.map(|kb| (kb * 1024.0).round() as u64),
            expected_hash,
            content_type: self.file_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub total_items: Option<u64>,
}

/// Wire format of a search response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub items: Vec<Model>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub metadata: Option<PageMetadata>,
}

impl SearchResponse {
    /// Cursor for the next page, from the top level or the metadata block
    pub fn cursor(&self) -> Option<String> {
        self.next_cursor
            .clone()
            .or_else(|| self.metadata.as_ref().and_then(|m| m.next_cursor.clone()))
            .filter(|c| !c.is_empty())
    }
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<Model>,
    pub next_cursor: Option<String>,
}

impl From<SearchResponse> for SearchPage {
    fn from(response: SearchResponse) -> Self {
        let next_cursor = response.cursor();
        Self {
            items: response.items,
            next_cursor,
        }
    }
}
