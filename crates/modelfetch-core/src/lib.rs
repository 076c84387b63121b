//! modelfetch Core - catalog client and bulk download engine
//!
//! This crate talks to the model catalog through a rate-limited, cached API
//! client, and downloads files with resumable, verified transfers that can be
//! grouped into bulk jobs.

pub mod api;
pub mod bulk;
pub mod config;
pub mod engine;
mod error;
pub mod history;
pub mod retry;
pub mod scanner;

pub use api::ApiClient;
pub use bulk::{BulkOrchestrator, JobSignal};
pub use config::*;
pub use engine::{ActivationPolicy, DownloadEngine};
pub use error::*;
pub use history::{HistoryStore, MemoryHistory, SqliteHistory};
pub use scanner::{ExtensionScanner, SecurityScanner};

use futures::Stream;
use modelfetch_types::{
    BatchStrategy, CoreEvent, FileInfo, JobOptions, JobSummary, Model, SearchPage, SearchParams,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// The main modelfetch core instance
#[derive(Clone)]
pub struct FetchCore {
    api: ApiClient,
    engine: DownloadEngine,
    orchestrator: BulkOrchestrator,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl FetchCore {
    /// Wire the API client, engine and orchestrator from one configuration
    pub async fn new(config: CoreConfig) -> Result<Self, FetchError> {
        Self::with_scanner(config, None).await
    }

    pub async fn with_scanner(
        config: CoreConfig,
        scanner: Option<Arc<dyn SecurityScanner>>,
    ) -> Result<Self, FetchError> {
        let api = ApiClient::new(&config.api)?;

        let history: Arc<dyn HistoryStore> = match &config.history_db {
            Some(path) => Arc::new(SqliteHistory::open(path).await?),
            None => Arc::new(MemoryHistory::new()),
        };

        // Event channel
        let (event_tx, _) = broadcast::channel(1000);

        let mut builder = DownloadEngine::builder(config.engine)
            .api_client(api.clone())
            .history(history)
            .event_sender(event_tx.clone());
        if let Some(scanner) = scanner {
            builder = builder.scanner(scanner);
        }
        let engine = builder.build()?;
        let orchestrator = BulkOrchestrator::new(engine.clone());

        info!("modelfetch core ready, catalog at {}", config.api.base_url);

        Ok(Self {
            api,
            engine,
            orchestrator,
            event_tx,
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    pub fn orchestrator(&self) -> &BulkOrchestrator {
        &self.orchestrator
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn events(&self) -> impl Stream<Item = CoreEvent> {
        self.engine.events()
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    pub async fn search(
        &self,
        params: &SearchParams,
        cursor: Option<&str>,
    ) -> Result<SearchPage, FetchError> {
        self.api.search(params, cursor).await
    }

    pub async fn model(&self, model_id: u64) -> Result<Model, FetchError> {
        self.api.get_model(model_id).await
    }

    /// Download entries for the files of one version of a model
    ///
    /// Without a version id the first (newest) version is used.
    pub async fn model_files(
        &self,
        model_id: u64,
        version_id: Option<u64>,
    ) -> Result<Vec<FileInfo>, FetchError> {
        let model = self.api.get_model(model_id).await?;
        let version = match version_id {
            Some(id) => model.model_versions.iter().find(|v| v.id == id),
            None => model.model_versions.first(),
        }
        .ok_or_else(|| {
            FetchError::InvalidOperation(format!("Model {} has no matching version", model_id))
        })?;

        let base = self.api.base_url();
        Ok(version
            .files
            .iter()
            .map(|file| {
                let fallback = format!("{}/download/{}", base, file.id);
                file.to_file_info(model_id, &fallback)
            })
            .collect())
    }

    // ========================================================================
    // Bulk Jobs
    // ========================================================================

    pub async fn create_job(
        &self,
        name: impl Into<String>,
        file_infos: Vec<FileInfo>,
        strategy: BatchStrategy,
        options: JobOptions,
    ) -> Result<Uuid, FetchError> {
        self.orchestrator
            .create_job(name, file_infos, strategy, options)
            .await
    }

    pub async fn run_job(&self, job_id: Uuid) -> Result<JobSummary, FetchError> {
        self.orchestrator.run_job(job_id).await
    }

    pub fn cancel_job(&self, job_id: Uuid) -> Result<(), FetchError> {
        self.orchestrator.cancel_job(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelfetch_types::JobStatus;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn core_config(server: &MockServer, dir: &std::path::Path) -> CoreConfig {
        let mut config = CoreConfig::default();
        config.api.base_url = server.uri();
        config.api.min_interval_ms = 1;
        config.api.rate_limit_floor_ms = 1;
        config.api.retry.base_delay_ms = 1;
        config.engine = config.engine.with_download_dir(dir);
        config.engine.retry.base_delay_ms = 1;
        config
    }

    #[tokio::test]
    async fn test_model_files_to_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "name": "Tiny",
                "modelVersions": [{
                    "id": 7,
                    "name": "v1",
                    "files": [
                        { "id": 100, "name": "tiny.safetensors", "primary": true },
                        { "id": 101, "name": "tiny.yaml" }
                    ]
                }]
            })))
            .mount(&server)
            .await;
        for id in [100, 101] {
            Mock::given(method("GET"))
                .and(path(format!("/download/{}", id)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let core = FetchCore::new(core_config(&server, dir.path())).await.unwrap();

        let files = core.model_files(42, None).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.model_id == "42"));

        let mut rx = core.subscribe();
        let job_id = core
            .create_job("tiny", files, BatchStrategy::Parallel, JobOptions::new(2))
            .await
            .unwrap();
        let summary = core.run_job(job_id).await.unwrap();

        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.succeeded, 2);
        assert!(dir.path().join("tiny.safetensors").exists());

        let mut saw_job_event = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CoreEvent::JobStatusChanged { .. }) {
                saw_job_event = true;
            }
        }
        assert!(saw_job_event);

        assert!(core
            .engine()
            .history()
            .unwrap()
            .is_downloaded("42", "100")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_version_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 9,
                "name": "Empty",
                "modelVersions": []
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let core = FetchCore::new(core_config(&server, dir.path())).await.unwrap();
        assert!(matches!(
            core.model_files(9, None).await,
            Err(FetchError::InvalidOperation(_))
        ));
    }
}
