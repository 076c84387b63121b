//! Bulk job orchestration
//!
//! A job owns a set of engine tasks and dispatches them under a concurrency
//! ceiling. Jobs can be paused, resumed and cancelled as a unit, and a task
//! failure either degrades the job to COMPLETED_WITH_ERRORS or, with
//! fail-fast, cancels the remaining tasks.

use crate::engine::{ActivationPolicy, DownloadEngine};
use crate::error::FetchError;
use chrono::Utc;
use modelfetch_types::{
    BatchStrategy, BulkJob, CoreEvent, ErrorKind, FileInfo, JobOptions, JobProgress, JobStatus,
    JobSummary, Priority, TaskError, TaskStatus,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Control signal of a job, observed by its dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSignal {
    Running,
    Paused,
    Cancelled,
}

struct JobEntry {
    job: Mutex<BulkJob>,
    signal: watch::Sender<JobSignal>,
    /// Held while the dispatcher checks the signal and activates a task, and
    /// while pause/cancel change the signal
    gate: Mutex<()>,
    /// Tasks paused by `pause_job`; the dispatcher requeues these
    paused_by_job: Mutex<HashSet<Uuid>>,
    finished: watch::Sender<bool>,
}

/// How often tasks outside the dispatcher's control are checked
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Mutable bookkeeping of one dispatch loop
struct DispatchState {
    job_id: Uuid,
    queue: VecDeque<Uuid>,
    /// Tasks paused on their own or started outside the job
    watched: HashSet<Uuid>,
    adaptive: Option<AdaptiveController>,
    fail_fast: bool,
    failed_fast: bool,
    task_ids: Vec<Uuid>,
}

/// Schedules the tasks of bulk jobs on a shared download engine
#[derive(Clone)]
pub struct BulkOrchestrator {
    engine: DownloadEngine,
    jobs: Arc<RwLock<HashMap<Uuid, Arc<JobEntry>>>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl BulkOrchestrator {
    pub fn new(engine: DownloadEngine) -> Self {
        let event_tx = engine.event_sender();
        Self {
            engine,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    /// Create a job with one task per file, all at the job's priority
    pub async fn create_job(
        &self,
        name: impl Into<String>,
        file_infos: Vec<FileInfo>,
        strategy: BatchStrategy,
        options: JobOptions,
    ) -> Result<Uuid, FetchError> {
        let priority = options.priority;
        let files = file_infos.into_iter().map(|f| (f, priority)).collect();
        self.create_job_prioritized(name, files, strategy, options)
            .await
    }

    /// Create a job with an explicit priority per file
    ///
    /// Tasks are created but not started. If any task cannot be created the
    /// ones already registered are removed again.
    pub async fn create_job_prioritized(
        &self,
        name: impl Into<String>,
        files: Vec<(FileInfo, Priority)>,
        strategy: BatchStrategy,
        options: JobOptions,
    ) -> Result<Uuid, FetchError> {
        validate_options(&options)?;

        let mut job = BulkJob::new(name.into(), strategy, options);
        let mut created = Vec::with_capacity(files.len());

        match self.create_tasks(&job, files, &mut created).await {
            Ok(skipped) => job.skipped = skipped,
            Err(e) => {
                warn!(
                    "Creating job {} failed, rolling back {} tasks: {}",
                    job.name,
                    created.len(),
                    e
                );
                for task_id in created {
                    let _ = self.engine.remove_task(task_id, false).await;
                }
                return Err(e);
            }
        }

        job.task_ids = created;
        let job_id = job.job_id;
        info!(
            "Created job {} ({}) with {} tasks, {} skipped",
            job_id,
            job.name,
            job.task_ids.len(),
            job.skipped
        );

        let entry = Arc::new(JobEntry {
            job: Mutex::new(job),
            signal: watch::channel(JobSignal::Running).0,
            gate: Mutex::new(()),
            paused_by_job: Mutex::new(HashSet::new()),
            finished: watch::channel(false).0,
        });
        self.jobs.write().insert(job_id, entry);

        Ok(job_id)
    }

    async fn create_tasks(
        &self,
        job: &BulkJob,
        files: Vec<(FileInfo, Priority)>,
        created: &mut Vec<Uuid>,
    ) -> Result<usize, FetchError> {
        let history = if job.options.skip_downloaded {
            self.engine.history().cloned()
        } else {
            None
        };

        let mut skipped = 0;
        for (file, priority) in files {
            if let Some(history) = &history {
                if history.is_downloaded(&file.model_id, &file.id).await? {
                    debug!("Skipping already downloaded file {}", file.name);
                    skipped += 1;
                    continue;
                }
            }
            created.push(self.engine.create_task(file, priority)?);
        }
        Ok(skipped)
    }

    /// Begin dispatching a pending job in the background
    pub fn start_job(&self, job_id: Uuid) -> Result<(), FetchError> {
        let entry = self.entry(job_id)?;

        {
            let mut job = entry.job.lock();
            if job.status != JobStatus::Pending {
                return Err(FetchError::InvalidOperation(format!(
                    "Job {} has already been started",
                    job_id
                )));
            }
            job.status = JobStatus::Processing;
        }
        self.emit_job(job_id, JobStatus::Processing);
        info!("Starting job {}", job_id);

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.dispatch(entry).await;
        });

        Ok(())
    }

    /// Wait for a started job to reach a terminal status
    pub async fn wait_job(&self, job_id: Uuid) -> Result<JobSummary, FetchError> {
        let entry = self.entry(job_id)?;
        let mut finished = entry.finished.subscribe();

        if entry.job.lock().status == JobStatus::Pending {
            return Err(FetchError::InvalidOperation(format!(
                "Job {} has not been started",
                job_id
            )));
        }

        if finished.wait_for(|done| *done).await.is_err() {
            return Err(FetchError::InvalidOperation(format!(
                "Job {} was dropped before finishing",
                job_id
            )));
        }

        self.summary(job_id)
    }

    /// Start a job and wait for it
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobSummary, FetchError> {
        self.start_job(job_id)?;
        self.wait_job(job_id).await
    }

    /// Stop dispatching and pause in-flight tasks, keeping their bytes
    pub fn pause_job(&self, job_id: Uuid) -> Result<(), FetchError> {
        let entry = self.entry(job_id)?;

        {
            let _gate = entry.gate.lock();
            let mut job = entry.job.lock();
            if job.status != JobStatus::Processing {
                return Err(FetchError::InvalidOperation(format!(
                    "Cannot pause job {} in status {:?}",
                    job_id, job.status
                )));
            }
            entry.signal.send_replace(JobSignal::Paused);
            job.status = JobStatus::Paused;
        }
        self.emit_job(job_id, JobStatus::Paused);

        for task in self.engine.tasks(&self.task_ids(&entry)) {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Downloading) {
                match self.engine.pause(task.task_id) {
                    Ok(()) => {
                        entry.paused_by_job.lock().insert(task.task_id);
                    }
                    Err(e) => debug!("Task {} not paused: {}", task.task_id, e),
                }
            }
        }

        info!("Paused job {}", job_id);
        Ok(())
    }

    pub fn resume_job(&self, job_id: Uuid) -> Result<(), FetchError> {
        let entry = self.entry(job_id)?;

        {
            let _gate = entry.gate.lock();
            let mut job = entry.job.lock();
            if job.status != JobStatus::Paused {
                return Err(FetchError::InvalidOperation(format!(
                    "Cannot resume job {} in status {:?}",
                    job_id, job.status
                )));
            }
            entry.signal.send_replace(JobSignal::Running);
            job.status = JobStatus::Processing;
        }
        self.emit_job(job_id, JobStatus::Processing);

        info!("Resumed job {}", job_id);
        Ok(())
    }

    /// Cancel every non-terminal task of the job
    pub fn cancel_job(&self, job_id: Uuid) -> Result<(), FetchError> {
        let entry = self.entry(job_id)?;

        let never_started = {
            let _gate = entry.gate.lock();
            let job = entry.job.lock();
            if job.status.is_terminal() {
                return Err(FetchError::InvalidOperation(format!(
                    "Job {} already finished as {:?}",
                    job_id, job.status
                )));
            }
            entry.signal.send_replace(JobSignal::Cancelled);
            job.status == JobStatus::Pending
        };

        for task_id in self.task_ids(&entry) {
            if let Err(e) = self.engine.cancel(task_id) {
                warn!("Failed to cancel task {}: {}", task_id, e);
            }
        }
        info!("Cancelled job {}", job_id);

        // Without a dispatcher nobody else will finish the job
        if never_started {
            self.finish(&entry, JobStatus::Cancelled);
        }
        Ok(())
    }

    /// Aggregate of the job's task snapshots
    pub fn progress(&self, job_id: Uuid) -> Result<JobProgress, FetchError> {
        let entry = self.entry(job_id)?;
        let tasks = self.engine.tasks(&self.task_ids(&entry));

        let mut progress = JobProgress {
            total_tasks: tasks.len(),
            ..JobProgress::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending | TaskStatus::Paused => progress.pending_count += 1,
                TaskStatus::Downloading => progress.active_count += 1,
                TaskStatus::Completed => progress.completed_count += 1,
                TaskStatus::Failed => progress.failed_count += 1,
                TaskStatus::Cancelled => progress.cancelled_count += 1,
            }
            progress.total_bytes += task.total_bytes.unwrap_or(0);
            progress.downloaded_bytes += task.bytes_downloaded;
        }
        Ok(progress)
    }

    pub fn job(&self, job_id: Uuid) -> Result<BulkJob, FetchError> {
        Ok(self.entry(job_id)?.job.lock().clone())
    }

    pub fn jobs(&self) -> Vec<BulkJob> {
        self.jobs
            .read()
            .values()
            .map(|entry| entry.job.lock().clone())
            .collect()
    }

    pub fn summary(&self, job_id: Uuid) -> Result<JobSummary, FetchError> {
        let job = self.job(job_id)?;
        let tasks = self.engine.tasks(&job.task_ids);

        let mut summary = JobSummary {
            job_id,
            name: job.name.clone(),
            status: job.status,
            succeeded: 0,
            failed: Vec::new(),
            cancelled: 0,
            skipped: job.skipped,
        };
        for task in tasks {
            match task.status {
                TaskStatus::Completed => summary.succeeded += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
                TaskStatus::Failed => {
                    let error = task.last_error.unwrap_or_else(|| TaskError {
                        kind: ErrorKind::Other,
                        message: "unknown error".to_string(),
                    });
                    summary.failed.push((task.task_id, error));
                }
                _ => {}
            }
        }
        Ok(summary)
    }

    /// Drop a finished job and its tasks
    pub async fn archive_job(&self, job_id: Uuid) -> Result<BulkJob, FetchError> {
        let entry = self.entry(job_id)?;
        let job = entry.job.lock().clone();
        if !job.status.is_terminal() {
            return Err(FetchError::InvalidOperation(format!(
                "Job {} is still {:?}",
                job_id, job.status
            )));
        }

        for task_id in &job.task_ids {
            if let Err(e) = self.engine.remove_task(*task_id, false).await {
                debug!("Task {} not removed: {}", task_id, e);
            }
        }
        self.jobs.write().remove(&job_id);

        info!("Archived job {} ({})", job_id, job.name);
        Ok(job)
    }

    fn entry(&self, job_id: Uuid) -> Result<Arc<JobEntry>, FetchError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(FetchError::NotFound(job_id))
    }

    fn task_ids(&self, entry: &JobEntry) -> Vec<Uuid> {
        entry.job.lock().task_ids.clone()
    }

    fn emit_job(&self, job_id: Uuid, status: JobStatus) {
        let _ = self.event_tx.send(CoreEvent::JobStatusChanged { job_id, status });
    }

    fn finish(&self, entry: &JobEntry, status: JobStatus) {
        let job_id = {
            let mut job = entry.job.lock();
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.finished_at = Some(Utc::now());
            job.job_id
        };
        info!("Job {} finished: {:?}", job_id, status);
        self.emit_job(job_id, status);
        entry.finished.send_replace(true);
    }

    /// Dispatch loop of one job
    async fn dispatch(&self, entry: Arc<JobEntry>) {
        let (job_id, task_ids, strategy, options) = {
            let job = entry.job.lock();
            (
                job.job_id,
                job.task_ids.clone(),
                job.batch_strategy,
                job.options.clone(),
            )
        };

        let ceiling = concurrency_ceiling(strategy, &options);
        let semaphore = Arc::new(Semaphore::new(ceiling));
        let mut state = DispatchState {
            job_id,
            queue: dispatch_order(&self.engine, &task_ids),
            watched: HashSet::new(),
            adaptive: match strategy {
                BatchStrategy::Adaptive => {
                    let baseline = options.adaptive.map(|a| a.baseline).unwrap_or(1);
                    Some(AdaptiveController::new(semaphore.clone(), baseline, ceiling))
                }
                _ => None,
            },
            fail_fast: options.fail_fast,
            failed_fast: false,
            task_ids,
        };

        let mut signal_rx = entry.signal.subscribe();
        let mut running: JoinSet<(Uuid, TaskStatus, Duration)> = JoinSet::new();
        let mut watch_tick = tokio::time::interval(WATCH_INTERVAL);

        debug!(
            "Job {} dispatching {} tasks with ceiling {} ({:?})",
            job_id,
            state.queue.len(),
            ceiling,
            strategy
        );

        loop {
            let signal = *signal_rx.borrow_and_update();

            if signal == JobSignal::Running && !state.failed_fast {
                self.fill(&entry, &semaphore, &mut state, &mut running);
            }

            let idle = running.is_empty() && state.watched.is_empty();
            let more_to_do =
                signal != JobSignal::Cancelled && !state.failed_fast && !state.queue.is_empty();
            if idle && !more_to_do {
                if signal == JobSignal::Cancelled || state.failed_fast {
                    break;
                }
                // Tasks restarted elsewhere after they settled
                let stray: Vec<Uuid> = self
                    .engine
                    .tasks(&state.task_ids)
                    .iter()
                    .filter(|t| !t.status.is_terminal())
                    .map(|t| t.task_id)
                    .collect();
                if stray.is_empty() {
                    break;
                }
                state.watched.extend(stray);
                continue;
            }

            tokio::select! {
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    let (task_id, status, elapsed) = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            error!("Task runner of job {} panicked: {}", job_id, e);
                            continue;
                        }
                    };

                    if status == TaskStatus::Paused {
                        let paused_by_job = entry.paused_by_job.lock().contains(&task_id);
                        if paused_by_job || *entry.signal.borrow() == JobSignal::Paused {
                            state.queue.push_front(task_id);
                        } else {
                            debug!("Task {} was paused on its own, holding it", task_id);
                            state.watched.insert(task_id);
                        }
                    } else {
                        self.settle(&mut state, task_id, status, Some(elapsed));
                    }

                    if let Some(controller) = state.adaptive.as_mut() {
                        controller.reclaim();
                    }
                }
                _ = watch_tick.tick(), if !state.watched.is_empty() => {
                    self.poll_watched(&entry, &mut state);
                }
                changed = signal_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let signal = *entry.signal.borrow();
        let statuses: Vec<TaskStatus> = self
            .engine
            .tasks(&state.task_ids)
            .iter()
            .map(|t| t.status)
            .collect();
        let status = derive_job_status(&statuses, signal, state.failed_fast);
        debug_assert!(status.is_terminal(), "job {} left in {:?}", job_id, status);
        self.finish(&entry, status);
    }

    /// Account for a task that reached a terminal status
    fn settle(
        &self,
        state: &mut DispatchState,
        task_id: Uuid,
        status: TaskStatus,
        elapsed: Option<Duration>,
    ) {
        match status {
            TaskStatus::Completed => {
                if let (Some(controller), Some(elapsed)) = (state.adaptive.as_mut(), elapsed) {
                    let bytes = self
                        .engine
                        .task(task_id)
                        .map(|t| t.bytes_downloaded)
                        .unwrap_or_default();
                    let secs = elapsed.as_secs_f64().max(0.001);
                    controller.record_success(bytes as f64 / secs);
                }
            }
            TaskStatus::Failed => {
                if let Some(controller) = state.adaptive.as_mut() {
                    controller.record_failure();
                }
                if state.fail_fast && !state.failed_fast {
                    warn!(
                        "Task {} failed, failing job {} fast",
                        task_id, state.job_id
                    );
                    state.failed_fast = true;
                    self.cancel_siblings(&state.task_ids);
                }
            }
            _ => {}
        }
    }

    /// Check tasks that run or wait outside the dispatcher's control
    fn poll_watched(&self, entry: &JobEntry, state: &mut DispatchState) {
        let watched: Vec<Uuid> = state.watched.iter().copied().collect();
        for task_id in watched {
            let status = match self.engine.task(task_id) {
                Some(task) => task.status,
                None => {
                    state.watched.remove(&task_id);
                    continue;
                }
            };

            match status {
                TaskStatus::Paused if entry.paused_by_job.lock().contains(&task_id) => {
                    state.watched.remove(&task_id);
                    state.queue.push_back(task_id);
                }
                TaskStatus::Downloading | TaskStatus::Paused => {}
                TaskStatus::Pending => {
                    state.watched.remove(&task_id);
                    state.queue.push_back(task_id);
                }
                terminal => {
                    state.watched.remove(&task_id);
                    self.settle(state, task_id, terminal, None);
                }
            }
        }
    }

    /// Activate queued tasks while permits are available
    fn fill(
        &self,
        entry: &JobEntry,
        semaphore: &Arc<Semaphore>,
        state: &mut DispatchState,
        running: &mut JoinSet<(Uuid, TaskStatus, Duration)>,
    ) {
        while let Some(task_id) = state.queue.pop_front() {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    state.queue.push_front(task_id);
                    return;
                }
            };

            let activated = {
                let _gate = entry.gate.lock();
                if *entry.signal.borrow() != JobSignal::Running {
                    state.queue.push_front(task_id);
                    return;
                }
                let held = self.engine.task(task_id).map(|t| t.status) == Some(TaskStatus::Paused)
                    && !entry.paused_by_job.lock().contains(&task_id);
                if held {
                    debug!("Task {} was paused on its own, holding it", task_id);
                    state.watched.insert(task_id);
                    continue;
                }
                self.engine.activate(task_id, ActivationPolicy::Dispatch)
            };

            match activated {
                Ok(Some(transfer)) => {
                    entry.paused_by_job.lock().remove(&task_id);
                    let engine = self.engine.clone();
                    running.spawn(async move {
                        let started = Instant::now();
                        let status = engine.drive(transfer).await;
                        drop(permit);
                        (task_id, status, started.elapsed())
                    });
                }
                Ok(None) => debug!("Task {} is not dispatchable, skipping", task_id),
                Err(e) => match self.engine.task(task_id).map(|t| t.status) {
                    Some(TaskStatus::Downloading) => {
                        debug!("Task {} was started elsewhere, watching it", task_id);
                        state.watched.insert(task_id);
                    }
                    Some(_) => {
                        warn!("Failed to dispatch task {}: {}", task_id, e);
                        self.engine.reject(task_id, &e);
                        if let Some(TaskStatus::Failed) = self.engine.task(task_id).map(|t| t.status) {
                            self.settle(state, task_id, TaskStatus::Failed, None);
                        } else {
                            state.watched.insert(task_id);
                        }
                    }
                    None => debug!("Task {} was removed before dispatch", task_id),
                },
            }

            if state.failed_fast {
                return;
            }
        }
    }

    fn cancel_siblings(&self, task_ids: &[Uuid]) {
        for task in self.engine.tasks(task_ids) {
            if !task.status.is_terminal() {
                if let Err(e) = self.engine.cancel(task.task_id) {
                    warn!("Failed to cancel task {}: {}", task.task_id, e);
                }
            }
        }
    }
}

fn validate_options(options: &JobOptions) -> Result<(), FetchError> {
    if options.max_concurrent == 0 {
        return Err(FetchError::InvalidOperation(
            "max_concurrent must be at least 1".to_string(),
        ));
    }
    if let Some(limits) = options.adaptive {
        if limits.baseline == 0 || limits.hard_cap == 0 {
            return Err(FetchError::InvalidOperation(
                "adaptive limits must be at least 1".to_string(),
            ));
        }
    }
    Ok(())
}

/// Highest priority first, then submission order
fn dispatch_order(engine: &DownloadEngine, task_ids: &[Uuid]) -> VecDeque<Uuid> {
    let mut tasks = engine.tasks(task_ids);
    tasks.sort_by_key(|t| std::cmp::Reverse(t.priority));
    tasks.into_iter().map(|t| t.task_id).collect()
}

fn concurrency_ceiling(strategy: BatchStrategy, options: &JobOptions) -> usize {
    let ceiling = match strategy {
        BatchStrategy::Sequential => 1,
        BatchStrategy::Parallel => options.max_concurrent,
        BatchStrategy::Adaptive => match options.adaptive {
            Some(limits) => limits.hard_cap.min(options.max_concurrent),
            None => options.max_concurrent,
        },
    };
    ceiling.max(1)
}

/// Status of a job given its task statuses and control signals
pub fn derive_job_status(statuses: &[TaskStatus], signal: JobSignal, failed_fast: bool) -> JobStatus {
    if failed_fast {
        return JobStatus::Failed;
    }
    if signal == JobSignal::Cancelled {
        return JobStatus::Cancelled;
    }

    let unfinished = statuses.iter().filter(|s| !s.is_terminal()).count();
    if unfinished > 0 {
        if signal == JobSignal::Paused {
            return JobStatus::Paused;
        }
        let all_pending = statuses.iter().all(|s| *s == TaskStatus::Pending);
        return if all_pending {
            JobStatus::Pending
        } else {
            JobStatus::Processing
        };
    }

    if statuses.iter().any(|s| *s == TaskStatus::Failed) {
        JobStatus::CompletedWithErrors
    } else if statuses.iter().any(|s| *s == TaskStatus::Cancelled) {
        JobStatus::Cancelled
    } else {
        JobStatus::Completed
    }
}

/// Number of successes in a row before the controller considers growing
const GROWTH_STREAK: u32 = 3;

/// Concurrency controller for the ADAPTIVE strategy
///
/// The semaphore is sized to the ceiling; permits above the current limit
/// are held here so the dispatcher cannot use them.
struct AdaptiveController {
    semaphore: Arc<Semaphore>,
    withheld: Vec<OwnedSemaphorePermit>,
    ceiling: usize,
    current: usize,
    /// Permits still to withhold once running tasks release them
    debt: usize,
    streak: u32,
    window_sum: f64,
    last_mean: f64,
}

impl AdaptiveController {
    fn new(semaphore: Arc<Semaphore>, baseline: usize, ceiling: usize) -> Self {
        let current = baseline.clamp(1, ceiling);
        let mut controller = Self {
            semaphore,
            withheld: Vec::new(),
            ceiling,
            current,
            debt: ceiling - current,
            streak: 0,
            window_sum: 0.0,
            last_mean: 0.0,
        };
        controller.reclaim();
        controller
    }

    #[cfg(test)]
    fn limit(&self) -> usize {
        self.current
    }

    /// Record a completed task and its throughput in bytes per second
    fn record_success(&mut self, throughput: f64) {
        self.streak += 1;
        self.window_sum += throughput;

        if self.streak >= GROWTH_STREAK {
            let mean = self.window_sum / self.streak as f64;
            if mean >= self.last_mean && self.current < self.ceiling {
                self.grow();
            }
            self.last_mean = mean;
            self.streak = 0;
            self.window_sum = 0.0;
        }
    }

    fn record_failure(&mut self) {
        self.streak = 0;
        self.window_sum = 0.0;
        if self.current > 1 {
            self.current -= 1;
            self.debt += 1;
            self.reclaim();
            debug!("Adaptive concurrency lowered to {}", self.current);
        }
    }

    fn grow(&mut self) {
        self.current += 1;
        if self.debt > 0 {
            self.debt -= 1;
        } else {
            self.withheld.pop();
        }
        debug!("Adaptive concurrency raised to {}", self.current);
    }

    /// Take back permits owed since the last shrink
    fn reclaim(&mut self) {
        while self.debt > 0 {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    self.withheld.push(permit);
                    self.debt -= 1;
                }
                Err(_) => break,
            }
        }
    }
}
