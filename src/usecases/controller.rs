//! Job controller: owns one job's queue, scanner, worker pool and state
//! machine; every control operation passes through a per-job exclusive
//! lock so duplicate starts can never spawn parallel controllers.
//!
//! Resolve, scan and download run concurrently once the first media item
//! is ready. The controller's supervise loop folds live counters into the
//! descriptor, persists on every transition plus a periodic tick, and
//! finalises when the scanner is done and the queue has drained.

use crate::adapters::delegated::DelegatedDownloader;
use crate::adapters::persistence::ResumeStore;
use crate::domain::{EngineError, ExportJob, ItemKey, JobState, MediaStatus};
use crate::ports::TgGateway;
use crate::usecases::chat_resolver::ChatResolver;
use crate::usecases::queue::{DownloadQueue, QueueProjections};
use crate::usecases::reporter::ProgressReporter;
use crate::usecases::scanner::{MessageScanner, ScanContext, ScanProgress};
use crate::usecases::worker_pool::WorkerPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Supervise-loop cadence.
const TICK: Duration = Duration::from_secs(1);
/// Descriptor + queue snapshot persistence cadence while running.
const PERSIST_EVERY: Duration = Duration::from_secs(5);

pub struct JobController {
    job: RwLock<ExportJob>,
    gateway: Arc<dyn TgGateway>,
    store: Arc<ResumeStore>,
    queue: Arc<DownloadQueue>,
    reporter: Arc<ProgressReporter>,
    progress: Arc<ScanProgress>,
    /// Present when the config names a delegated downloader.
    delegated: Option<Arc<DelegatedDownloader>>,
    /// Re-entrancy guard: a second concurrent control call gets Busy
    /// instead of a second controller.
    op_lock: Mutex<()>,
    /// Replaced with a fresh token on each re-entry after a cancel.
    cancel: std::sync::Mutex<CancellationToken>,
    pause_tx: watch::Sender<bool>,
    pool: std::sync::Mutex<Option<Arc<WorkerPool>>>,
    run_active: AtomicBool,
}

impl JobController {
    pub fn new(
        job: ExportJob,
        gateway: Arc<dyn TgGateway>,
        store: Arc<ResumeStore>,
        delegated: Option<Arc<DelegatedDownloader>>,
        queue_soft_cap: usize,
    ) -> Arc<Self> {
        let (pause_tx, _) = watch::channel(job.state == JobState::Paused);
        Arc::new(Self {
            job: RwLock::new(job),
            gateway,
            store,
            queue: Arc::new(DownloadQueue::new(queue_soft_cap)),
            reporter: Arc::new(ProgressReporter::new()),
            progress: Arc::new(ScanProgress::default()),
            delegated,
            op_lock: Mutex::new(()),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            pause_tx,
            pool: std::sync::Mutex::new(None),
            run_active: AtomicBool::new(false),
        })
    }

    /// Restore the persisted queue into memory and reconcile partials:
    /// an on-disk `.partial` length is authoritative for resume.
    pub async fn rehydrate(&self) -> Result<(), EngineError> {
        let job_id = self.id().await;
        let export_root = self.job.read().await.export_dir();
        let items = self.store.load_queue(job_id).await?;
        for mut item in items {
            if item.status != MediaStatus::Completed {
                let partial = export_root.join(item.relative_partial_path());
                item.downloaded_bytes = match tokio::fs::metadata(&partial).await {
                    Ok(m) => m.len().min(item.size),
                    Err(_) => 0,
                };
            }
            self.queue.restore(item).await;
        }
        Ok(())
    }

    pub async fn id(&self) -> uuid::Uuid {
        self.job.read().await.id
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel lock").clone()
    }

    /// Descriptor + live aggregates, for the API.
    pub async fn snapshot(&self) -> ExportJob {
        let mut job = self.job.read().await.clone();
        self.fold_aggregates(&mut job);
        job
    }

    pub async fn downloads(&self, limit: usize, reversed: bool) -> QueueProjections {
        self.queue.projections(limit, reversed).await
    }

    fn fold_aggregates(&self, job: &mut ExportJob) {
        let counts = self.queue.counts();
        let a = &mut job.aggregates;
        a.total_media = counts.total;
        a.processed_media = counts.processed();
        a.failed_media = counts.failed;
        a.total_bytes = counts.total_bytes;
        a.downloaded_bytes = counts.downloaded_bytes;
        a.speed_bps = self.reporter.speed_bps();
        a.processed_messages = self
            .progress
            .processed_messages
            .load(Ordering::Relaxed)
            .max(a.processed_messages);
        a.current_message_id = self.progress.current_message_id.load(Ordering::Relaxed);
        a.current_chat = self.progress.current_chat();
    }

    async fn transition(&self, to: JobState) -> Result<(), EngineError> {
        let mut job = self.job.write().await;
        if !job.state.can_transition(to) {
            return Err(EngineError::InvalidState(format!(
                "{} -> {}",
                job.state, to
            )));
        }
        info!(job_id = %job.id, from = %job.state, to = %to, "job state transition");
        job.state = to;
        self.fold_aggregates(&mut job);
        let snapshot = job.clone();
        drop(job);
        self.store.save_job(&snapshot).await
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let mut job = self.job.write().await;
        self.fold_aggregates(&mut job);
        let snapshot = job.clone();
        drop(job);
        self.store.save_job(&snapshot).await
    }

    // ---- control operations (all behind the op lock) ----

    /// pending → extracting; spawns the run task. A second concurrent
    /// start is rejected with Busy, a repeated start with InvalidState.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        {
            let state = self.job.read().await.state;
            if state != JobState::Pending {
                return Err(if state == JobState::Extracting || state == JobState::Running {
                    EngineError::Busy
                } else {
                    EngineError::InvalidState(format!("start from {}", state))
                });
            }
        }
        self.transition(JobState::Extracting).await?;
        self.spawn_run();
        Ok(())
    }

    /// running/extracting → paused: workers release after their current
    /// chunk, the scanner suspends at its next checkpoint.
    pub async fn pause(&self) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        self.transition(JobState::Paused).await?;
        self.queue.set_paused(true);
        let _ = self.pause_tx.send(true);
        Ok(())
    }

    /// paused → running: wake workers, scanner resumes from its cursors.
    pub async fn resume(self: &Arc<Self>) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        self.transition(JobState::Running).await?;
        self.queue.set_paused(false);
        self.reporter.reset_window();
        let _ = self.pause_tx.send(false);
        // A rehydrated paused job has no live run task yet.
        if !self.run_active.load(Ordering::Acquire) {
            self.spawn_run();
        }
        Ok(())
    }

    /// → cancelled: every blocking operation reacts within one chunk or
    /// one page; partials are flushed and retained.
    pub async fn cancel(&self) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        self.transition(JobState::Cancelled).await?;
        self.cancel.lock().expect("cancel lock").cancel();
        let _ = self.pause_tx.send(false);
        Ok(())
    }

    /// Move all failed items back to waiting; re-enters the drain when the
    /// job had already reached a terminal state. No failures, no-op.
    pub async fn retry_failed(self: &Arc<Self>) -> Result<usize, EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        let moved = self.queue.retry_all_failed().await;
        if moved > 0 {
            self.reenter_if_terminal().await?;
        }
        self.persist().await?;
        Ok(moved)
    }

    /// Move one item back to waiting. Completed items may be forced back
    /// (explicit operator intent).
    pub async fn retry_item(self: &Arc<Self>, key: ItemKey) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        if !self.queue.retry(key, true).await {
            return Err(EngineError::NotFound(format!("item {}", key)));
        }
        self.reenter_if_terminal().await?;
        self.persist().await?;
        Ok(())
    }

    pub async fn pause_item(&self, key: ItemKey) -> Result<(), EngineError> {
        if !self.queue.pause_item(key).await {
            return Err(EngineError::NotFound(format!("item {}", key)));
        }
        Ok(())
    }

    pub async fn resume_item(&self, key: ItemKey) -> Result<(), EngineError> {
        if !self.queue.resume_item(key).await {
            return Err(EngineError::NotFound(format!("item {}", key)));
        }
        Ok(())
    }

    pub async fn cancel_item(&self, key: ItemKey) -> Result<(), EngineError> {
        if !self.queue.skip(key).await {
            return Err(EngineError::NotFound(format!("item {}", key)));
        }
        Ok(())
    }

    /// Walk completed and failed items, compare on-disk length against the
    /// announced size, and force-requeue any mismatch with attempts reset.
    pub async fn verify(self: &Arc<Self>) -> Result<String, EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        {
            let mut job = self.job.write().await;
            job.aggregates.verifying = true;
        }
        let export_root = self.job.read().await.export_dir();

        let mut checked = 0u64;
        let mut reclassified = 0u64;
        for item in self.queue.items_snapshot().await {
            if !matches!(item.status, MediaStatus::Completed | MediaStatus::Failed) {
                continue;
            }
            checked += 1;
            let path = export_root.join(item.relative_path());
            let on_disk = tokio::fs::metadata(&path).await.map(|m| m.len()).ok();
            if on_disk != Some(item.size) {
                // Forced re-download with the attempt counter reset; a
                // failed item with a full-length file is left alone (its
                // next retry short-circuits on the de-dup check anyway).
                self.queue.retry(item.key, true).await;
                reclassified += 1;
            }
        }

        let summary = format!(
            "verified {} items, {} queued for re-download",
            checked, reclassified
        );
        {
            let mut job = self.job.write().await;
            job.aggregates.verifying = false;
            job.aggregates.last_verification = Some(summary.clone());
        }
        if reclassified > 0 {
            self.reenter_if_terminal().await?;
        }
        self.persist().await?;
        info!(job_id = %self.id().await, %summary, "verification finished");
        Ok(summary)
    }

    /// Trigger a rescan. `full` resets the per-chat cursors so the whole
    /// range is walked again; incremental picks up from the cursors.
    pub async fn scan(self: &Arc<Self>, full: bool) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        if self.run_active.load(Ordering::Acquire) {
            return Err(EngineError::Busy);
        }
        if self.job.read().await.state == JobState::Pending {
            return Err(EngineError::InvalidState("start the job first".into()));
        }
        let job_id = self.id().await;
        if full {
            self.store.clear_cursors(job_id).await?;
        }
        self.reenter_if_terminal().await?;
        {
            let state = self.job.read().await.state;
            if state == JobState::Running && !self.run_active.load(Ordering::Acquire) {
                self.spawn_run();
            }
        }
        Ok(())
    }

    /// Mutate the worker bound (and parallel-chunk flag) at runtime.
    pub async fn set_concurrency(
        &self,
        max_concurrent: u32,
        parallel_chunk: Option<bool>,
    ) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        let clamped = {
            let mut job = self.job.write().await;
            job.performance.max_concurrent_downloads = max_concurrent;
            if let Some(p) = parallel_chunk {
                job.performance.parallel_chunk = p;
            }
            job.performance.clamped_concurrency()
        };
        if let Some(pool) = self.pool.lock().expect("pool lock").clone() {
            pool.set_concurrency(clamped);
            if let Some(p) = parallel_chunk {
                pool.set_parallel_chunk(p);
            }
        }
        self.persist().await
    }

    /// Toggle the delegated downloader. Takes effect at the next drain
    /// start (start/resume/retry re-entry).
    pub async fn set_delegated(&self, enabled: bool) -> Result<(), EngineError> {
        let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
        if enabled && self.delegated.is_none() {
            return Err(EngineError::Delegated(
                "no delegated downloader configured".into(),
            ));
        }
        {
            let mut job = self.job.write().await;
            job.performance.delegated = enabled;
        }
        self.persist().await
    }

    /// Stop everything for deletion: cancel if still active and wait for
    /// the run task to let go.
    pub async fn shutdown_for_delete(&self) -> Result<(), EngineError> {
        {
            let state = self.job.read().await.state;
            if !state.is_terminal() {
                let _guard = self.op_lock.try_lock().map_err(|_| EngineError::Busy)?;
                self.transition(JobState::Cancelled).await?;
                self.cancel.lock().expect("cancel lock").cancel();
            }
        }
        let mut waited = Duration::ZERO;
        while self.run_active.load(Ordering::Acquire) && waited < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += Duration::from_millis(100);
        }
        Ok(())
    }

    /// Terminal → running re-entry used by retry/verify/scan; also
    /// re-arms the cancellation token.
    async fn reenter_if_terminal(self: &Arc<Self>) -> Result<(), EngineError> {
        let state = self.job.read().await.state;
        if !state.is_terminal() {
            return Ok(());
        }
        {
            let mut guard = self.cancel.lock().expect("cancel lock");
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
        }
        self.transition(JobState::Running).await?;
        self.queue.set_paused(false);
        let _ = self.pause_tx.send(false);
        if !self.run_active.load(Ordering::Acquire) {
            self.spawn_run();
        }
        Ok(())
    }

    // ---- the run task ----

    pub(crate) fn spawn_run(self: &Arc<Self>) {
        if self.run_active.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run().await;
            this.run_active.store(false, Ordering::Release);
            if let Err(e) = result {
                error!(error = %e, "job run failed");
                let failed_state = {
                    let mut job = this.job.write().await;
                    if job.state.can_transition(JobState::Failed) {
                        job.state = JobState::Failed;
                    }
                    job.aggregates.last_error = Some(e.to_string());
                    job.clone()
                };
                if let Err(pe) = this.store.save_job(&failed_state).await {
                    error!(error = %pe, "persisting failed state also failed");
                }
            }
        });
    }

    async fn run(self: &Arc<Self>) -> Result<(), EngineError> {
        let cancel = self.cancel_token();
        let (job_id, filter, only_my, export_root, performance) = {
            let job = self.job.read().await;
            (
                job.id,
                job.filter.clone(),
                job.filter.only_my_messages,
                job.export_dir(),
                job.performance.clone(),
            )
        };
        tokio::fs::create_dir_all(&export_root)
            .await
            .map_err(EngineError::store)?;

        // Resolve the chat list; totals are heuristic until the scan ends.
        let resolver = ChatResolver::new(Arc::clone(&self.gateway));
        let chats = resolver.resolve(&filter).await?;
        {
            let mut job = self.job.write().await;
            job.aggregates.total_messages = chats
                .iter()
                .map(|c| {
                    let head = c.top_message_id.unwrap_or(0).max(0);
                    let hi = match (filter.message_to, head) {
                        (0, h) => h,
                        (to, 0) => to,
                        (to, h) => to.min(h),
                    };
                    (hi - filter.effective_from() + 1).max(0) as u64
                })
                .sum();
        }

        if chats.is_empty() {
            info!(job_id = %job_id, "no chats matched the filter");
            self.transition(JobState::Completed).await?;
            return Ok(());
        }

        let me_id = if only_my {
            Some(self.gateway.get_me_id().await?)
        } else {
            None
        };

        // Scanner runs concurrently with the drain.
        let scanner = MessageScanner::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.progress),
        );
        let ctx = ScanContext {
            job_id,
            filter: filter.clone(),
            me_id,
            cancel: cancel.clone(),
            paused: self.pause_tx.subscribe(),
        };
        let scan_task = {
            let chats = chats.clone();
            tokio::spawn(async move {
                for chat in &chats {
                    if ctx.cancel.is_cancelled() {
                        break;
                    }
                    let outcome = scanner.scan_chat(&ctx, chat).await?;
                    if outcome.interrupted {
                        break;
                    }
                }
                Ok::<(), EngineError>(())
            })
        };
        tokio::pin!(scan_task);

        // extracting → running at the first ready media item (or straight
        // to completed when the scan produces nothing).
        let mut scan_result: Option<Result<(), EngineError>> = None;
        while self.queue.counts().total == 0 {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if scan_result.is_some() {
                break;
            }
            tokio::select! {
                joined = &mut scan_task => {
                    scan_result = Some(flatten_join(joined));
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        if let Some(Err(e)) = scan_result.take_if(|r| r.is_err()) {
            return Err(e);
        }
        if scan_result.is_some() && self.queue.counts().total == 0 {
            // Zero media: reconcile totals and finalise.
            self.reconcile_totals().await;
            let state = self.job.read().await.state;
            if state == JobState::Extracting || state == JobState::Running {
                self.transition(JobState::Completed).await?;
            }
            return Ok(());
        }

        {
            let state = self.job.read().await.state;
            if state == JobState::Extracting {
                self.transition(JobState::Running).await?;
            }
        }

        // Choose the drain: in-process pool or delegated process.
        let delegated = self
            .delegated
            .clone()
            .filter(|_| performance.delegated);
        let pool = if delegated.is_none() {
            let pool = WorkerPool::new(
                Arc::clone(&self.gateway),
                Arc::clone(&self.queue),
                Arc::clone(&self.store),
                Arc::clone(&self.reporter),
                job_id,
                export_root.clone(),
                cancel.clone(),
                performance.parallel_chunk,
            );
            pool.set_concurrency(performance.clamped_concurrency());
            *self.pool.lock().expect("pool lock") = Some(Arc::clone(&pool));
            Some(pool)
        } else {
            None
        };

        let mut delegated_task = delegated.map(|dl| {
            let queue = Arc::clone(&self.queue);
            let reporter = Arc::clone(&self.reporter);
            let cancel = cancel.clone();
            let root = export_root.clone();
            tokio::spawn(async move {
                delegated_drain(dl, root, queue, reporter, cancel).await;
            })
        });

        // Supervise: persist ticks, fatal checks, completion detection.
        let mut last_persist = tokio::time::Instant::now();
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            tokio::select! {
                joined = &mut scan_task, if scan_result.is_none() => {
                    scan_result = Some(flatten_join(joined));
                }
                _ = tokio::time::sleep(TICK) => {}
            }

            if let Some(pool) = self.pool.lock().expect("pool lock").clone() {
                if let Some(fatal) = pool.take_fatal() {
                    break Err(EngineError::Gateway(fatal));
                }
            }
            if let Some(Err(e)) = scan_result.take_if(|r| r.is_err()) {
                break Err(e);
            }

            if last_persist.elapsed() >= PERSIST_EVERY {
                self.persist().await.ok();
                let snapshot = self.queue.items_snapshot().await;
                self.store.save_queue(job_id, &snapshot).await.ok();
                last_persist = tokio::time::Instant::now();
            }

            let paused = *self.pause_tx.borrow();
            let scan_done = matches!(scan_result, Some(Ok(())));
            if scan_done && !paused && self.queue.counts().all_terminal() {
                break Ok(());
            }
        };

        // Wind down the drain before finalising.
        if let Some(task) = delegated_task.take() {
            task.abort();
            let _ = task.await;
        }
        // Pool workers exit via the cancellation token or the idle check.
        drop(pool);
        *self.pool.lock().expect("pool lock") = None;

        match result {
            Ok(()) => {
                self.reconcile_totals().await;
                let snapshot = self.queue.items_snapshot().await;
                self.store.save_queue(job_id, &snapshot).await?;
                let state = self.job.read().await.state;
                if state == JobState::Running {
                    self.transition(JobState::Completed).await?;
                } else {
                    self.persist().await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Scanning finished: exact counts replace the heuristics.
    async fn reconcile_totals(&self) {
        let counts = self.queue.counts();
        let mut job = self.job.write().await;
        self.fold_aggregates(&mut job);
        job.aggregates.total_messages = job.aggregates.processed_messages;
        job.aggregates.total_media = counts.total;
    }
}

/// Drain loop for delegated mode: batch currently waiting items by target
/// directory and hand each group to the external process.
async fn delegated_drain(
    dl: Arc<DelegatedDownloader>,
    export_root: std::path::PathBuf,
    queue: Arc<DownloadQueue>,
    reporter: Arc<ProgressReporter>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut batch = Vec::new();
        while let Some(item) = queue.claim_next().await {
            batch.push(item);
        }
        if batch.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = queue.wait_for_work() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            continue;
        }
        for (dir, group) in DelegatedDownloader::group_by_dir(batch) {
            if cancel.is_cancelled() {
                for item in &group {
                    queue.release(item.key).await;
                }
                return;
            }
            if let Err(e) = dl
                .run_batch(&export_root, &group, &queue, &reporter, &cancel)
                .await
            {
                warn!(dir = %dir.display(), error = %e, "delegated batch failed");
            }
        }
    }
}

fn flatten_join(
    joined: Result<Result<(), EngineError>, tokio::task::JoinError>,
) -> Result<(), EngineError> {
    match joined {
        Ok(r) => r,
        Err(e) => Err(EngineError::Store(format!("scan task join: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatKind, ExportFilter, MediaType, OutputFormat, OutputPolicy};
    use crate::usecases::testing::{chat, media_ref, message, MockGateway};

    struct Fixture {
        controller: Arc<JobController>,
        export_root: std::path::PathBuf,
        _data: tempfile::TempDir,
        _export: tempfile::TempDir,
    }

    fn build(gateway: MockGateway, filter: ExportFilter) -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();
        let store = Arc::new(ResumeStore::new(data.path()));
        let job = ExportJob::new(
            "job",
            filter,
            OutputPolicy {
                root: export.path().to_path_buf(),
                format: OutputFormat::Both,
            },
        );
        let export_root = job.export_dir();
        let controller = JobController::new(job, Arc::new(gateway), store, None, 1000);
        Fixture {
            controller,
            export_root,
            _data: data,
            _export: export,
        }
    }

    async fn wait_for_state(c: &Arc<JobController>, want: JobState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            if c.snapshot().await.state == want {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "never reached state {}",
                want
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    fn channel_filter() -> ExportFilter {
        ExportFilter {
            chat_ids: vec![-100],
            ..Default::default()
        }
    }

    /// Ten messages, media on the even ids.
    fn small_channel_gateway() -> MockGateway {
        let mut gw = MockGateway::new().with_chat(chat(-100, ChatKind::Channel, None));
        let mut msgs = Vec::new();
        for id in 1..=10 {
            let media = (id % 2 == 0).then(|| media_ref(id as i64, 64, MediaType::Document));
            msgs.push(message(-100, id, media));
        }
        gw = gw.with_history(-100, msgs);
        for id in [2i64, 4, 6, 8, 10] {
            gw = gw.with_file(id, payload(64));
        }
        gw
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_to_completion_with_all_media() {
        let fx = build(small_channel_gateway(), channel_filter());
        fx.controller.start().await.unwrap();
        wait_for_state(&fx.controller, JobState::Completed).await;

        let snap = fx.controller.snapshot().await;
        assert_eq!(snap.aggregates.processed_messages, 10);
        assert_eq!(snap.aggregates.total_messages, 10);
        assert_eq!(snap.aggregates.total_media, 5);
        assert_eq!(snap.aggregates.processed_media, 5);
        assert_eq!(snap.aggregates.failed_media, 0);

        for id in [2, 4, 6, 8, 10] {
            let path = fx
                .export_root
                .join("-100")
                .join("document")
                .join(format!("{}--100-file{}.bin", id, id));
            let meta = std::fs::metadata(&path)
                .unwrap_or_else(|_| panic!("missing {}", path.display()));
            assert_eq!(meta.len(), 64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let gw = small_channel_gateway().with_history_delay(Duration::from_millis(200));
        let fx = build(gw, channel_filter());
        fx.controller.start().await.unwrap();
        match fx.controller.start().await {
            Err(EngineError::Busy) | Err(EngineError::InvalidState(_)) => {}
            other => panic!("expected busy rejection, got {:?}", other.map(|_| ())),
        }
        fx.controller.cancel().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_chat_list_completes_with_zero_totals() {
        let gw = MockGateway::new();
        let filter = ExportFilter::default(); // empty mask, no ids
        let fx = build(gw, filter);
        fx.controller.start().await.unwrap();
        wait_for_state(&fx.controller, JobState::Completed).await;

        let snap = fx.controller.snapshot().await;
        assert_eq!(snap.aggregates.total_media, 0);
        assert_eq!(snap.aggregates.processed_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_suspends_scanner_and_resume_finishes() {
        // 2000 media-free messages with per-page latency keep the scanner
        // busy long enough to pause it deterministically.
        let mut gw = MockGateway::new()
            .with_chat(chat(-100, ChatKind::Channel, None))
            .with_history_delay(Duration::from_millis(100));
        let msgs: Vec<_> = (1..=2000).map(|id| message(-100, id, None)).collect();
        gw = gw.with_history(-100, msgs);
        let fx = build(gw, channel_filter());

        fx.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        fx.controller.pause().await.unwrap();
        wait_for_state(&fx.controller, JobState::Paused).await;

        let p1 = fx.controller.snapshot().await.aggregates.processed_messages;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let p2 = fx.controller.snapshot().await.aggregates.processed_messages;
        assert!(p1 < 2000, "scan should not have finished before the pause");
        assert_eq!(p1, p2, "no progress while paused");

        fx.controller.resume().await.unwrap();
        wait_for_state(&fx.controller, JobState::Completed).await;
        assert_eq!(
            fx.controller.snapshot().await.aggregates.processed_messages,
            2000
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_all_downloading() {
        let mut gw = MockGateway::new()
            .with_chat(chat(-100, ChatKind::Channel, None))
            .with_history_delay(Duration::from_millis(50));
        let mut msgs = Vec::new();
        for id in 1..=50 {
            msgs.push(message(-100, id, Some(media_ref(id as i64, 64, MediaType::Document))));
        }
        gw = gw.with_history(-100, msgs);
        for id in 1..=50i64 {
            gw = gw.with_file(id, payload(64));
        }
        let fx = build(gw, channel_filter());

        fx.controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        fx.controller.cancel().await.unwrap();
        wait_for_state(&fx.controller, JobState::Cancelled).await;

        // Within one chunk horizon, nothing is left downloading.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let counts = fx.controller.downloads(0, false).await;
            let downloading = counts
                .active
                .iter()
                .filter(|i| i.status == MediaStatus::Downloading)
                .count();
            if downloading == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "workers never stopped");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn verify_on_clean_job_reclassifies_nothing() {
        let fx = build(small_channel_gateway(), channel_filter());
        fx.controller.start().await.unwrap();
        wait_for_state(&fx.controller, JobState::Completed).await;

        let summary = fx.controller.verify().await.unwrap();
        assert!(summary.contains("0 queued"), "summary: {}", summary);
        assert_eq!(fx.controller.snapshot().await.state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn verify_requeues_truncated_file() {
        let fx = build(small_channel_gateway(), channel_filter());
        fx.controller.start().await.unwrap();
        wait_for_state(&fx.controller, JobState::Completed).await;

        // Corrupt one completed file on disk.
        let victim = fx
            .export_root
            .join("-100")
            .join("document")
            .join("2--100-file2.bin");
        std::fs::write(&victim, b"short").unwrap();

        let summary = fx.controller.verify().await.unwrap();
        assert!(summary.contains("1 queued"), "summary: {}", summary);

        // The re-entered drain restores the file.
        wait_for_state(&fx.controller, JobState::Completed).await;
        assert_eq!(std::fs::metadata(&victim).unwrap().len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_no_failures_is_noop() {
        let fx = build(small_channel_gateway(), channel_filter());
        fx.controller.start().await.unwrap();
        wait_for_state(&fx.controller, JobState::Completed).await;

        let moved = fx.controller.retry_failed().await.unwrap();
        assert_eq!(moved, 0);
        assert_eq!(fx.controller.snapshot().await.state, JobState::Completed);
    }

    #[tokio::test]
    async fn rehydrate_reconciles_partial_lengths() {
        let data = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();
        let store = Arc::new(ResumeStore::new(data.path()));
        let job = ExportJob::new(
            "job",
            channel_filter(),
            OutputPolicy {
                root: export.path().to_path_buf(),
                format: OutputFormat::Both,
            },
        );
        let job_id = job.id;
        let export_root = job.export_dir();

        // Persist a queue with one half-done item, then fake the partial.
        let mut item = crate::domain::MediaItem::from_media_ref(
            -100,
            5,
            0,
            &media_ref(5, 1000, MediaType::Document),
        );
        item.downloaded_bytes = 999; // stale persisted value
        store.save_queue(job_id, &[item.clone()]).await.unwrap();
        let partial = export_root.join(item.relative_partial_path());
        std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
        std::fs::write(&partial, payload(300)).unwrap();

        let controller =
            JobController::new(job, Arc::new(MockGateway::new()), store, None, 1000);
        controller.rehydrate().await.unwrap();

        let restored = controller.downloads(0, false).await;
        assert_eq!(restored.waiting.len(), 1);
        // The on-disk partial length is authoritative.
        assert_eq!(restored.waiting[0].downloaded_bytes, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn set_concurrency_clamps_and_persists() {
        let fx = build(small_channel_gateway(), channel_filter());
        fx.controller.set_concurrency(99, Some(true)).await.unwrap();
        let snap = fx.controller.snapshot().await;
        assert_eq!(snap.performance.max_concurrent_downloads, 99);
        assert_eq!(snap.performance.clamped_concurrency(), 20);
        assert!(snap.performance.parallel_chunk);
    }

    #[tokio::test]
    async fn delegated_toggle_requires_configuration() {
        let fx = build(small_channel_gateway(), channel_filter());
        assert!(matches!(
            fx.controller.set_delegated(true).await,
            Err(EngineError::Delegated(_))
        ));
        // Turning it off is always allowed.
        fx.controller.set_delegated(false).await.unwrap();
    }
}
