//! Export engine: owns the shared gateway, resume store and the registry
//! of job controllers. One engine per authenticated user; the process may
//! host several for testing.

use crate::adapters::delegated::DelegatedDownloader;
use crate::adapters::persistence::ResumeStore;
use crate::domain::{
    EngineError, ExportFilter, ExportJob, JobState, OutputFormat, OutputPolicy,
};
use crate::ports::TgGateway;
use crate::shared::config::AppConfig;
use crate::usecases::controller::JobController;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub struct ExportEngine {
    gateway: Arc<dyn TgGateway>,
    store: Arc<ResumeStore>,
    delegated: Option<Arc<DelegatedDownloader>>,
    output_root: std::path::PathBuf,
    queue_soft_cap: usize,
    jobs: RwLock<HashMap<Uuid, Arc<JobController>>>,
}

impl ExportEngine {
    pub fn new(gateway: Arc<dyn TgGateway>, store: Arc<ResumeStore>, config: &AppConfig) -> Self {
        let delegated = config.delegated.container.as_deref().and_then(|c| {
            if c.is_empty() {
                None
            } else {
                Some(Arc::new(DelegatedDownloader::new(
                    c.to_string(),
                    config.session_path(),
                )))
            }
        });
        Self {
            gateway,
            store,
            delegated,
            output_root: config.output_path(),
            queue_soft_cap: config.queue_soft_cap,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted job and re-enter the ones that were running
    /// when the process died. The resume store is the source of truth.
    pub async fn rehydrate(&self) -> Result<(), EngineError> {
        self.store.init().await?;
        let ids = self.store.list_job_ids().await?;
        for id in ids {
            let job = match self.store.load_job(id).await {
                Ok(j) => j,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "skipping unreadable job");
                    continue;
                }
            };
            let was_running =
                matches!(job.state, JobState::Running | JobState::Extracting);
            let controller = JobController::new(
                job,
                Arc::clone(&self.gateway),
                Arc::clone(&self.store),
                self.delegated.clone(),
                self.queue_soft_cap,
            );
            controller.rehydrate().await?;
            if was_running {
                info!(job_id = %id, "re-entering job that was running at shutdown");
                controller.spawn_run();
            }
            self.jobs.write().await.insert(id, controller);
        }
        let count = self.jobs.read().await.len();
        info!(jobs = count, "engine rehydrated");
        Ok(())
    }

    /// Create a job in pending state. A name matching an existing export
    /// directory is reused as-is; completed files de-dup by length.
    pub async fn create_job(
        &self,
        name: &str,
        filter: ExportFilter,
        format: OutputFormat,
    ) -> Result<ExportJob, EngineError> {
        let job = ExportJob::new(
            name,
            filter,
            OutputPolicy {
                root: self.output_root.clone(),
                format,
            },
        );
        self.store.save_job(&job).await?;
        let controller = JobController::new(
            job.clone(),
            Arc::clone(&self.gateway),
            Arc::clone(&self.store),
            self.delegated.clone(),
            self.queue_soft_cap,
        );
        self.jobs.write().await.insert(job.id, controller);
        info!(job_id = %job.id, name = %job.name, "job created");
        Ok(job)
    }

    pub async fn controller(&self, id: Uuid) -> Result<Arc<JobController>, EngineError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Descriptors of every known job, newest first.
    pub async fn list_jobs(&self) -> Vec<ExportJob> {
        let controllers: Vec<Arc<JobController>> =
            self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(controllers.len());
        for c in controllers {
            jobs.push(c.snapshot().await);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Cancel (if needed) and remove the job's metadata directory. The
    /// exported media tree is retained unless the operator asks to purge.
    pub async fn delete_job(&self, id: Uuid, purge: bool) -> Result<(), EngineError> {
        let controller = self.controller(id).await?;
        let export_dir = controller.snapshot().await.export_dir();
        controller.shutdown_for_delete().await?;
        self.store.delete_job(id).await?;
        self.jobs.write().await.remove(&id);
        if purge {
            match tokio::fs::remove_dir_all(&export_dir).await {
                Ok(()) => info!(job_id = %id, dir = %export_dir.display(), "purged export tree"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::store(e)),
            }
        }
        Ok(())
    }

    pub fn delegated_available(&self) -> bool {
        self.delegated.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usecases::testing::MockGateway;

    fn engine_fixture(data: &tempfile::TempDir, export: &tempfile::TempDir) -> ExportEngine {
        let mut config = AppConfig::default();
        config.data_dir = data.path().to_string_lossy().into_owned();
        config.output_root = export.path().to_string_lossy().into_owned();
        let store = Arc::new(ResumeStore::new(data.path()));
        ExportEngine::new(Arc::new(MockGateway::new()), store, &config)
    }

    #[tokio::test]
    async fn create_then_list_and_delete() {
        let data = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();
        let engine = engine_fixture(&data, &export);
        engine.rehydrate().await.unwrap();

        let job = engine
            .create_job("backup", ExportFilter::default(), OutputFormat::Json)
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Pending);

        let listed = engine.list_jobs().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, job.id);

        engine.delete_job(job.id, false).await.unwrap();
        assert!(engine.list_jobs().await.is_empty());
        assert!(matches!(
            engine.controller(job.id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_retains_media_unless_purged() {
        let data = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();
        let engine = engine_fixture(&data, &export);
        engine.rehydrate().await.unwrap();

        // First job: delete without purge keeps the export tree.
        let kept = engine
            .create_job("kept", ExportFilter::default(), OutputFormat::Json)
            .await
            .unwrap();
        let kept_dir = kept.export_dir();
        std::fs::create_dir_all(&kept_dir).unwrap();
        std::fs::write(kept_dir.join("1-1-a.bin"), b"data").unwrap();
        engine.delete_job(kept.id, false).await.unwrap();
        assert!(kept_dir.join("1-1-a.bin").exists());

        // Second job: purge removes it.
        let purged = engine
            .create_job("purged", ExportFilter::default(), OutputFormat::Json)
            .await
            .unwrap();
        let purged_dir = purged.export_dir();
        std::fs::create_dir_all(&purged_dir).unwrap();
        std::fs::write(purged_dir.join("1-1-a.bin"), b"data").unwrap();
        engine.delete_job(purged.id, true).await.unwrap();
        assert!(!purged_dir.exists());

        // Purge on a job with no export tree is a no-op.
        let empty = engine
            .create_job("empty", ExportFilter::default(), OutputFormat::Json)
            .await
            .unwrap();
        engine.delete_job(empty.id, true).await.unwrap();
    }

    #[tokio::test]
    async fn rehydrate_restores_persisted_jobs() {
        let data = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();

        let job_id = {
            let engine = engine_fixture(&data, &export);
            engine.rehydrate().await.unwrap();
            let job = engine
                .create_job("backup", ExportFilter::default(), OutputFormat::Both)
                .await
                .unwrap();
            job.id
        };

        // A second engine over the same store sees the job again.
        let engine = engine_fixture(&data, &export);
        engine.rehydrate().await.unwrap();
        let jobs = engine.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job_id);
        assert_eq!(jobs[0].state, JobState::Pending);
    }

    #[tokio::test]
    async fn delegated_disabled_without_container() {
        let data = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();
        let engine = engine_fixture(&data, &export);
        assert!(!engine.delegated_available());
    }
}
