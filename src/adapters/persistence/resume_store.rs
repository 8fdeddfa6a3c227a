//! Crash-safe persistence for jobs: descriptor, queue snapshot, per-chat
//! cursors and the append-only message log.
//!
//! Layout, one directory per job:
//!
//! ```text
//! <data root>/jobs/<jobId>/
//!   job.json                descriptor + aggregates
//!   queue.json              media items
//!   cursor/<chatId>         last persisted message id
//!   messages/<chatId>.ndjson
//! ```
//!
//! All structured writes use write-to-temp-then-rename; the message log is
//! append-only. A crash after any rename leaves a consistent snapshot.

use crate::domain::{EngineError, ExportJob, MediaItem, MediaStatus, Message};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Process-wide store, internally serialised per job.
pub struct ResumeStore {
    base: PathBuf,
    /// Per-job write lock; reads go through the same snapshot files and
    /// need no lock.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ResumeStore {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn init(&self) -> Result<(), EngineError> {
        fs::create_dir_all(self.jobs_dir())
            .await
            .map_err(EngineError::store)
    }

    fn jobs_dir(&self) -> PathBuf {
        self.base.join("jobs")
    }

    pub fn job_dir(&self, id: Uuid) -> PathBuf {
        self.jobs_dir().join(id.to_string())
    }

    async fn job_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id).or_default())
    }

    /// Persist the job descriptor + aggregates atomically.
    pub async fn save_job(&self, job: &ExportJob) -> Result<(), EngineError> {
        let lock = self.job_lock(job.id).await;
        let _guard = lock.lock().await;
        let dir = self.job_dir(job.id);
        fs::create_dir_all(&dir).await.map_err(EngineError::store)?;
        let json = serde_json::to_string_pretty(job).map_err(EngineError::store)?;
        write_atomic(&dir.join("job.json"), json.as_bytes()).await
    }

    pub async fn load_job(&self, id: Uuid) -> Result<ExportJob, EngineError> {
        let path = self.job_dir(id).join("job.json");
        let raw = fs::read_to_string(&path).await.map_err(EngineError::store)?;
        serde_json::from_str(&raw).map_err(EngineError::store)
    }

    /// Snapshot the full queue contents atomically.
    pub async fn save_queue(&self, id: Uuid, items: &[MediaItem]) -> Result<(), EngineError> {
        let lock = self.job_lock(id).await;
        let _guard = lock.lock().await;
        let dir = self.job_dir(id);
        fs::create_dir_all(&dir).await.map_err(EngineError::store)?;
        let json = serde_json::to_string(items).map_err(EngineError::store)?;
        write_atomic(&dir.join("queue.json"), json.as_bytes()).await
    }

    /// Load the queue snapshot. Items persisted mid-download come back as
    /// waiting; their `.partial` length is reconciled by the controller.
    pub async fn load_queue(&self, id: Uuid) -> Result<Vec<MediaItem>, EngineError> {
        let path = self.job_dir(id).join("queue.json");
        let raw = match fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::store(e)),
        };
        let mut items: Vec<MediaItem> = serde_json::from_str(&raw).map_err(EngineError::store)?;
        for item in &mut items {
            if item.status == MediaStatus::Downloading {
                item.status = MediaStatus::Waiting;
            }
        }
        Ok(items)
    }

    /// Persist the per-chat scan cursor (last durably logged message id).
    pub async fn save_cursor(
        &self,
        id: Uuid,
        chat_id: i64,
        message_id: i32,
    ) -> Result<(), EngineError> {
        let dir = self.job_dir(id).join("cursor");
        fs::create_dir_all(&dir).await.map_err(EngineError::store)?;
        write_atomic(&dir.join(chat_id.to_string()), message_id.to_string().as_bytes()).await
    }

    /// Read the per-chat scan cursor; 0 when the chat was never scanned.
    pub async fn load_cursor(&self, id: Uuid, chat_id: i64) -> Result<i32, EngineError> {
        let path = self.job_dir(id).join("cursor").join(chat_id.to_string());
        match fs::read_to_string(&path).await {
            Ok(s) => Ok(s.trim().parse().unwrap_or(0)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(EngineError::store(e)),
        }
    }

    /// Drop all cursors; a full rescan starts from the filter's lower bound.
    pub async fn clear_cursors(&self, id: Uuid) -> Result<(), EngineError> {
        let dir = self.job_dir(id).join("cursor");
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::store(e)),
        }
    }

    /// Append message records to the chat's ndjson log (one JSON object
    /// per line). Does not read the existing file.
    pub async fn append_messages(
        &self,
        id: Uuid,
        chat_id: i64,
        messages: &[Message],
    ) -> Result<(), EngineError> {
        if messages.is_empty() {
            return Ok(());
        }
        let dir = self.job_dir(id).join("messages");
        fs::create_dir_all(&dir).await.map_err(EngineError::store)?;
        let path = dir.join(format!("{}.ndjson", chat_id));
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(EngineError::store)?;
        let mut buf = Vec::with_capacity(messages.len() * 128);
        for m in messages {
            serde_json::to_writer(&mut buf, m).map_err(EngineError::store)?;
            buf.push(b'\n');
        }
        f.write_all(&buf).await.map_err(EngineError::store)?;
        f.flush().await.map_err(EngineError::store)?;
        Ok(())
    }

    /// Enumerate persisted job ids (for startup rehydration).
    pub async fn list_job_ids(&self) -> Result<Vec<Uuid>, EngineError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(self.jobs_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(EngineError::store(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(EngineError::store)? {
            let name = entry.file_name();
            match name.to_string_lossy().parse::<Uuid>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    warn!(name = %name.to_string_lossy(), "ignoring stray entry in jobs dir");
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove the job metadata directory. Exported media is retained;
    /// purging the export tree is the operator's explicit call.
    pub async fn delete_job(&self, id: Uuid) -> Result<(), EngineError> {
        let lock = self.job_lock(id).await;
        let _guard = lock.lock().await;
        let dir = self.job_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(job_id = %id, "deleted job directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::store(e)),
        }
    }
}

/// Atomic save using the write-replace pattern: write to a temp sibling,
/// sync, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp).await.map_err(EngineError::store)?;
    f.write_all(bytes).await.map_err(EngineError::store)?;
    f.sync_all().await.map_err(EngineError::store)?;
    drop(f);
    fs::rename(&tmp, path).await.map_err(EngineError::store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ExportFilter, MediaAccessRef, MediaItem, MediaRef, MediaType, OutputFormat, OutputPolicy,
    };

    fn test_job() -> ExportJob {
        ExportJob::new(
            "backup",
            ExportFilter::default(),
            OutputPolicy {
                root: PathBuf::from("/tmp/exports"),
                format: OutputFormat::Both,
            },
        )
    }

    fn test_item(message_id: i32, status: MediaStatus) -> MediaItem {
        let mut item = MediaItem::from_media_ref(
            -100,
            message_id,
            0,
            &MediaRef {
                media_type: MediaType::Photo,
                size: 1024,
                file_name: None,
                access: MediaAccessRef::Photo {
                    id: 1,
                    access_hash: 2,
                    file_reference: vec![9],
                    thumb_size: "y".into(),
                },
            },
        );
        item.status = status;
        item
    }

    #[tokio::test]
    async fn job_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        store.init().await.unwrap();

        let job = test_job();
        store.save_job(&job).await.unwrap();
        let loaded = store.load_job(job.id).await.unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.name, "backup");
        assert_eq!(loaded.state, job.state);

        // No temp residue after an atomic write.
        assert!(!store.job_dir(job.id).join("job.tmp").exists());
    }

    #[tokio::test]
    async fn queue_rehydrates_downloading_as_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        store.init().await.unwrap();
        let id = Uuid::new_v4();

        let items = vec![
            test_item(1, MediaStatus::Downloading),
            test_item(2, MediaStatus::Completed),
            test_item(3, MediaStatus::Failed),
        ];
        store.save_queue(id, &items).await.unwrap();
        let loaded = store.load_queue(id).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].status, MediaStatus::Waiting);
        assert_eq!(loaded[1].status, MediaStatus::Completed);
        assert_eq!(loaded[2].status, MediaStatus::Failed);
    }

    #[tokio::test]
    async fn missing_queue_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        assert!(store.load_queue(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        let id = Uuid::new_v4();

        assert_eq!(store.load_cursor(id, -100).await.unwrap(), 0);
        store.save_cursor(id, -100, 424242).await.unwrap();
        assert_eq!(store.load_cursor(id, -100).await.unwrap(), 424242);

        store.clear_cursors(id).await.unwrap();
        assert_eq!(store.load_cursor(id, -100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn message_log_appends_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        let id = Uuid::new_v4();

        let msgs: Vec<Message> = (1..=3)
            .map(|i| Message {
                id: i,
                chat_id: -100,
                date: 1700000000 + i as i64,
                text: format!("m{}", i),
                entities: Vec::new(),
                from_user_id: None,
                reply_to_msg_id: None,
                service: false,
                media: None,
            })
            .collect();
        store.append_messages(id, -100, &msgs[..2]).await.unwrap();
        store.append_messages(id, -100, &msgs[2..]).await.unwrap();

        let raw = std::fs::read_to_string(
            store.job_dir(id).join("messages").join("-100.ndjson"),
        )
        .unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: Message = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.id, 1);
    }

    #[tokio::test]
    async fn list_and_delete_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path());
        store.init().await.unwrap();

        let job = test_job();
        store.save_job(&job).await.unwrap();
        assert_eq!(store.list_job_ids().await.unwrap(), vec![job.id]);

        store.delete_job(job.id).await.unwrap();
        assert!(store.list_job_ids().await.unwrap().is_empty());
        // Deleting again is a no-op.
        store.delete_job(job.id).await.unwrap();
    }
}
