//! Message scanner: walks one chat's history from a starting id upward,
//! appending message records and feeding media items to the queue.
//!
//! Scan order is strictly ascending, which is what makes resume correct:
//! restarting at `last persisted id + 1` loses no message and duplicates
//! none. Boundary enforcement is client-side; batches are filtered before
//! processing and the server is never trusted to honour the range.
//!
//! Scanning and downloading run concurrently; `enqueue` blocking at the
//! queue's soft cap is the only throttle coupling the two.

use crate::adapters::persistence::ResumeStore;
use crate::domain::{Chat, EngineError, ExportFilter, GatewayError, MediaItem, Message};
use crate::ports::TgGateway;
use crate::usecases::queue::DownloadQueue;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// History page size per request.
const PAGE_SIZE: usize = 100;
/// Persist the resume cursor every this many scanned messages (and always
/// at a chat boundary).
const CURSOR_PERSIST_EVERY: u64 = 50;
/// Transient fetch retries before the error propagates to the controller.
const MAX_FETCH_RETRIES: u32 = 5;

/// Live scan pointers, shared with the controller for the descriptor
/// aggregates. Reads never contend the queue lock.
#[derive(Default)]
pub struct ScanProgress {
    pub processed_messages: AtomicU64,
    pub current_message_id: AtomicI32,
    current_chat: Mutex<Option<String>>,
}

impl ScanProgress {
    pub fn current_chat(&self) -> Option<String> {
        self.current_chat.lock().expect("scan progress lock").clone()
    }

    fn set_current_chat(&self, label: Option<String>) {
        *self.current_chat.lock().expect("scan progress lock") = label;
    }
}

/// Everything a scan run needs besides the chat list.
pub struct ScanContext {
    pub job_id: Uuid,
    pub filter: ExportFilter,
    /// Set when `only_my_messages` is on.
    pub me_id: Option<i64>,
    pub cancel: CancellationToken,
    pub paused: watch::Receiver<bool>,
}

/// Outcome of scanning one chat to its end (or stop boundary).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub messages_scanned: u64,
    pub media_enqueued: u64,
    /// True when the scan stopped early (cancelled).
    pub interrupted: bool,
}

pub struct MessageScanner {
    gateway: Arc<dyn TgGateway>,
    store: Arc<ResumeStore>,
    queue: Arc<DownloadQueue>,
    progress: Arc<ScanProgress>,
}

impl MessageScanner {
    pub fn new(
        gateway: Arc<dyn TgGateway>,
        store: Arc<ResumeStore>,
        queue: Arc<DownloadQueue>,
        progress: Arc<ScanProgress>,
    ) -> Self {
        Self {
            gateway,
            store,
            queue,
            progress,
        }
    }

    /// Scan one chat from `max(filter.from, resume cursor)` ascending to
    /// the filter's upper bound or the chat's current head.
    pub async fn scan_chat(&self, ctx: &ScanContext, chat: &Chat) -> Result<ScanOutcome, EngineError> {
        let filter = &ctx.filter;
        let resume_cursor = self.store.load_cursor(ctx.job_id, chat.id).await?;
        // Cursor semantics: everything <= cursor is already durably logged.
        let mut cursor = resume_cursor.max(filter.effective_from() - 1);
        let mut outcome = ScanOutcome::default();
        let mut since_persist: u64 = 0;
        let mut paused = ctx.paused.clone();

        self.progress.set_current_chat(Some(chat.title.clone()));
        info!(
            job_id = %ctx.job_id,
            chat_id = chat.id,
            start_after = cursor,
            "scanning chat"
        );

        'pages: loop {
            if ctx.cancel.is_cancelled() {
                outcome.interrupted = true;
                break;
            }
            // Suspend here while the job is paused; resume picks the same
            // cursor back up.
            while *paused.borrow() {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        outcome.interrupted = true;
                        break 'pages;
                    }
                    res = paused.changed() => {
                        if res.is_err() {
                            outcome.interrupted = true;
                            break 'pages;
                        }
                    }
                }
            }

            let page = self.fetch_page(ctx, chat.id, cursor).await?;
            if page.is_empty() {
                break;
            }

            // Client-side boundary enforcement: drop anything at or below
            // the cursor no matter what the server returned.
            let batch: Vec<Message> = page.into_iter().filter(|m| m.id > cursor).collect();
            if batch.is_empty() {
                break;
            }

            let mut records: Vec<Message> = Vec::with_capacity(batch.len());
            let mut reached_upper = false;
            for msg in batch {
                if filter.message_to > 0 && msg.id > filter.message_to {
                    reached_upper = true;
                    break;
                }
                let msg_id = msg.id;
                self.progress
                    .current_message_id
                    .store(msg_id, Ordering::Relaxed);

                if let Some(media) = msg.media.as_ref() {
                    if !msg.service
                        && self.media_selected(ctx, &msg)
                        && filter.media_allowed(msg_id, media.media_type)
                    {
                        let item = MediaItem::from_media_ref(chat.id, msg_id, 0, media);
                        // Blocks at the soft cap; cancel still wins.
                        let enqueued = tokio::select! {
                            _ = ctx.cancel.cancelled() => {
                                outcome.interrupted = true;
                                // Cursor untouched: this message's record
                                // was not logged, so resume re-emits it.
                                break;
                            }
                            added = self.queue.enqueue(item) => added,
                        };
                        if enqueued {
                            outcome.media_enqueued += 1;
                        }
                    }
                }
                records.push(msg);
                cursor = cursor.max(msg_id);
            }

            if !records.is_empty() {
                self.store
                    .append_messages(ctx.job_id, chat.id, &records)
                    .await?;
                outcome.messages_scanned += records.len() as u64;
                since_persist += records.len() as u64;
                self.progress
                    .processed_messages
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
            }

            if since_persist >= CURSOR_PERSIST_EVERY {
                self.persist_checkpoint(ctx, chat.id, cursor).await?;
                since_persist = 0;
            }

            if reached_upper || outcome.interrupted {
                break;
            }
        }

        // Chat boundary: the checkpoint is always persisted.
        self.persist_checkpoint(ctx, chat.id, cursor).await?;
        self.progress.set_current_chat(None);
        debug!(
            job_id = %ctx.job_id,
            chat_id = chat.id,
            scanned = outcome.messages_scanned,
            enqueued = outcome.media_enqueued,
            cursor,
            "chat scan finished"
        );
        Ok(outcome)
    }

    /// Durable checkpoint: queue snapshot first, cursor second. The order
    /// matters for crash consistency: a cursor never points past a message
    /// whose media items are absent from the saved queue; the converse
    /// (extra queue items beyond the cursor) is harmless because rescan
    /// enqueues are de-duplicated.
    async fn persist_checkpoint(
        &self,
        ctx: &ScanContext,
        chat_id: i64,
        cursor: i32,
    ) -> Result<(), EngineError> {
        let snapshot = self.queue.items_snapshot().await;
        self.store.save_queue(ctx.job_id, &snapshot).await?;
        self.store.save_cursor(ctx.job_id, chat_id, cursor).await
    }

    /// One gated history request with transient/flood-wait recovery.
    async fn fetch_page(
        &self,
        ctx: &ScanContext,
        chat_id: i64,
        cursor: i32,
    ) -> Result<Vec<Message>, EngineError> {
        let mut attempts = 0;
        loop {
            match self
                .gateway
                .fetch_ascending(chat_id, cursor, PAGE_SIZE)
                .await
            {
                Ok(page) => return Ok(page),
                // The gate is already held; looping just re-admits after it
                // opens. No attempt is consumed.
                Err(GatewayError::FloodWait { seconds }) => {
                    debug!(chat_id, seconds, "history fetch hit flood wait");
                    continue;
                }
                Err(GatewayError::Transient(msg)) if attempts < MAX_FETCH_RETRIES => {
                    attempts += 1;
                    let backoff = Duration::from_secs(1 << attempts.min(6));
                    warn!(chat_id, attempts, error = %msg, "transient history error, backing off");
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            return Err(EngineError::Gateway(GatewayError::Transient(msg)))
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(EngineError::Gateway(e)),
            }
        }
    }

    /// Date-range and "only my messages" gates for the media enqueue.
    /// The message record itself is always appended to the log; these
    /// only decide whether its media is downloaded.
    fn media_selected(&self, ctx: &ScanContext, msg: &Message) -> bool {
        if let Some(me) = ctx.me_id {
            if msg.from_user_id != Some(me) {
                return false;
            }
        }
        if let Some(from) = ctx.filter.date_from {
            if msg.date < from.timestamp() {
                return false;
            }
        }
        if let Some(to) = ctx.filter.date_to {
            if msg.date > to.timestamp() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatKind, MediaType, MediaTypeMask};
    use crate::usecases::testing::{chat, media_ref, message, MockGateway};

    fn context(job_id: Uuid, filter: ExportFilter) -> ScanContext {
        // The sender drops immediately; an unpaused receiver keeps
        // reporting false, which is what these tests want.
        let (_tx, rx) = watch::channel(false);
        ScanContext {
            job_id,
            filter,
            me_id: None,
            cancel: CancellationToken::new(),
            paused: rx,
        }
    }

    fn scanner_fixture(
        gateway: MockGateway,
        dir: &tempfile::TempDir,
    ) -> (MessageScanner, Arc<DownloadQueue>, Arc<ScanProgress>, Arc<ResumeStore>) {
        let store = Arc::new(ResumeStore::new(dir.path()));
        let queue = Arc::new(DownloadQueue::new(1000));
        let progress = Arc::new(ScanProgress::default());
        let scanner = MessageScanner::new(
            Arc::new(gateway),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&progress),
        );
        (scanner, queue, progress, store)
    }

    fn history(chat_id: i64, count: i32) -> Vec<Message> {
        (1..=count)
            .map(|id| {
                let media = (id % 2 == 0).then(|| media_ref(id as i64, 64, MediaType::Photo));
                message(chat_id, id, media)
            })
            .collect()
    }

    #[tokio::test]
    async fn scans_full_chat_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let target = chat(-100, ChatKind::Channel, None);
        let gw = MockGateway::new()
            .with_chat(target.clone())
            .with_history(-100, history(-100, 250));
        let (scanner, queue, progress, store) = scanner_fixture(gw, &dir);

        let job_id = Uuid::new_v4();
        let ctx = context(job_id, ExportFilter::default());
        let outcome = scanner.scan_chat(&ctx, &target).await.unwrap();

        assert_eq!(outcome.messages_scanned, 250);
        // Half the messages carry media.
        assert_eq!(outcome.media_enqueued, 125);
        assert_eq!(queue.counts().total, 125);
        assert_eq!(progress.processed_messages.load(Ordering::Relaxed), 250);
        assert_eq!(store.load_cursor(job_id, -100).await.unwrap(), 250);

        // Message log holds every record, in ascending order.
        let raw = std::fs::read_to_string(
            store.job_dir(job_id).join("messages").join("-100.ndjson"),
        )
        .unwrap();
        let ids: Vec<i32> = raw
            .lines()
            .map(|l| serde_json::from_str::<Message>(l).unwrap().id)
            .collect();
        assert_eq!(ids.len(), 250);
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "strictly ascending");
    }

    #[tokio::test]
    async fn single_message_range_scans_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let target = chat(-100, ChatKind::Channel, None);
        let gw = MockGateway::new()
            .with_chat(target.clone())
            .with_history(-100, history(-100, 50));
        let (scanner, _queue, _progress, _store) = scanner_fixture(gw, &dir);

        let filter = ExportFilter {
            message_from: 7,
            message_to: 7,
            ..Default::default()
        };
        let ctx = context(Uuid::new_v4(), filter);
        let outcome = scanner.scan_chat(&ctx, &target).await.unwrap();
        assert_eq!(outcome.messages_scanned, 1);
    }

    #[tokio::test]
    async fn resume_continues_after_cursor_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let target = chat(-100, ChatKind::Channel, None);
        let gw = MockGateway::new()
            .with_chat(target.clone())
            .with_history(-100, history(-100, 120));
        let (scanner, _queue, _progress, store) = scanner_fixture(gw, &dir);

        let job_id = Uuid::new_v4();
        // Pretend an earlier run persisted up to id 100.
        store.save_cursor(job_id, -100, 100).await.unwrap();

        let ctx = context(job_id, ExportFilter::default());
        let outcome = scanner.scan_chat(&ctx, &target).await.unwrap();
        assert_eq!(outcome.messages_scanned, 20);

        let raw = std::fs::read_to_string(
            store.job_dir(job_id).join("messages").join("-100.ndjson"),
        )
        .unwrap();
        let first: Message = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first.id, 101);
    }

    #[tokio::test]
    async fn media_mask_and_skip_list_filter_items() {
        let dir = tempfile::tempdir().unwrap();
        let target = chat(-100, ChatKind::Channel, None);
        let msgs = vec![
            message(-100, 1, Some(media_ref(1, 10, MediaType::Photo))),
            message(-100, 2, Some(media_ref(2, 10, MediaType::Video))),
            message(-100, 3, Some(media_ref(3, 10, MediaType::Photo))),
        ];
        let gw = MockGateway::new()
            .with_chat(target.clone())
            .with_history(-100, msgs);
        let (scanner, queue, _progress, _store) = scanner_fixture(gw, &dir);

        let filter = ExportFilter {
            media_types: MediaTypeMask {
                videos: false,
                ..Default::default()
            },
            message_skip: vec![3],
            ..Default::default()
        };
        let ctx = context(Uuid::new_v4(), filter);
        let outcome = scanner.scan_chat(&ctx, &target).await.unwrap();

        // Every message is logged, but only message 1's photo survives the
        // media filters.
        assert_eq!(outcome.messages_scanned, 3);
        assert_eq!(outcome.media_enqueued, 1);
        let snapshot = queue.items_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key.message_id, 1);
    }

    #[tokio::test]
    async fn only_my_messages_gates_media_not_records() {
        let dir = tempfile::tempdir().unwrap();
        let target = chat(-100, ChatKind::Channel, None);
        // Every message carries media; even ids are from user 42 in the
        // fixture, odd ids from user 7.
        let msgs: Vec<Message> = (1..=10)
            .map(|id| message(-100, id, Some(media_ref(id as i64, 32, MediaType::Photo))))
            .collect();
        let gw = MockGateway::new()
            .with_chat(target.clone())
            .with_history(-100, msgs);
        let (scanner, queue, _progress, _store) = scanner_fixture(gw, &dir);

        let mut ctx = context(Uuid::new_v4(), ExportFilter::default());
        ctx.me_id = Some(42);
        let outcome = scanner.scan_chat(&ctx, &target).await.unwrap();

        // The full history is logged; only my messages' media downloads.
        assert_eq!(outcome.messages_scanned, 10);
        assert_eq!(outcome.media_enqueued, 5);
        let enqueued = queue.items_snapshot().await;
        assert!(enqueued.iter().all(|i| i.key.message_id % 2 == 0));
    }

    #[tokio::test]
    async fn date_range_gates_media_not_records() {
        let dir = tempfile::tempdir().unwrap();
        let target = chat(-100, ChatKind::Channel, None);
        // Fixture dates are 1_700_000_000 + id.
        let msgs: Vec<Message> = (1..=6)
            .map(|id| message(-100, id, Some(media_ref(id as i64, 32, MediaType::Photo))))
            .collect();
        let gw = MockGateway::new()
            .with_chat(target.clone())
            .with_history(-100, msgs);
        let (scanner, queue, _progress, _store) = scanner_fixture(gw, &dir);

        let filter = ExportFilter {
            date_from: chrono::DateTime::from_timestamp(1_700_000_004, 0),
            ..Default::default()
        };
        let ctx = context(Uuid::new_v4(), filter);
        let outcome = scanner.scan_chat(&ctx, &target).await.unwrap();

        assert_eq!(outcome.messages_scanned, 6);
        assert_eq!(outcome.media_enqueued, 3);
        let enqueued = queue.items_snapshot().await;
        assert!(enqueued.iter().all(|i| i.key.message_id >= 4));
    }

    #[tokio::test]
    async fn cancel_interrupts_within_a_page() {
        let dir = tempfile::tempdir().unwrap();
        let target = chat(-100, ChatKind::Channel, None);
        let gw = MockGateway::new()
            .with_chat(target.clone())
            .with_history(-100, history(-100, 500));
        let (scanner, _queue, _progress, _store) = scanner_fixture(gw, &dir);

        let ctx = context(Uuid::new_v4(), ExportFilter::default());
        ctx.cancel.cancel();
        let outcome = scanner.scan_chat(&ctx, &target).await.unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.messages_scanned, 0);
    }
}
