//! Per-job download queue: one mutex-protected container of media items,
//! partitioned by status with O(1) projections.
//!
//! The scheduler (worker pool or delegated adapter) and the controller are
//! the only writers. Enqueue order is preserved for the waiting bucket;
//! workers may complete out of order. The waiting bucket carries a soft
//! cap: `enqueue` blocks above it, throttling the scanner (backpressure).

use crate::domain::{ItemError, ItemKey, MediaItem, MediaStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};

/// Control signal for an item a worker currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSignal {
    Pause,
    Cancel,
}

/// Status-bucket counters mirrored into atomics so the reporter can read
/// them without contending the queue mutex.
#[derive(Debug, Default)]
struct Counters {
    waiting: AtomicU64,
    downloading: AtomicU64,
    paused: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    total: AtomicU64,
    total_bytes: AtomicU64,
    downloaded_bytes: AtomicU64,
}

/// Read-only snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub downloading: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

impl QueueCounts {
    /// Completed here folds in skipped, mirroring the UI's combined list.
    pub fn processed(&self) -> u64 {
        self.completed + self.skipped
    }

    pub fn all_terminal(&self) -> bool {
        self.completed + self.failed + self.skipped == self.total
    }
}

/// The four listing projections served to the UI.
#[derive(Debug, Clone, Default)]
pub struct QueueProjections {
    /// Downloading plus paused-with-in-flight-slot items.
    pub active: Vec<MediaItem>,
    pub waiting: Vec<MediaItem>,
    pub failed: Vec<MediaItem>,
    /// Completed union skipped.
    pub completed: Vec<MediaItem>,
}

struct QueueInner {
    items: HashMap<ItemKey, MediaItem>,
    /// Enqueue order, for stable projections.
    order: Vec<ItemKey>,
    waiting: VecDeque<ItemKey>,
    /// Pending control signals for items currently held by a worker.
    signals: HashMap<ItemKey, ItemSignal>,
}

pub struct DownloadQueue {
    inner: Mutex<QueueInner>,
    counters: Counters,
    /// Signalled on enqueue/resume/retry so idle workers wake.
    work: Notify,
    /// Signalled when the waiting bucket drains below the soft cap.
    space: Notify,
    soft_cap: usize,
    /// Global pause: asserted claims return none.
    paused: AtomicBool,
}

impl DownloadQueue {
    pub fn new(soft_cap: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: HashMap::new(),
                order: Vec::new(),
                waiting: VecDeque::new(),
                signals: HashMap::new(),
            }),
            counters: Counters::default(),
            work: Notify::new(),
            space: Notify::new(),
            soft_cap: soft_cap.max(1),
            paused: AtomicBool::new(false),
        }
    }

    fn bucket(&self, status: MediaStatus) -> &AtomicU64 {
        match status {
            MediaStatus::Waiting => &self.counters.waiting,
            MediaStatus::Downloading => &self.counters.downloading,
            MediaStatus::Paused => &self.counters.paused,
            MediaStatus::Completed => &self.counters.completed,
            MediaStatus::Failed => &self.counters.failed,
            MediaStatus::Skipped => &self.counters.skipped,
        }
    }

    fn move_bucket(&self, from: MediaStatus, to: MediaStatus) {
        self.bucket(from).fetch_sub(1, Ordering::Relaxed);
        self.bucket(to).fetch_add(1, Ordering::Relaxed);
    }

    /// Append an item to the waiting bucket, blocking while the bucket is
    /// at the soft cap. Returns false when the key is already present
    /// (rescan dedup).
    pub async fn enqueue(&self, item: MediaItem) -> bool {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.items.contains_key(&item.key) {
                    return false;
                }
                if inner.waiting.len() < self.soft_cap {
                    let key = item.key;
                    self.counters.total.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .total_bytes
                        .fetch_add(item.size, Ordering::Relaxed);
                    self.bucket(MediaStatus::Waiting).fetch_add(1, Ordering::Relaxed);
                    inner.order.push(key);
                    inner.waiting.push_back(key);
                    inner.items.insert(key, item);
                    drop(inner);
                    self.work.notify_waiters();
                    return true;
                }
            }
            // Notify stores no permit; the timeout bounds the race where
            // the drain signal fires before this waiter registers.
            tokio::select! {
                _ = self.space.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
            }
        }
    }

    /// Restore an item loaded from a queue snapshot, bypassing the soft
    /// cap and preserving its persisted status.
    pub async fn restore(&self, item: MediaItem) {
        let mut inner = self.inner.lock().await;
        if inner.items.contains_key(&item.key) {
            return;
        }
        let key = item.key;
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_bytes
            .fetch_add(item.size, Ordering::Relaxed);
        self.counters
            .downloaded_bytes
            .fetch_add(item.downloaded_bytes, Ordering::Relaxed);
        self.bucket(item.status).fetch_add(1, Ordering::Relaxed);
        inner.order.push(key);
        if item.status == MediaStatus::Waiting {
            inner.waiting.push_back(key);
        }
        inner.items.insert(key, item);
        drop(inner);
        self.work.notify_waiters();
    }

    /// Atomically move the head of waiting to downloading. Returns none
    /// when the bucket is empty or the global pause is asserted.
    pub async fn claim_next(&self) -> Option<MediaItem> {
        if self.paused.load(Ordering::Acquire) {
            return None;
        }
        let mut inner = self.inner.lock().await;
        while let Some(key) = inner.waiting.pop_front() {
            // Keys can go stale when a control op moved the item out of
            // waiting while it was still queued for claim.
            let item = match inner.items.get_mut(&key) {
                Some(i) if i.status == MediaStatus::Waiting => i,
                _ => continue,
            };
            item.status = MediaStatus::Downloading;
            let claimed = item.clone();
            self.move_bucket(MediaStatus::Waiting, MediaStatus::Downloading);
            drop(inner);
            self.space.notify_waiters();
            return Some(claimed);
        }
        None
    }

    /// Park until `enqueue`/`resume`/`retry` signals new work.
    pub async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    /// Global pause gate for `claim_next`.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        if !paused {
            self.work.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Worker-side: collect a pending signal for the item it holds.
    pub async fn take_signal(&self, key: ItemKey) -> Option<ItemSignal> {
        let mut inner = self.inner.lock().await;
        inner.signals.remove(&key)
    }

    /// Downloading → completed.
    pub async fn complete(&self, key: ItemKey) -> bool {
        let mut inner = self.inner.lock().await;
        inner.signals.remove(&key);
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        if item.status != MediaStatus::Downloading {
            return false;
        }
        let delta = item.size.saturating_sub(item.downloaded_bytes);
        item.downloaded_bytes = item.size;
        item.status = MediaStatus::Completed;
        item.last_error = None;
        self.counters
            .downloaded_bytes
            .fetch_add(delta, Ordering::Relaxed);
        self.move_bucket(MediaStatus::Downloading, MediaStatus::Completed);
        true
    }

    /// Downloading → failed with a structured error.
    pub async fn fail(&self, key: ItemKey, error: ItemError) -> bool {
        let mut inner = self.inner.lock().await;
        inner.signals.remove(&key);
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        if item.status != MediaStatus::Downloading {
            return false;
        }
        item.status = MediaStatus::Failed;
        item.last_error = Some(error);
        self.move_bucket(MediaStatus::Downloading, MediaStatus::Failed);
        true
    }

    /// Waiting/downloading/paused → skipped (operator cancel of one item).
    pub async fn skip(&self, key: ItemKey) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        match item.status {
            MediaStatus::Waiting | MediaStatus::Paused => {
                let from = item.status;
                item.status = MediaStatus::Skipped;
                self.move_bucket(from, MediaStatus::Skipped);
                if from == MediaStatus::Waiting {
                    let key = item.key;
                    inner.waiting.retain(|k| *k != key);
                    drop(inner);
                    self.space.notify_waiters();
                }
                true
            }
            // In flight: the worker flushes the partial and finishes the
            // transition itself.
            MediaStatus::Downloading => {
                inner.signals.insert(key, ItemSignal::Cancel);
                true
            }
            _ => false,
        }
    }

    /// Worker-side completion of a cancel signal: downloading → skipped.
    pub async fn finish_skip(&self, key: ItemKey) -> bool {
        let mut inner = self.inner.lock().await;
        inner.signals.remove(&key);
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        if item.status != MediaStatus::Downloading {
            return false;
        }
        item.status = MediaStatus::Skipped;
        self.move_bucket(MediaStatus::Downloading, MediaStatus::Skipped);
        true
    }

    /// Operator pause of one item. Waiting items pause immediately; an
    /// in-flight item gets a signal and its worker releases the slot.
    pub async fn pause_item(&self, key: ItemKey) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        match item.status {
            MediaStatus::Waiting => {
                item.status = MediaStatus::Paused;
                self.move_bucket(MediaStatus::Waiting, MediaStatus::Paused);
                let key = item.key;
                inner.waiting.retain(|k| *k != key);
                drop(inner);
                self.space.notify_waiters();
                true
            }
            MediaStatus::Downloading => {
                inner.signals.insert(key, ItemSignal::Pause);
                true
            }
            _ => false,
        }
    }

    /// Worker-side completion of a pause signal: downloading → paused.
    /// Releases the worker slot; there is no state that keeps a slot
    /// while stopped.
    pub async fn finish_pause(&self, key: ItemKey) -> bool {
        let mut inner = self.inner.lock().await;
        inner.signals.remove(&key);
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        if item.status != MediaStatus::Downloading {
            return false;
        }
        item.status = MediaStatus::Paused;
        self.move_bucket(MediaStatus::Downloading, MediaStatus::Paused);
        true
    }

    /// Paused → waiting.
    pub async fn resume_item(&self, key: ItemKey) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        if item.status != MediaStatus::Paused {
            return false;
        }
        item.status = MediaStatus::Waiting;
        self.move_bucket(MediaStatus::Paused, MediaStatus::Waiting);
        let key = item.key;
        inner.waiting.push_back(key);
        drop(inner);
        self.work.notify_waiters();
        true
    }

    /// Downloading → waiting (slot released without an outcome, e.g. the
    /// pool is shutting down).
    pub async fn release(&self, key: ItemKey) -> bool {
        let mut inner = self.inner.lock().await;
        inner.signals.remove(&key);
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        if item.status != MediaStatus::Downloading {
            return false;
        }
        item.status = MediaStatus::Waiting;
        self.move_bucket(MediaStatus::Downloading, MediaStatus::Waiting);
        let key = item.key;
        inner.waiting.push_front(key);
        drop(inner);
        self.work.notify_waiters();
        true
    }

    /// Failed/skipped → waiting; completed → waiting only with `force`
    /// (verification reclassification). Attempt counters reset.
    pub async fn retry(&self, key: ItemKey, force: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(item) = inner.items.get_mut(&key) else {
            return false;
        };
        let from = item.status;
        let allowed = matches!(from, MediaStatus::Failed | MediaStatus::Skipped)
            || (force && from == MediaStatus::Completed);
        if !allowed {
            return false;
        }
        item.status = MediaStatus::Waiting;
        item.attempts = 0;
        item.last_error = None;
        if force && from == MediaStatus::Completed {
            self.counters
                .downloaded_bytes
                .fetch_sub(item.downloaded_bytes, Ordering::Relaxed);
            item.downloaded_bytes = 0;
        }
        self.move_bucket(from, MediaStatus::Waiting);
        let key = item.key;
        inner.waiting.push_back(key);
        drop(inner);
        self.work.notify_waiters();
        true
    }

    /// Move every failed item back to waiting. Returns how many moved.
    pub async fn retry_all_failed(&self) -> usize {
        let keys: Vec<ItemKey> = {
            let inner = self.inner.lock().await;
            inner
                .items
                .values()
                .filter(|i| i.status == MediaStatus::Failed)
                .map(|i| i.key)
                .collect()
        };
        let mut moved = 0;
        for key in keys {
            if self.retry(key, false).await {
                moved += 1;
            }
        }
        moved
    }

    /// Worker-side progress update for the item it holds.
    pub async fn update_progress(&self, key: ItemKey, downloaded_bytes: u64, attempts: u32) {
        let mut inner = self.inner.lock().await;
        if let Some(item) = inner.items.get_mut(&key) {
            let delta = downloaded_bytes.saturating_sub(item.downloaded_bytes);
            self.counters
                .downloaded_bytes
                .fetch_add(delta, Ordering::Relaxed);
            item.downloaded_bytes = downloaded_bytes;
            item.attempts = attempts;
        }
    }

    /// Store a refreshed access reference.
    pub async fn update_access(&self, key: ItemKey, access: crate::domain::MediaAccessRef) {
        let mut inner = self.inner.lock().await;
        if let Some(item) = inner.items.get_mut(&key) {
            item.access = Some(access);
        }
    }

    pub async fn get(&self, key: ItemKey) -> Option<MediaItem> {
        let inner = self.inner.lock().await;
        inner.items.get(&key).cloned()
    }

    /// Full contents in enqueue order, for persistence snapshots.
    pub async fn items_snapshot(&self) -> Vec<MediaItem> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|k| inner.items.get(k).cloned())
            .collect()
    }

    /// The four UI projections, each truncated to `limit` (0 = no limit),
    /// optionally newest-enqueued first.
    pub async fn projections(&self, limit: usize, reversed: bool) -> QueueProjections {
        let inner = self.inner.lock().await;
        let mut out = QueueProjections::default();
        let ordered: Box<dyn Iterator<Item = &ItemKey>> = if reversed {
            Box::new(inner.order.iter().rev())
        } else {
            Box::new(inner.order.iter())
        };
        for key in ordered {
            let Some(item) = inner.items.get(key) else {
                continue;
            };
            let list = match item.status {
                MediaStatus::Downloading | MediaStatus::Paused => &mut out.active,
                MediaStatus::Waiting => &mut out.waiting,
                MediaStatus::Failed => &mut out.failed,
                MediaStatus::Completed | MediaStatus::Skipped => &mut out.completed,
            };
            if limit == 0 || list.len() < limit {
                list.push(item.clone());
            }
        }
        out
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            waiting: self.counters.waiting.load(Ordering::Relaxed),
            downloading: self.counters.downloading.load(Ordering::Relaxed),
            paused: self.counters.paused.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            total: self.counters.total.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            downloaded_bytes: self.counters.downloaded_bytes.load(Ordering::Relaxed),
        }
    }
}
