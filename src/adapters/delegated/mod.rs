//! Delegated external downloader: batches waiting items and drives a
//! separate high-throughput downloader process, ingesting its progress
//! output line by line.
//!
//! The contract is strict: exit code 0 means every item in the batch
//! succeeded; any non-zero exit fails the whole batch. Progress lines
//! update counters but never complete an item on their own. A
//! process-global semaphore keeps invocations to one per authenticated
//! user so the shared session is never logged in twice.

use crate::domain::{EngineError, ItemError, ItemKey, MediaItem};
use crate::usecases::queue::DownloadQueue;
use crate::usecases::reporter::ProgressReporter;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One progress tick per line: `<itemKey> <downloaded> <total>`.
static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<item>-?\d+_\d+_\d+)\s+(?P<downloaded>\d+)\s+(?P<total>\d+)\s*$")
        .expect("valid progress regex")
});

/// Filename template equivalent to the in-process naming rule.
const FILENAME_TEMPLATE: &str = "{messageId}-{chatId}-{fileName}";

pub struct DelegatedDownloader {
    /// Container/executable name from the config.
    command: String,
    /// Session credentials shared with the external process (bind mount).
    session_path: PathBuf,
    /// One invocation per authenticated user at a time.
    invocations: Arc<Semaphore>,
}

impl DelegatedDownloader {
    pub fn new(command: String, session_path: PathBuf) -> Self {
        Self {
            command,
            session_path,
            invocations: Arc::new(Semaphore::new(1)),
        }
    }

    /// Group items by their target subdirectory; each group becomes one
    /// external invocation.
    pub fn group_by_dir(items: Vec<MediaItem>) -> Vec<(PathBuf, Vec<MediaItem>)> {
        let mut groups: HashMap<PathBuf, Vec<MediaItem>> = HashMap::new();
        for item in items {
            groups.entry(item.target_dir.clone()).or_default().push(item);
        }
        let mut out: Vec<_> = groups.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Run one batch to completion. On exit 0 every item transitions to
    /// completed; on any failure every item in the batch fails with a
    /// batch error and stays individually retryable.
    pub async fn run_batch(
        &self,
        export_root: &Path,
        items: &[MediaItem],
        queue: &DownloadQueue,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if items.is_empty() {
            return Ok(());
        }
        let _permit = self
            .invocations
            .acquire()
            .await
            .map_err(|_| EngineError::Delegated("invocation semaphore closed".into()))?;

        let target_dir = export_root.join(&items[0].target_dir);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(EngineError::store)?;

        let mut cmd = Command::new(&self.command);
        cmd.arg("--session")
            .arg(&self.session_path)
            .arg("--dir")
            .arg(&target_dir)
            .arg("--template")
            .arg(FILENAME_TEMPLATE);
        for item in items {
            cmd.arg("--message")
                .arg(format!("{}", item.key));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            command = %self.command,
            dir = %target_dir.display(),
            batch = items.len(),
            "invoking delegated downloader"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Delegated(format!("spawn {}: {}", self.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Delegated("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Delegated("stderr not captured".into()))?;

        // Stderr is logged, never parsed.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "delegated", "{}", line);
            }
        });

        // Per-item running totals so progress deltas feed the speed meter.
        let mut seen: HashMap<ItemKey, u64> = HashMap::new();
        let mut lines = BufReader::new(stdout).lines();
        let status = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    child.kill().await.ok();
                    // Cancelled, not failed: whatever the external process
                    // already wrote stays on disk for a future resume.
                    for item in items {
                        queue.finish_skip(item.key).await;
                    }
                    return Ok(());
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some((key, downloaded)) = parse_progress_line(&line) {
                            let prev = seen.insert(key, downloaded).unwrap_or(0);
                            reporter.tick(downloaded.saturating_sub(prev));
                            let attempts = queue.get(key).await.map(|i| i.attempts).unwrap_or(0);
                            queue.update_progress(key, downloaded, attempts).await;
                        } else {
                            debug!(target: "delegated", "{}", line);
                        }
                    }
                    // Stream closed: the process is finishing.
                    Ok(None) => break child.wait().await.map_err(EngineError::store)?,
                    Err(e) => {
                        warn!(error = %e, "delegated stdout read failed");
                        break child.wait().await.map_err(EngineError::store)?;
                    }
                }
            }
        };

        if status.success() {
            for item in items {
                queue.complete(item.key).await;
            }
            info!(batch = items.len(), "delegated batch completed");
            Ok(())
        } else {
            // Progress lines alone never complete an item: a crashed batch
            // is a failed batch, all of it.
            let code = status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into());
            self.fail_batch(items, queue, &format!("batch exited non-zero ({})", code))
                .await;
            Err(EngineError::Delegated(format!(
                "downloader exited with status {}",
                code
            )))
        }
    }

    async fn fail_batch(&self, items: &[MediaItem], queue: &DownloadQueue, reason: &str) {
        for item in items {
            queue
                .fail(item.key, ItemError::new("batch_failed", reason))
                .await;
        }
    }
}

/// Parse `<itemKey> <downloaded> <total>`; unknown lines are ignored.
fn parse_progress_line(line: &str) -> Option<(ItemKey, u64)> {
    let caps = PROGRESS_RE.captures(line.trim())?;
    let key = ItemKey::parse(caps.name("item")?.as_str())?;
    let downloaded: u64 = caps.name("downloaded")?.as_str().parse().ok()?;
    Some((key, downloaded))
}
