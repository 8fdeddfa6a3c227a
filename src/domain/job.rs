//! Export job descriptor: filter, output policy, state and aggregates.
//!
//! The controller is the only mutator of `state`; everything here is data
//! plus the transition table it enforces.

use crate::domain::MediaType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Bounds for the worker pool size.
pub const MIN_CONCURRENT_DOWNLOADS: u32 = 1;
pub const MAX_CONCURRENT_DOWNLOADS: u32 = 20;

/// Lifecycle state of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Extracting,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Transition table. The controller rejects anything not listed here.
    /// Terminal states re-enter `Running` only through operator retry,
    /// verify reclassification, or rescan.
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Extracting)
                | (Extracting, Running)
                | (Extracting, Paused)
                | (Extracting, Completed)
                | (Extracting, Cancelled)
                | (Extracting, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Completed, Running)
                | (Failed, Running)
                | (Cancelled, Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Extracting => "extracting",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which chat categories an unscoped job scans.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatTypeMask {
    pub private_chats: bool,
    pub bot_chats: bool,
    pub private_groups: bool,
    pub private_channels: bool,
    pub public_groups: bool,
    pub public_channels: bool,
}

impl ChatTypeMask {
    pub fn any(&self) -> bool {
        self.private_chats
            || self.bot_chats
            || self.private_groups
            || self.private_channels
            || self.public_groups
            || self.public_channels
    }
}

/// Which media kinds the scanner enqueues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaTypeMask {
    pub photos: bool,
    pub videos: bool,
    pub voice: bool,
    pub video_notes: bool,
    pub audio: bool,
    pub stickers: bool,
    pub animations: bool,
    pub documents: bool,
}

impl Default for MediaTypeMask {
    fn default() -> Self {
        Self {
            photos: true,
            videos: true,
            voice: true,
            video_notes: true,
            audio: true,
            stickers: true,
            animations: true,
            documents: true,
        }
    }
}

impl MediaTypeMask {
    pub fn allows(&self, t: MediaType) -> bool {
        match t {
            MediaType::Photo => self.photos,
            MediaType::Video => self.videos,
            MediaType::Voice => self.voice,
            MediaType::VideoNote => self.video_notes,
            MediaType::Audio => self.audio,
            MediaType::Sticker => self.stickers,
            MediaType::Animation => self.animations,
            MediaType::Document => self.documents,
        }
    }
}

/// What a job scans: chats, message range, media kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFilter {
    pub chat_types: ChatTypeMask,
    /// Explicit chat ids; when non-empty the type mask is ignored for chat
    /// discovery. Raw channel ids are normalised by the resolver.
    pub chat_ids: Vec<i64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// First message id to scan (inclusive); 0 or 1 both mean "from the start".
    pub message_from: i32,
    /// Last message id to scan (inclusive); 0 means "current head".
    pub message_to: i32,
    pub media_types: MediaTypeMask,
    /// When non-empty, only these message ids get their media downloaded.
    pub message_include: Vec<i32>,
    /// Message ids whose media is skipped regardless of other filters.
    pub message_skip: Vec<i32>,
    pub only_my_messages: bool,
}

impl ExportFilter {
    /// Lowest message id the scanner may emit.
    pub fn effective_from(&self) -> i32 {
        self.message_from.max(1)
    }

    /// Whether `id` falls inside `[message_from, message_to]`
    /// (`message_to = 0` is unbounded above).
    pub fn id_in_range(&self, id: i32) -> bool {
        id >= self.effective_from() && (self.message_to == 0 || id <= self.message_to)
    }

    /// Media filter for one message: include/skip list plus type mask.
    pub fn media_allowed(&self, message_id: i32, media_type: MediaType) -> bool {
        if self.message_skip.contains(&message_id) {
            return false;
        }
        if !self.message_include.is_empty() && !self.message_include.contains(&message_id) {
            return false;
        }
        self.media_types.allows(media_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Html,
    Json,
    Both,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Both
    }
}

/// Where and how archived messages are materialised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPolicy {
    /// Export root; media lands under `<root>/<chatId>/<mediaType>/`.
    pub root: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
}

/// Download performance knobs, mutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformancePolicy {
    pub max_concurrent_downloads: u32,
    /// When set, large files are fetched as parallel sub-ranges.
    pub parallel_chunk: bool,
    pub proxy_url: Option<String>,
    /// Drain the queue through the external downloader instead of the
    /// in-process worker pool.
    pub delegated: bool,
}

impl Default for PerformancePolicy {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            parallel_chunk: false,
            proxy_url: None,
            delegated: false,
        }
    }
}

impl PerformancePolicy {
    pub fn clamped_concurrency(&self) -> u32 {
        self.max_concurrent_downloads
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS)
    }
}

/// Counters and gauges surfaced over the API. `processed <= total` for
/// every pair once the total is known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobAggregates {
    pub total_messages: u64,
    pub processed_messages: u64,
    pub total_media: u64,
    pub processed_media: u64,
    pub failed_media: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Instantaneous download speed, bytes per second.
    pub speed_bps: u64,
    pub last_error: Option<String>,
    pub last_verification: Option<String>,
    /// Chat currently being scanned, as a human label.
    pub current_chat: Option<String>,
    /// Highest message id handed to the scanner's filters so far.
    pub current_message_id: i32,
    pub verifying: bool,
}

/// The export job descriptor persisted to `job.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub name: String,
    pub filter: ExportFilter,
    pub output: OutputPolicy,
    pub performance: PerformancePolicy,
    pub state: JobState,
    #[serde(default)]
    pub aggregates: JobAggregates,
    pub created_at: DateTime<Utc>,
}

impl ExportJob {
    pub fn new(name: impl Into<String>, filter: ExportFilter, output: OutputPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            filter,
            output,
            performance: PerformancePolicy::default(),
            state: JobState::Pending,
            aggregates: JobAggregates::default(),
            created_at: Utc::now(),
        }
    }

    /// Export directory for this job: `<output root>/<job name>/`.
    pub fn export_dir(&self) -> PathBuf {
        self.output.root.join(&self.name)
    }
}
