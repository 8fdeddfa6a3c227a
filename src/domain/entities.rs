//! Domain entities. Pure data structures for the core business.
//!
//! No Telegram/IO types here — these are mapped from adapters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Represents a Telegram chat (private dialog, group, or channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    /// Normalised dialog id: positive for users, negative for groups, and
    /// carrying the `-100` prefix for channels/supergroups.
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
    pub kind: ChatKind,
    /// Access hash required by the wire protocol for non-dialog lookups.
    pub access_hash: Option<i64>,
    /// Id of the newest message at enumeration time; used as the totals
    /// heuristic before scanning determines exact counts.
    pub top_message_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Bot,
    Group,
    Supergroup,
    Channel,
}

impl Chat {
    /// Public means addressable by username; the chat-type filter mask
    /// distinguishes public from private groups and channels.
    pub fn is_public(&self) -> bool {
        self.username.is_some()
    }
}

/// A single message from a chat. Immutable after emission; appended to the
/// chat's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i32,
    pub chat_id: i64,
    /// Unix timestamp (seconds).
    pub date: i64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    pub from_user_id: Option<i64>,
    pub reply_to_msg_id: Option<i32>,
    /// Service messages (joins, pins, title changes) carry no media and
    /// are logged for completeness only.
    #[serde(default)]
    pub service: bool,
    pub media: Option<MediaRef>,
}

/// A formatting/link span inside a message text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntity {
    pub kind: EntityKind,
    pub offset: i32,
    pub length: i32,
    /// Target for `TextLink`; `None` for the other kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Mention,
    Url,
    TextLink,
    Bold,
    Italic,
    Code,
    Pre,
    Other,
}

/// Reference to downloadable media as seen by the scanner. Carries enough
/// to build a `MediaItem` without a second history pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub media_type: MediaType,
    /// Announced size in bytes (0 when the wire protocol omits it).
    pub size: u64,
    /// Original filename when the wire protocol supplies one.
    pub file_name: Option<String>,
    /// Short-lived tuple required by `upload.getFile`.
    pub access: MediaAccessRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
    Voice,
    VideoNote,
    Audio,
    Sticker,
    Animation,
    Document,
}

impl MediaType {
    /// Subdirectory name under `<chatId>/` in the export tree.
    pub fn dir_name(&self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Video => "video",
            MediaType::Voice => "voice",
            MediaType::VideoNote => "video_note",
            MediaType::Audio => "audio",
            MediaType::Sticker => "sticker",
            MediaType::Animation => "animation",
            MediaType::Document => "document",
        }
    }

    /// Extension for the synthesised filename when the wire protocol does
    /// not supply an original name.
    pub fn fallback_ext(&self) -> &'static str {
        match self {
            MediaType::Photo => "jpg",
            MediaType::Video => "mp4",
            MediaType::Voice => "ogg",
            MediaType::VideoNote => "mp4",
            MediaType::Audio => "ogg",
            MediaType::Sticker => "webp",
            MediaType::Animation => "mp4",
            MediaType::Document => "pdf",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// The short-lived access tuple the wire protocol requires for each
/// `upload.getFile` call. Refreshed from the owning message when expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaAccessRef {
    Photo {
        id: i64,
        access_hash: i64,
        file_reference: Vec<u8>,
        /// Largest available photo size type (e.g. "w", "y").
        thumb_size: String,
    },
    Document {
        id: i64,
        access_hash: i64,
        file_reference: Vec<u8>,
    },
}

/// Identity of a media item within one job's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub chat_id: i64,
    pub message_id: i32,
    /// Media-slot index within the message; always 0 today, reserved for
    /// grouped albums.
    pub slot: u32,
}

impl ItemKey {
    pub fn new(chat_id: i64, message_id: i32, slot: u32) -> Self {
        Self {
            chat_id,
            message_id,
            slot,
        }
    }

    /// Parse the API path form produced by `Display` (`chatId_messageId_slot`).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('_');
        // A leading empty part appears when chat_id is negative and the
        // caller used '-' inside the first field; split on '_' keeps the
        // sign attached, so three fields is the only valid shape.
        let chat_id = parts.next()?.parse().ok()?;
        let message_id = parts.next()?.parse().ok()?;
        let slot = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(chat_id, message_id, slot))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.chat_id, self.message_id, self.slot)
    }
}

/// Download state of a media item. Transition rules live in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Skipped,
}

/// Structured per-item error surfaced over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: String,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// One transferable binary object referenced by exactly one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub key: ItemKey,
    pub media_type: MediaType,
    /// Announced byte size.
    pub size: u64,
    /// Directory the final file lands in, relative to the job's export root.
    pub target_dir: PathBuf,
    pub file_name: String,
    pub downloaded_bytes: u64,
    pub status: MediaStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ItemError>,
    /// Access tuple for `upload.getFile`; refreshed in place on expiry.
    pub access: Option<MediaAccessRef>,
}

impl MediaItem {
    /// Build an item from a scanned message's media reference. The filename
    /// convention is `{messageId}-{chatId}-{originalName}`, falling back to
    /// a synthesised `media.{ext}` name when no original name is supplied.
    pub fn from_media_ref(chat_id: i64, message_id: i32, slot: u32, media: &MediaRef) -> Self {
        let original = media
            .file_name
            .clone()
            .unwrap_or_else(|| format!("media.{}", media.media_type.fallback_ext()));
        let file_name = format!("{}-{}-{}", message_id, chat_id, sanitize_file_name(&original));
        let target_dir = PathBuf::from(chat_id.to_string()).join(media.media_type.dir_name());
        Self {
            key: ItemKey::new(chat_id, message_id, slot),
            media_type: media.media_type,
            size: media.size,
            target_dir,
            file_name,
            downloaded_bytes: 0,
            status: MediaStatus::Waiting,
            attempts: 0,
            last_error: None,
            access: Some(media.access.clone()),
        }
    }

    /// Final path relative to the job's export root.
    pub fn relative_path(&self) -> PathBuf {
        self.target_dir.join(&self.file_name)
    }

    /// Sibling holding the in-progress byte prefix; its length is
    /// authoritative for resume.
    pub fn relative_partial_path(&self) -> PathBuf {
        self.target_dir.join(format!("{}.partial", self.file_name))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            MediaStatus::Completed | MediaStatus::Failed | MediaStatus::Skipped
        )
    }
}

/// Strip path separators and control characters so a wire-supplied name
/// cannot escape the target directory.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(['.', ' ']);
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_ref(size: u64, name: Option<&str>) -> MediaRef {
        MediaRef {
            media_type: MediaType::Document,
            size,
            file_name: name.map(String::from),
            access: MediaAccessRef::Document {
                id: 7,
                access_hash: 11,
                file_reference: vec![1, 2, 3],
            },
        }
    }

    #[test]
    fn item_key_display_round_trips() {
        let key = ItemKey::new(-1001234567890, 42, 0);
        let parsed = ItemKey::parse(&key.to_string()).expect("parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn item_key_parse_rejects_garbage() {
        assert!(ItemKey::parse("").is_none());
        assert!(ItemKey::parse("1_2").is_none());
        assert!(ItemKey::parse("1_2_3_4").is_none());
        assert!(ItemKey::parse("a_b_c").is_none());
    }

    #[test]
    fn filename_uses_original_name() {
        let item = MediaItem::from_media_ref(-100500, 9, 0, &doc_ref(10, Some("report.pdf")));
        assert_eq!(item.file_name, "9--100500-report.pdf");
        assert_eq!(
            item.relative_path(),
            PathBuf::from("-100500/document/9--100500-report.pdf")
        );
    }

    #[test]
    fn filename_falls_back_to_synthesised_name() {
        let item = MediaItem::from_media_ref(123, 5, 0, &doc_ref(10, None));
        assert_eq!(item.file_name, "5-123-media.pdf");
    }

    #[test]
    fn partial_path_is_sibling_with_suffix() {
        let item = MediaItem::from_media_ref(123, 5, 0, &doc_ref(10, Some("a.zip")));
        assert_eq!(
            item.relative_partial_path(),
            PathBuf::from("123/document/5-123-a.zip.partial")
        );
    }

    #[test]
    fn sanitize_strips_separators_and_dots() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a\\b"), "a_b");
        assert_eq!(sanitize_file_name("..."), "unnamed");
        assert_eq!(sanitize_file_name("ok.txt"), "ok.txt");
    }
}
