//! Test doubles shared by the use-case tests: a scriptable in-memory
//! gateway so scanner/worker/controller behaviour is exercised without a
//! live session.

use crate::domain::{Chat, ChatKind, GatewayError, MediaAccessRef, MediaRef, MediaType, Message};
use crate::ports::TgGateway;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// A failure injected into `download_chunk` when the access id and offset
/// match; `remaining` counts how many times it fires.
pub struct ScriptedFailure {
    pub access_id: i64,
    pub offset: Option<u64>,
    pub error: GatewayError,
    pub remaining: u32,
}

#[derive(Default)]
pub struct MockGateway {
    pub dialogs: Vec<Chat>,
    pub me_id: i64,
    /// Ascending per-chat history.
    pub messages: HashMap<i64, Vec<Message>>,
    /// File bytes by access id.
    pub files: HashMap<i64, Vec<u8>>,
    pub failures: Mutex<Vec<ScriptedFailure>>,
    pub refresh_calls: AtomicU64,
    pub chunk_calls: AtomicU64,
    /// Artificial latency per history page, to widen control windows in
    /// lifecycle tests.
    pub history_delay: Option<std::time::Duration>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chat(mut self, chat: Chat) -> Self {
        self.dialogs.push(chat);
        self
    }

    pub fn with_history(mut self, chat_id: i64, messages: Vec<Message>) -> Self {
        self.messages.insert(chat_id, messages);
        self
    }

    pub fn with_file(mut self, access_id: i64, bytes: Vec<u8>) -> Self {
        self.files.insert(access_id, bytes);
        self
    }

    pub fn with_history_delay(mut self, delay: std::time::Duration) -> Self {
        self.history_delay = Some(delay);
        self
    }

    pub async fn inject_failure(&self, failure: ScriptedFailure) {
        self.failures.lock().await.push(failure);
    }
}

pub fn chat(id: i64, kind: ChatKind, username: Option<&str>) -> Chat {
    Chat {
        id,
        title: format!("chat {}", id),
        username: username.map(String::from),
        kind,
        access_hash: Some(1),
        top_message_id: None,
    }
}

pub fn access(id: i64) -> MediaAccessRef {
    MediaAccessRef::Document {
        id,
        access_hash: 10,
        file_reference: vec![0],
    }
}

pub fn media_ref(access_id: i64, size: u64, media_type: MediaType) -> MediaRef {
    MediaRef {
        media_type,
        size,
        file_name: Some(format!("file{}.bin", access_id)),
        access: access(access_id),
    }
}

pub fn message(chat_id: i64, id: i32, media: Option<MediaRef>) -> Message {
    Message {
        id,
        chat_id,
        date: 1_700_000_000 + id as i64,
        text: format!("message {}", id),
        entities: Vec::new(),
        from_user_id: Some(if id % 2 == 0 { 42 } else { 7 }),
        reply_to_msg_id: None,
        service: false,
        media,
    }
}

fn access_id(access: &MediaAccessRef) -> i64 {
    match access {
        MediaAccessRef::Photo { id, .. } => *id,
        MediaAccessRef::Document { id, .. } => *id,
    }
}

#[async_trait]
impl TgGateway for MockGateway {
    async fn get_dialogs(&self) -> Result<Vec<Chat>, GatewayError> {
        Ok(self.dialogs.clone())
    }

    async fn resolve_chat(&self, chat_id: i64) -> Result<Chat, GatewayError> {
        self.dialogs
            .iter()
            .find(|c| c.id == chat_id)
            .cloned()
            .ok_or_else(|| GatewayError::Permanent(format!("chat {} not found", chat_id)))
    }

    async fn get_me_id(&self) -> Result<i64, GatewayError> {
        Ok(self.me_id)
    }

    async fn fetch_ascending(
        &self,
        chat_id: i64,
        min_id: i32,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        if let Some(delay) = self.history_delay {
            tokio::time::sleep(delay).await;
        }
        let mut out: Vec<Message> = self
            .messages
            .get(&chat_id)
            .map(|ms| ms.iter().filter(|m| m.id > min_id).cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|m| m.id);
        out.truncate(limit);
        Ok(out)
    }

    async fn download_chunk(
        &self,
        access: &MediaAccessRef,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>, GatewayError> {
        self.chunk_calls.fetch_add(1, Ordering::Relaxed);
        let id = access_id(access);

        {
            let mut failures = self.failures.lock().await;
            if let Some(f) = failures.iter_mut().find(|f| {
                f.access_id == id && f.remaining > 0 && f.offset.map_or(true, |o| o == offset)
            }) {
                f.remaining -= 1;
                return Err(f.error.clone());
            }
        }

        let bytes = self
            .files
            .get(&id)
            .ok_or_else(|| GatewayError::Permanent(format!("no file for access {}", id)))?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + limit).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn refresh_reference(
        &self,
        _chat_id: i64,
        message_id: i32,
    ) -> Result<MediaAccessRef, GatewayError> {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        // Refreshed reference points at the same access id the scripted
        // history used for this message.
        Ok(MediaAccessRef::Document {
            id: message_id as i64,
            access_hash: 10,
            file_reference: vec![1],
        })
    }
}
