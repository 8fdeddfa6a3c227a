//! Implements TgGateway using the grammers Client.
//!
//! All wire calls admit through the shared RateGate, so a FloodWait from
//! any worker holds every outbound request of the session. Uses raw invoke
//! for GetHistory/GetFile so paging and chunk offsets stay explicit; the
//! caches avoid re-enumerating dialogs on every call (FLOOD_WAIT
//! avoidance).

use crate::adapters::telegram::mapper;
use crate::adapters::telegram::rate_gate::RateGate;
use crate::domain::{Chat, GatewayError, MediaAccessRef, Message};
use crate::ports::TgGateway;
use async_trait::async_trait;
use grammers_client::tl;
use grammers_client::Client;
use grammers_client::InvocationError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-request deadline; exceeding it is a transient failure (§ worker
/// backoff applies).
const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// Telegram gateway adapter. Wraps a grammers Client handle (cheap to
/// clone; the sender pool serialises the transport underneath).
pub struct GrammersTgGateway {
    client: Client,
    gate: Arc<RateGate>,
    /// Cache InputPeer by chat_id so history and download calls don't
    /// re-run getDialogs.
    peer_cache: Mutex<HashMap<i64, tl::enums::InputPeer>>,
    /// Cache resolved chat descriptors alongside the peers.
    chat_cache: Mutex<HashMap<i64, Chat>>,
}

impl GrammersTgGateway {
    pub fn new(client: Client, gate: Arc<RateGate>) -> Self {
        Self {
            client,
            gate,
            peer_cache: Mutex::new(HashMap::new()),
            chat_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Gated invoke with the shared deadline. A FloodWait response holds
    /// the gate before the error propagates, so concurrent workers stall
    /// with us instead of hammering the server.
    async fn invoke<R: tl::RemoteCall>(&self, request: &R) -> Result<R::Return, GatewayError> {
        self.gate.admit().await;
        match tokio::time::timeout(REQUEST_DEADLINE, self.client.invoke(request)).await {
            Err(_) => Err(GatewayError::Transient("request deadline exceeded".into())),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let mapped = map_invocation_error(e);
                if let GatewayError::FloodWait { seconds } = mapped {
                    warn!(seconds, "flood wait, holding rate gate");
                    self.gate.hold_for(Duration::from_secs(seconds)).await;
                }
                Err(mapped)
            }
        }
    }

    /// Enumerate dialogs once, filling both caches.
    async fn enumerate_dialogs(&self) -> Result<Vec<Chat>, GatewayError> {
        self.gate.admit().await;
        let mut dialogs = self.client.iter_dialogs();
        let mut chats = Vec::new();
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?
        {
            let peer = dialog.peer();
            let id = peer.id().bot_api_dialog_id();
            let title = peer
                .name()
                .map(String::from)
                .unwrap_or_else(|| peer.id().to_string());
            let kind = mapper::chat_kind_from_peer(peer);
            let top_message_id = dialog.last_message.as_ref().map(|m| m.id());
            let chat = mapper::dialog_to_chat(
                id,
                &title,
                peer.username(),
                kind,
                top_message_id,
            );

            if let Some(peer_ref) = peer.to_ref().await {
                let input_peer: tl::enums::InputPeer = peer_ref.into();
                self.peer_cache.lock().await.insert(id, input_peer);
            }
            self.chat_cache.lock().await.insert(id, chat.clone());
            chats.push(chat);
        }
        debug!(count = chats.len(), "enumerated dialogs");
        Ok(chats)
    }

    /// Resolve chat_id to InputPeer, enumerating dialogs on a cache miss.
    async fn input_peer(&self, chat_id: i64) -> Result<tl::enums::InputPeer, GatewayError> {
        {
            let cache = self.peer_cache.lock().await;
            if let Some(peer) = cache.get(&chat_id) {
                return Ok(peer.clone());
            }
        }
        self.enumerate_dialogs().await?;
        let cache = self.peer_cache.lock().await;
        cache.get(&chat_id).cloned().ok_or_else(|| {
            GatewayError::Permanent(format!("peer {} not found in dialogs", chat_id))
        })
    }

    /// Fetch one raw message by id, routed through the channel-specific
    /// call when the peer is a channel.
    async fn fetch_raw_message(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<tl::enums::Message, GatewayError> {
        let peer = self.input_peer(chat_id).await?;
        let id = vec![tl::enums::InputMessage::Id(tl::types::InputMessageId {
            id: message_id,
        })];

        let raw = match &peer {
            tl::enums::InputPeer::Channel(c) => {
                let channel: tl::enums::InputChannel = tl::types::InputChannel {
                    channel_id: c.channel_id,
                    access_hash: c.access_hash,
                }
                .into();
                self.invoke(&tl::functions::channels::GetMessages { channel, id })
                    .await?
            }
            _ => {
                self.invoke(&tl::functions::messages::GetMessages { id })
                    .await?
            }
        };

        let messages = match raw {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => Vec::new(),
        };
        messages
            .into_iter()
            .find(|m| match m {
                tl::enums::Message::Message(x) => x.id == message_id,
                tl::enums::Message::Service(x) => x.id == message_id,
                tl::enums::Message::Empty(_) => false,
            })
            .ok_or_else(|| {
                GatewayError::Permanent(format!(
                    "message {} not found in chat {}",
                    message_id, chat_id
                ))
            })
    }
}

#[async_trait]
impl TgGateway for GrammersTgGateway {
    async fn get_dialogs(&self) -> Result<Vec<Chat>, GatewayError> {
        self.enumerate_dialogs().await
    }

    async fn resolve_chat(&self, chat_id: i64) -> Result<Chat, GatewayError> {
        {
            let cache = self.chat_cache.lock().await;
            if let Some(chat) = cache.get(&chat_id) {
                return Ok(chat.clone());
            }
        }
        self.enumerate_dialogs().await?;
        let cache = self.chat_cache.lock().await;
        cache.get(&chat_id).cloned().ok_or_else(|| {
            GatewayError::Permanent(format!("chat {} not found in dialogs", chat_id))
        })
    }

    async fn get_me_id(&self) -> Result<i64, GatewayError> {
        let users = self
            .invoke(&tl::functions::users::GetUsers {
                id: vec![tl::enums::InputUser::UserSelf],
            })
            .await?;
        users
            .into_iter()
            .find_map(|u| match u {
                tl::enums::User::User(u) => Some(u.id),
                _ => None,
            })
            .ok_or_else(|| GatewayError::Fatal("self user not returned".into()))
    }

    async fn fetch_ascending(
        &self,
        chat_id: i64,
        min_id: i32,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        let peer = self.input_peer(chat_id).await?;

        // Paging forward: offset_id anchors just above min_id and the
        // negative add_offset shifts the window toward newer messages.
        // We over-fetch by one and enforce the boundary client-side; the
        // server is not trusted to honour min_id exactly at the edges.
        let fetch = (limit + 1) as i32;
        let offset_id = min_id.max(1);
        let raw = self
            .invoke(&tl::functions::messages::GetHistory {
                peer,
                offset_id,
                offset_date: 0,
                add_offset: -fetch,
                limit: fetch,
                max_id: 0,
                min_id,
                hash: 0,
            })
            .await?;

        let raw_messages = match raw {
            tl::enums::messages::Messages::Messages(m) => m.messages,
            tl::enums::messages::Messages::Slice(m) => m.messages,
            tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
            tl::enums::messages::Messages::NotModified(_) => return Ok(vec![]),
        };

        let mut out: Vec<Message> = raw_messages
            .iter()
            .filter_map(|m| mapper::message_to_domain(m, chat_id))
            .filter(|m| m.id > min_id)
            .collect();
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
        let location = mapper::input_file_location(access);
        let file = self
            .invoke(&tl::functions::upload::GetFile {
                precise: true,
                cdn_supported: false,
                location,
                offset: offset as i64,
                limit: limit as i32,
            })
            .await?;

        match file {
            tl::enums::upload::File::File(f) => Ok(f.bytes),
            tl::enums::upload::File::CdnRedirect(_) => Err(GatewayError::Permanent(
                "cdn redirect not supported".into(),
            )),
        }
    }

    async fn refresh_reference(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<MediaAccessRef, GatewayError> {
        let raw = self.fetch_raw_message(chat_id, message_id).await?;
        let media = match &raw {
            tl::enums::Message::Message(m) => m.media.as_ref(),
            _ => None,
        };
        media
            .and_then(mapper::extract_media_ref)
            .map(|r| r.access)
            .ok_or_else(|| {
                GatewayError::Permanent(format!(
                    "message {} in chat {} no longer carries media",
                    message_id, chat_id
                ))
            })
    }
}

/// Map grammers transport/RPC errors onto the domain error kinds.
fn map_invocation_error(e: InvocationError) -> GatewayError {
    match e {
        InvocationError::Rpc(rpc) => {
            if rpc.code == 420 {
                GatewayError::FloodWait {
                    seconds: rpc.value.unwrap_or(60) as u64,
                }
            } else if rpc.name.starts_with("FILE_REFERENCE") {
                GatewayError::ReferenceExpired
            } else if rpc.code == 401 || rpc.name.contains("AUTH_KEY") {
                GatewayError::Fatal(format!("{} ({})", rpc.name, rpc.code))
            } else {
                GatewayError::Permanent(format!("{} ({})", rpc.name, rpc.code))
            }
        }
        other => GatewayError::Transient(other.to_string()),
    }
}
