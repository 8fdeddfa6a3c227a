//! Chat resolver: turns a job filter into a concrete ordered chat list.
//!
//! Explicit ids are normalised (channel prefix auto-supplied when the
//! operator gave the raw numeric form) and resolved individually;
//! otherwise all dialogs are enumerated and filtered by the type mask.
//! Unresolvable ids are logged and skipped, never fatal.

use crate::domain::{Chat, ChatKind, ChatTypeMask, ExportFilter, GatewayError};
use crate::ports::TgGateway;
use std::sync::Arc;
use tracing::{info, warn};

/// Wire prefix for channel/supergroup dialog ids: `-100` ahead of the raw
/// channel number.
const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

pub struct ChatResolver {
    gateway: Arc<dyn TgGateway>,
}

impl ChatResolver {
    pub fn new(gateway: Arc<dyn TgGateway>) -> Self {
        Self { gateway }
    }

    /// Resolve the filter into the ordered list of chats to scan.
    pub async fn resolve(&self, filter: &ExportFilter) -> Result<Vec<Chat>, GatewayError> {
        if !filter.chat_ids.is_empty() {
            self.resolve_explicit(&filter.chat_ids).await
        } else {
            self.resolve_by_mask(&filter.chat_types).await
        }
    }

    async fn resolve_explicit(&self, ids: &[i64]) -> Result<Vec<Chat>, GatewayError> {
        let mut chats = Vec::with_capacity(ids.len());
        for &raw in ids {
            match self.resolve_one(raw).await {
                Some(chat) => chats.push(chat),
                None => warn!(chat_id = raw, "chat id unresolvable, skipping"),
            }
        }
        info!(requested = ids.len(), resolved = chats.len(), "explicit chat list resolved");
        Ok(chats)
    }

    /// Try the id as given, then with the channel prefix supplied. Fatal
    /// session errors propagate; per-id failures just yield none.
    async fn resolve_one(&self, raw: i64) -> Option<Chat> {
        for candidate in id_candidates(raw) {
            match self.gateway.resolve_chat(candidate).await {
                Ok(chat) => return Some(chat),
                Err(GatewayError::Fatal(e)) => {
                    warn!(chat_id = candidate, error = %e, "fatal error resolving chat");
                    return None;
                }
                Err(_) => continue,
            }
        }
        None
    }

    async fn resolve_by_mask(&self, mask: &ChatTypeMask) -> Result<Vec<Chat>, GatewayError> {
        let dialogs = self.gateway.get_dialogs().await?;
        let chats: Vec<Chat> = dialogs
            .into_iter()
            .filter(|c| mask_matches(mask, c))
            .collect();
        info!(count = chats.len(), "dialogs filtered by type mask");
        Ok(chats)
    }
}

/// Candidate normalisations for an operator-supplied id: as given, then
/// with the `-100` channel prefix when the raw positive form was used.
fn id_candidates(raw: i64) -> Vec<i64> {
    let mut out = vec![raw];
    if raw > 0 {
        out.push(-(CHANNEL_ID_OFFSET + raw));
    }
    out
}

fn mask_matches(mask: &ChatTypeMask, chat: &Chat) -> bool {
    match chat.kind {
        ChatKind::Private => mask.private_chats,
        ChatKind::Bot => mask.bot_chats,
        ChatKind::Group | ChatKind::Supergroup => {
            if chat.is_public() {
                mask.public_groups
            } else {
                mask.private_groups
            }
        }
        ChatKind::Channel => {
            if chat.is_public() {
                mask.public_channels
            } else {
                mask.private_channels
            }
        }
    }
}
