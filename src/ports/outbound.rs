//! Outbound ports. The engine calls into infrastructure.
//!
//! Implemented by adapters; mocked in use-case tests.

use crate::domain::{Chat, GatewayError, MediaAccessRef, Message};

/// Messaging-service gateway: one authenticated session shared by all jobs
/// of a user. All calls pass through the adapter's rate gate.
#[async_trait::async_trait]
pub trait TgGateway: Send + Sync {
    /// Enumerate all dialogs the account participates in. Finite and
    /// non-restartable; the caller pages to completion.
    async fn get_dialogs(&self) -> Result<Vec<Chat>, GatewayError>;

    /// Resolve a single chat by its normalised id.
    async fn resolve_chat(&self, chat_id: i64) -> Result<Chat, GatewayError>;

    /// Id of the authenticated account; used by the "only my messages"
    /// filter.
    async fn get_me_id(&self) -> Result<i64, GatewayError>;

    /// Fetch one page of history with `id > min_id`, ordered ascending.
    /// Callers rely on monotonicity: the resume cursor is the max seen id.
    /// Boundary enforcement stays client-side; implementations must filter
    /// out-of-range ids rather than trust the server.
    async fn fetch_ascending(
        &self,
        chat_id: i64,
        min_id: i32,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError>;

    /// Download up to `limit` bytes at `offset` for the given access
    /// reference. One call is one wire request; the rate gate admits it.
    async fn download_chunk(
        &self,
        access: &MediaAccessRef,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>, GatewayError>;

    /// Re-fetch the owning message and return a fresh access reference
    /// after a `ReferenceExpired` failure.
    async fn refresh_reference(
        &self,
        chat_id: i64,
        message_id: i32,
    ) -> Result<MediaAccessRef, GatewayError>;
}
