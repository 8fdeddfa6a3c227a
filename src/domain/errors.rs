//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these. Per-item errors stay
//! scoped to the item; only `Fatal` reaches the job controller.

use thiserror::Error;

/// Errors raised by the messaging-service gateway.
///
/// The worker recovery strategy is keyed on the variant: `FloodWait` holds
/// the global rate gate without consuming an attempt, `ReferenceExpired`
/// refreshes and consumes one attempt, `Transient` backs off and retries,
/// `Permanent` fails the item, `Fatal` fails the whole job.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Server-mandated cooldown: no request may be sent for `seconds`.
    #[error("flood wait: retry after {seconds} seconds")]
    FloodWait { seconds: u64 },

    /// The access reference for a media item aged out; refresh from the
    /// owning message before retrying.
    #[error("file reference expired")]
    ReferenceExpired,

    /// Network/transport error; retry with backoff.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Unrecoverable per-item protocol error (deleted message, access
    /// denied, unsupported media).
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Session-level failure (revoked session, invalid credentials);
    /// aborts the job, not just the item.
    #[error("fatal session error: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// Stable error-kind tag stored with failed items and surfaced over
    /// the API.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::FloodWait { .. } => "flood_wait",
            GatewayError::ReferenceExpired => "reference_expired",
            GatewayError::Transient(_) => "transient",
            GatewayError::Permanent(_) => "permanent",
            GatewayError::Fatal(_) => "fatal",
        }
    }
}

/// Errors raised by the engine core and its persistence.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    /// Another control operation already holds the job's operation lock.
    #[error("job is busy with another operation")]
    Busy,

    #[error("job not found: {0}")]
    NotFound(String),

    /// Control operation not valid in the job's current state.
    #[error("invalid state for operation: {0}")]
    InvalidState(String),

    #[error("delegated downloader error: {0}")]
    Delegated(String),
}

impl EngineError {
    pub fn store(e: impl std::fmt::Display) -> Self {
        EngineError::Store(e.to_string())
    }
}
