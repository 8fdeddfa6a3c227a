//! Infrastructure adapters. Implement outbound ports and the inbound API.
//!
//! Telegram, filesystem, external downloader, HTTP. Map errors to the
//! domain error kinds.

pub mod delegated;
pub mod http;
pub mod persistence;
pub mod telegram;
