//! Session storage. Load the persistent grammers session from disk.
//!
//! The engine consumes an already-authorized session file; the interactive
//! login flow lives outside this process.

use grammers_session::storages::SqliteSession;
use std::path::Path;

/// Open the persistent session storage at the given path, creating parent
/// directories as needed. The session must have been authorized beforehand;
/// callers verify with `Client::is_authorized` and fail fast otherwise.
pub async fn open_file_session(path: impl AsRef<Path>) -> anyhow::Result<SqliteSession> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("create session directory: {}", e))?;
    }
    SqliteSession::open(path)
        .await
        .map_err(|e| anyhow::anyhow!("open session file: {}", e))
}
