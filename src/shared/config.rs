//! Application configuration. One YAML file, env overrides, defaults.
//!
//! An older flat `key=value` format is detected on read, migrated into the
//! hierarchical form, and rewritten as YAML. Missing keys take defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::EngineError;

/// Default bounded depth of each job's waiting bucket; the scanner blocks
/// on enqueue above this (backpressure).
pub const DEFAULT_QUEUE_SOFT_CAP: usize = 1000;

/// Telegram API credentials and transport options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub bot_token: Option<String>,
    /// Optional transport proxy URL (socks5/http).
    pub proxy_url: Option<String>,
    pub ipv6: bool,
    pub session_path: Option<String>,
}

/// Web control surface settings. The HTTP layer itself is thin; TLS and
/// the browser UI live behind the reverse proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
    pub admin_password: Option<String>,
    /// Persistent secret key for session cookies; generated once and kept.
    pub secret_key: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_password: None,
            secret_key: None,
        }
    }
}

/// Delegated external downloader settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegatedConfig {
    /// Container (or executable) name invoked per batch; empty disables
    /// delegated mode globally.
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub web: WebConfig,
    pub delegated: DelegatedConfig,
    /// Root for job metadata (`jobs/<id>/`).
    pub data_dir: String,
    /// Root for exported media trees.
    pub output_root: String,
    pub log_level: String,
    /// Waiting-bucket soft cap per job.
    pub queue_soft_cap: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            web: WebConfig::default(),
            delegated: DelegatedConfig::default(),
            data_dir: "./data".to_string(),
            output_root: "./exports".to_string(),
            log_level: "info".to_string(),
            queue_soft_cap: DEFAULT_QUEUE_SOFT_CAP,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, layered with `TG_EXPORT_*` env
    /// overrides. A legacy flat `key=value` file is silently migrated and
    /// rewritten as YAML before loading.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        dotenv::dotenv().ok();
        let path = path.as_ref();
        if path.exists() {
            migrate_legacy_if_needed(path)?;
        }

        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }
        builder = builder.add_source(config::Environment::with_prefix("TG_EXPORT").separator("__"));
        let cfg: Self = builder
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(cfg)
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_root)
    }

    pub fn session_path(&self) -> PathBuf {
        self.telegram
            .session_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_path().join("session.db"))
    }

    /// Delegated mode is only usable when a container name is configured.
    pub fn delegated_available(&self) -> bool {
        self.delegated
            .container
            .as_deref()
            .is_some_and(|c| !c.is_empty())
    }
}

/// Rewrite a legacy flat `key=value` config as hierarchical YAML in place.
/// YAML files (detected by a top-level mapping with a known section) pass
/// through untouched.
fn migrate_legacy_if_needed(path: &Path) -> Result<(), EngineError> {
    let raw = std::fs::read_to_string(path).map_err(EngineError::store)?;
    if !looks_like_flat_config(&raw) {
        return Ok(());
    }

    let flat = parse_flat(&raw);
    let cfg = from_flat(&flat);
    let yaml = serde_yaml::to_string(&cfg).map_err(|e| EngineError::Config(e.to_string()))?;

    // Write-to-temp-then-rename, same as every structured write.
    let tmp = path.with_extension("yml.tmp");
    std::fs::write(&tmp, yaml).map_err(EngineError::store)?;
    std::fs::rename(&tmp, path).map_err(EngineError::store)?;
    tracing::info!(path = %path.display(), "migrated legacy flat config to YAML");
    Ok(())
}

/// A flat config has at least one `key=value` line and no YAML-style
/// section header.
fn looks_like_flat_config(raw: &str) -> bool {
    let mut saw_kv = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.ends_with(':') {
            return false;
        }
        if let Some((key, _)) = line.split_once('=') {
            if !key.trim().is_empty() {
                saw_kv = true;
                continue;
            }
        }
        if line.contains(": ") {
            return false;
        }
    }
    saw_kv
}

fn parse_flat(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    map
}

/// Map legacy flat keys onto the hierarchical form; absent keys default.
fn from_flat(flat: &HashMap<String, String>) -> AppConfig {
    let mut cfg = AppConfig::default();
    let get = |k: &str| flat.get(k).cloned();

    cfg.telegram.api_id = get("api_id").and_then(|s| s.parse().ok());
    cfg.telegram.api_hash = get("api_hash");
    cfg.telegram.bot_token = get("bot_token");
    cfg.telegram.proxy_url = get("proxy").or_else(|| get("proxy_url"));
    cfg.telegram.ipv6 = get("ipv6").map(|s| s == "1" || s == "true").unwrap_or(false);
    cfg.telegram.session_path = get("session_path");
    if let Some(port) = get("web_port").and_then(|s| s.parse().ok()) {
        cfg.web.port = port;
    }
    cfg.web.admin_password = get("admin_password");
    cfg.web.secret_key = get("secret_key");
    cfg.delegated.container = get("tdl_container").or_else(|| get("container"));
    if let Some(dir) = get("data_dir") {
        cfg.data_dir = dir;
    }
    if let Some(root) = get("output_root").or_else(|| get("download_dir")) {
        cfg.output_root = root;
    }
    if let Some(level) = get("log_level") {
        cfg.log_level = level;
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_detection() {
        assert!(looks_like_flat_config("api_id=123\napi_hash=abc\n"));
        assert!(looks_like_flat_config("# comment\nweb_port=8080"));
        assert!(!looks_like_flat_config("telegram:\n  api_id: 123\n"));
        assert!(!looks_like_flat_config(""));
        assert!(!looks_like_flat_config("log_level: info"));
    }

    #[test]
    fn flat_values_map_onto_sections() {
        let raw = "api_id=111\napi_hash=\"h\"\nweb_port=9090\ntdl_container=tdl\nipv6=true\noutput_root=/srv/exports\n";
        let cfg = from_flat(&parse_flat(raw));
        assert_eq!(cfg.telegram.api_id, Some(111));
        assert_eq!(cfg.telegram.api_hash.as_deref(), Some("h"));
        assert!(cfg.telegram.ipv6);
        assert_eq!(cfg.web.port, 9090);
        assert_eq!(cfg.delegated.container.as_deref(), Some("tdl"));
        assert_eq!(cfg.output_root, "/srv/exports");
        // Absent keys keep defaults.
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.queue_soft_cap, DEFAULT_QUEUE_SOFT_CAP);
    }

    #[test]
    fn migration_rewrites_file_as_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "api_id=42\nweb_port=8888\n").unwrap();

        migrate_legacy_if_needed(&path).unwrap();

        let rewritten = std::fs::read_to_string(&path).unwrap();
        let cfg: AppConfig = serde_yaml::from_str(&rewritten).expect("valid yaml");
        assert_eq!(cfg.telegram.api_id, Some(42));
        assert_eq!(cfg.web.port, 8888);

        // Second read is a no-op: already YAML.
        migrate_legacy_if_needed(&path).unwrap();
        let again = std::fs::read_to_string(&path).unwrap();
        assert_eq!(rewritten, again);
    }

    #[test]
    fn delegated_requires_container_name() {
        let mut cfg = AppConfig::default();
        assert!(!cfg.delegated_available());
        cfg.delegated.container = Some(String::new());
        assert!(!cfg.delegated_available());
        cfg.delegated.container = Some("tdl".into());
        assert!(cfg.delegated_available());
    }
}
