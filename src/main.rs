//! Wiring & DI. Entry point: bootstrap adapters, inject into the engine,
//! serve the API. No business logic here; the session must already be
//! authorized (login happens outside this process).

use std::path::PathBuf;
use std::sync::Arc;
use tg_export::adapters::http;
use tg_export::adapters::persistence::ResumeStore;
use tg_export::adapters::telegram::{GrammersTgGateway, RateGate};
use tg_export::ports::TgGateway;
use tg_export::shared::config::AppConfig;
use tg_export::usecases::ExportEngine;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("TG_EXPORT_CONFIG").unwrap_or_else(|_| "config.yml".into());
    let cfg = AppConfig::load(&config_path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(config = %config_path, "configuration loaded");

    let data_path = cfg.data_path();
    tokio::fs::create_dir_all(&data_path).await?;
    tokio::fs::create_dir_all(cfg.output_path()).await?;

    // --- Telegram client with persistent session ---
    let client = create_telegram_client(&cfg).await?;
    if !client
        .is_authorized()
        .await
        .map_err(|e| anyhow::anyhow!("authorization check: {}", e))?
    {
        anyhow::bail!(
            "session at {} is not authorized; log in with the companion CLI first",
            cfg.session_path().display()
        );
    }
    info!("session authorized");

    let gate = Arc::new(RateGate::default());
    let gateway: Arc<dyn TgGateway> = Arc::new(GrammersTgGateway::new(client, gate));

    // --- Engine: resume store is the source of truth on restart ---
    let store = Arc::new(ResumeStore::new(&data_path));
    let engine = Arc::new(ExportEngine::new(gateway, store, &cfg));
    engine.rehydrate().await?;

    // --- API ---
    let app = http::router(Arc::clone(&engine));
    let addr = format!("0.0.0.0:{}", cfg.web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "export api listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create a grammers Client over the persistent session file. Requires
/// telegram.api_id in the config (api_hash is only needed for the login
/// flow, which lives outside this binary).
async fn create_telegram_client(cfg: &AppConfig) -> anyhow::Result<grammers_client::Client> {
    let api_id = cfg.telegram.api_id.unwrap_or(0);
    if api_id == 0 {
        anyhow::bail!("set telegram.api_id in the config (from https://my.telegram.org)");
    }

    let session_path: PathBuf = cfg.session_path();
    let session = tg_export::adapters::telegram::session::open_file_session(&session_path).await?;
    let session = Arc::new(session);
    let pool = grammers_client::SenderPool::new(session, api_id);
    let handle = pool.handle.clone();
    tokio::spawn(async move {
        pool.runner.run().await;
    });
    Ok(grammers_client::Client::new(handle))
}
