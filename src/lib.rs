pub mod config;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod http;
pub mod locks;
pub mod models;
pub mod policy;
pub mod redaction;
pub mod runner;
pub mod scheduler;
pub mod xero;

use crate::config::ServiceConfig;
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::errors::AppError;
use crate::http::AppState;
use crate::policy::AccessPolicy;
use crate::runner::SyncRunner;
use crate::scheduler::{ExecutorFuture, SyncScheduler};
use crate::xero::HttpXeroClient;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const SYNC_RUN_RETENTION_DAYS: u32 = 30;

pub async fn run() -> anyhow::Result<()> {
    let config = ServiceConfig::load().context("failed to load configuration")?;
    init_tracing(config.log_dir.as_deref()).map_err(anyhow::Error::msg)?;

    let key = config
        .token_encryption_key
        .as_deref()
        .ok_or_else(|| AppError::Config("TOKEN_ENCRYPTION_KEY is required".to_string()))?;
    let cipher = TokenCipher::from_base64_key(key)?;

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let db = Arc::new(Database::new(&config.database_path)?);
    let api = Arc::new(HttpXeroClient::new(config.xero.clone()));
    let runner = Arc::new(SyncRunner::new(db, api, cipher, config.sync.clone()));

    let scheduler = SyncScheduler::new(config.sync.interval_secs.map(std::time::Duration::from_secs));
    scheduler.set_executor(Arc::new({
        let runner = runner.clone();
        move || -> ExecutorFuture {
            let runner = runner.clone();
            Box::pin(async move {
                match tokio::task::spawn_blocking(move || runner.sync_all()).await {
                    Ok(Ok(summary)) => summary.failed > 0,
                    Ok(Err(error)) => {
                        tracing::error!(error = %error, "scheduled sync could not start");
                        true
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "scheduled sync task panicked");
                        true
                    }
                }
            })
        }
    }));
    scheduler.start();

    tokio::spawn({
        let runner = runner.clone();
        async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                let runner = runner.clone();
                match tokio::task::spawn_blocking(move || runner.db().prune_sync_runs(SYNC_RUN_RETENTION_DAYS)).await {
                    Ok(Ok(removed)) if removed > 0 => tracing::info!(removed, "old sync runs pruned"),
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => tracing::warn!(error = %error, "sync run retention failed"),
                    Err(error) => tracing::warn!(error = %error, "sync run retention task failed"),
                }
            }
        }
    });

    let state = AppState {
        runner,
        policy: AccessPolicy::from_config(&config),
        scheduler,
    };
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(
        bind_addr = %config.bind_addr,
        app_env = %config.app_env,
        sync_interval_secs = ?config.sync.interval_secs,
        "coach ledger sync listening"
    );
    axum::serve(listener, http::router(state))
        .await
        .context("http server stopped")?;
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_dir) = log_dir else {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|error| error.to_string());
    };

    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "coach-ledger-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
