//! newslens API server binary.
//!
//! Wires the scoring subsystem together — storage, provider client, cache,
//! progress registry, score manager, config watcher, background workers —
//! and serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use newslens_core::config::ensemble::{EnsembleConfig, EnsembleHandle};
use newslens_core::config::{expand_tilde, watch, Config};
use newslens_core::llm::HttpCompletionClient;
use newslens_core::scoring::cache::ScoreCache;
use newslens_core::scoring::manager::{run_rescore_worker, ScoreManager};
use newslens_core::scoring::progress::ProgressRegistry;
use newslens_core::storage;

use newslens_server::state::AppState;

/// newslens API server — scores news articles for political bias.
#[derive(Parser)]
#[command(name = "newslens-server", version, about)]
struct Cli {
    /// Host address to bind to. Overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on. Overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the service configuration file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (respects RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading service config")?;

    let db_path = expand_tilde(&config.storage.db_path);
    let pool_size = storage::pool_size_for(config.llm.max_concurrent_requests);
    tracing::info!(db = %db_path.display(), pool_size, "initializing storage");
    let db = storage::init_db(&db_path.to_string_lossy(), pool_size)
        .await
        .context("initializing database")?;

    let ensemble_path = expand_tilde(&config.scoring.ensemble_path);
    let ensemble_config =
        EnsembleConfig::load(&ensemble_path.to_string_lossy()).map_err(|errors| {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::anyhow!("ensemble config at {}: {joined}", ensemble_path.display())
        })?;
    tracing::info!(
        models = ensemble_config.models.len(),
        version = %ensemble_config.version,
        formula = ?ensemble_config.formula,
        "ensemble config loaded"
    );

    let client = Arc::new(HttpCompletionClient::new(
        config.llm.api_key.clone(),
        config.llm.api_key_secondary.clone(),
        config.llm.base_url.clone(),
        config.llm.http_timeout(),
        config.llm.max_concurrent_requests,
    ));

    let cache = Arc::new(ScoreCache::new(
        Duration::from_secs(ensemble_config.cache_ttl_seconds),
        Duration::from_secs(ensemble_config.error_cache_ttl_seconds),
    ));
    let progress = Arc::new(ProgressRegistry::new(Duration::from_secs(
        config.scoring.progress_retention_seconds,
    )));
    let ensemble = Arc::new(EnsembleHandle::new(ensemble_config));

    let cancel = CancellationToken::new();

    let manager = ScoreManager::new(
        db.clone(),
        client,
        ensemble.clone(),
        cache.clone(),
        progress.clone(),
        cancel.clone(),
    );

    let manager = if config.scoring.auto_analyze {
        let (manager, rx) = manager.with_rescore_queue();
        let manager = Arc::new(manager);
        tokio::spawn(run_rescore_worker(manager.clone(), rx, cancel.clone()));
        manager
    } else {
        tracing::info!("background rescore worker disabled");
        Arc::new(manager)
    };

    // Background maintenance: config hot reload, progress retention,
    // cache expiry.
    tokio::spawn(watch::watch_ensemble_config(
        ensemble_path,
        ensemble,
        cancel.clone(),
    ));
    let sweep_interval = Duration::from_secs(config.scoring.progress_sweep_seconds);
    progress.spawn_sweeper(sweep_interval, cancel.clone());
    let cache_sweep_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cache_sweep_cancel.cancelled() => return,
                () = tokio::time::sleep(sweep_interval) => cache.purge_expired(),
            }
        }
    });

    let state = Arc::new(AppState { db, manager });
    let router = newslens_server::build_router(state);

    let host = cli.host.unwrap_or(config.server.host);
    let port = cli.port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}"))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    tracing::info!("listening on http://{host}:{port}");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            shutdown_cancel.cancel();
        })
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

/// Wait for an OS shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler, using Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for Ctrl+C");
                }
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Ctrl+C handler error");
                }
                tracing::info!("received Ctrl+C");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
