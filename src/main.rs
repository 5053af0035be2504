//! HN story stream: binary entrypoint.
//! Boots the store, both source schedulers, the live hub and the Axum server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hn_story_stream::ingest::{
    self, fetcher::HttpFetcher, orchestrator::Orchestrator, persist::Persister,
    scheduler::OverlapPolicy,
};
use hn_story_stream::metrics::Metrics;
use hn_story_stream::{api, AppConfig, AppState, LiveConfig, LiveHub, Store};

/// Compact logs by default, JSON when LOG_FORMAT=json. Filter via RUST_LOG.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before tracing init so .env can set RUST_LOG / LOG_FORMAT.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env().context("loading configuration")?;
    tracing::info!(
        base_url = %config.base_url,
        pages = config.pages_per_run,
        port = config.port,
        "starting"
    );

    let metrics = Metrics::init()?;

    if let Some(dir) = sqlite_parent_dir(&config.database_url) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {dir}"))?;
    }
    let store = Store::connect(&config.database_url, 5).await?;
    store.migrate().await?;

    let orchestrator = Arc::new(Orchestrator::new(HttpFetcher::new()?));
    let persister = Persister::new(store.clone());
    let schedulers: Vec<_> = config
        .sources()
        .into_iter()
        .map(|job| {
            ingest::schedule_source(
                job,
                Arc::clone(&orchestrator),
                persister.clone(),
                OverlapPolicy::Skip,
            )
        })
        .collect();

    let live = LiveHub::new(store.clone(), LiveConfig::default());
    let sweep = live.spawn_liveness_sweep();

    let app = api::router(AppState {
        store: store.clone(),
        live,
    })
    .merge(metrics.router());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("http server")?;

    for scheduler in &schedulers {
        scheduler.stop();
    }
    sweep.abort();
    store.close().await;
    tracing::info!("stopped");
    Ok(())
}

/// Directory holding a file-backed sqlite database, if any.
fn sqlite_parent_dir(url: &str) -> Option<&str> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    let dir = path.rsplit_once('/')?.0;
    (!dir.is_empty()).then_some(dir)
}
