// =============================================================================
// leadlens — Main Entry Point
// =============================================================================
//
// Polls the public copy-trading surface of one venue for a configured set of
// lead traders, reconciles visible and hidden traders into a uniform
// position lifecycle, and serves consensus, insights, and a simulation layer
// over a thin JSON API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregate;
mod api;
mod app_state;
mod consensus;
mod error;
mod ingest;
mod insights;
mod normalize;
mod queries;
mod risk_math;
mod runtime_config;
mod scheduler;
mod score;
mod sim;
mod store;
mod tracker;
mod types;
mod venue;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::venue::VenueClient;

const CONFIG_PATH: &str = "leadlens_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    if config.scraper.lead_ids.is_empty() {
        warn!("no lead traders configured (set scraper.lead_ids or LEADLENS_LEAD_IDS)");
    }

    info!(
        platform = %config.platform,
        leads = config.scraper.lead_ids.len(),
        interval_ms = config.scraper.interval_ms,
        concurrency = config.scraper.concurrency,
        scraper_enabled = config.scraper.enabled,
        "leadlens starting"
    );

    // ── 2. Store & shared state ──────────────────────────────────────────
    let store = Arc::new(Store::open(&config.db_path)?);
    let timeout_ms = config.scraper.timeout_ms;
    let state = Arc::new(AppState::new(config, store));

    // ── 3. Venue client ──────────────────────────────────────────────────
    let client = {
        let config = state.config.read();
        Arc::new(VenueClient::new(
            config.scraper.base_url.clone(),
            config.scraper.timeout_ms,
            config.scraper.order_page_size,
        ))
    };

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("LEADLENS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let api_state = state.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    // ── 5. Scheduler ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = if state.config.read().scraper.enabled {
        let scheduler = Scheduler::new(state.clone(), client.clone());
        Some(tokio::spawn(scheduler.run(shutdown_rx)))
    } else {
        info!("scraper disabled, running query-only");
        None
    };

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, draining current cycle");

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler_handle {
        // The in-flight cycle is bounded by the endpoint deadline; give it
        // twice that before letting go.
        let drain = Duration::from_millis(timeout_ms * 2);
        if tokio::time::timeout(drain, handle).await.is_err() {
            error!(drain_ms = drain.as_millis() as u64, "scheduler did not drain in time");
        }
    }

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("leadlens shut down complete");
    Ok(())
}
