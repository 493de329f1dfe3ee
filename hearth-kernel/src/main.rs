/**
 * HEARTH KERNEL - Point d'entrée du plan de contrôle
 *
 * RÔLE : Orchestration des modules : config, store, canal de contrôle,
 * moniteur, health, sauvegardes auto, API HTTP/WS.
 *
 * ARCHITECTURE : flux persistants agent → kernel + API REST/WS opérateur,
 * état partagé par handles (`KernelState`).
 */

use anyhow::Context;
use hearth_kernel::config::load_config;
use hearth_kernel::store::{FleetStore, MemoryStore};
use hearth_kernel::{backups, channel, http, monitor, KernelState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().await;
    if config.api_key.is_none() {
        warn!("[kernel] SECURITY: HEARTH_API_KEY not set - operator API will refuse every request");
    }

    let store: Arc<dyn FleetStore> = match &config.data_file {
        Some(path) => Arc::new(
            MemoryStore::open(path).with_context(|| format!("loading fleet from {}", path.display()))?,
        ),
        None => {
            info!("[kernel] no data file configured, fleet kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let http_addr = config.http_addr;
    let control_addr = config.control_addr;
    let state = KernelState::new(config, store);

    // canal de contrôle des agents
    let control = TcpListener::bind(control_addr)
        .await
        .with_context(|| format!("binding control channel on {control_addr}"))?;
    tokio::spawn(channel::serve(control, state.clone()));

    // liveness + snapshots temps réel
    monitor::spawn_monitor(state.clone());

    // démarre la publication auto du health
    state.health.spawn_health_publisher(state.clone());

    backups::spawn_auto_backups(state.clone());

    // HTTP
    let app = http::build_router(state.clone());
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding http on {http_addr}"))?;
    info!("[kernel] listening on http://{http_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Err(e) = state.store.flush() {
        warn!("[kernel] final flush failed: {e}");
    }
    info!("[kernel] stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[kernel] failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("[kernel] shutdown requested");
}
