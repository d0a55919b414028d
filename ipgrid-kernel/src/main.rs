/**
 * IPGRID KERNEL - Point d'entrée principal du serveur IPGrid
 *
 * RÔLE : Orchestration de tous les modules : config, store, scanner,
 * réservations, tests de débit, monitoring, HTTP.
 * Bootstrap du système complet avec gestion d'erreurs et logging.
 *
 * ARCHITECTURE : Inventaire /24 persistant + réconciliation de scans nmap
 * + orchestrateur iperf3 via SSH + API REST.
 */

mod config;
mod gateway;
mod health;
mod http;
mod models;
mod monitoring;
mod netdiscover;
mod probe;
mod recon;
mod reservation;
mod store;
mod traffic;

use crate::config::load_config;
use crate::gateway::SshGateway;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::monitoring::{AgentChecker, MonitoringRegistrar};
use crate::probe::NmapProbe;
use crate::recon::Scanner;
use crate::reservation::ReservationManager;
use crate::store::{FileStore, HostStore};
use crate::traffic::TestOrchestrator;

use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config().await;
    http::log_security_mode(&config);

    // inventaire persistant
    let store: Arc<dyn HostStore> = Arc::new(
        FileStore::new(PathBuf::from(&config.storage_path))
            .with_context(|| format!("failed to open store {}", config.storage_path))?,
    );
    info!(
        "[kernel] store loaded: {} hosts, {} scans",
        store.host_count(),
        store.scan_count()
    );

    // scanner et réservations sur le même store
    let probe = Arc::new(NmapProbe::new(config.scan.timeout_secs));
    let scanner = Arc::new(Scanner::new(store.clone(), probe));
    let reservations = Arc::new(ReservationManager::new(store.clone()));

    // gateway SSH partagé entre tests de débit et sondes d'agents
    let gateway = Arc::new(SshGateway::new(
        config.ssh.user.clone(),
        config.ssh.key_path.clone(),
        config.ssh.connect_timeout_secs,
        config.ssh.command_timeout_secs,
    ));
    let orchestrator = Arc::new(TestOrchestrator::new(gateway.clone()));
    let checker = Arc::new(AgentChecker::new(gateway));

    let registrar = Arc::new(MonitoringRegistrar::new(
        PathBuf::from(&config.monitoring.targets_path),
        config.monitoring.metrics_port,
        config.monitoring.reload_url.clone(),
    ));

    let app_state = AppState {
        store,
        scanner,
        reservations,
        orchestrator,
        registrar,
        checker,
        health_tracker: HealthTracker::new(),
        api_key: config.api_key.clone(),
    };

    let app = http::build_router(app_state);

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen))?;
    info!("[kernel] listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await.context("failed to bind")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
