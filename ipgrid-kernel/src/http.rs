/**
 * API REST IPGRID - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Ce module expose l'API REST d'IPGrid : scans à la demande, consultation
 * de l'inventaire, réservations, tests de débit et enregistrement des
 * cibles de monitoring.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes organisées : /health, /api/scan, /api/node, /api/network,
 *   /api/traffic, /api/monitoring
 * - Sérialisation JSON automatique des réponses, timestamps RFC3339
 * - Erreurs HTTP standardisées (400, 401, 404, 500)
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Clé absente de la config = mode ouvert (signalé au boot)
 */

use crate::config::KernelConfig;
use crate::health::HealthTracker;
use crate::models::{check_address, HistoryEntry, HostRecord, Subnet};
use crate::monitoring::{AddOutcome, AgentChecker, AgentReadiness, MonitoringRegistrar};
use crate::netdiscover::{discover_local_networks, LocalNetwork};
use crate::recon::{ScanError, Scanner, ScanReport};
use crate::reservation::{Annotation, ReservationError, ReservationManager, ReserveParams};
use crate::store::HostStore;
use crate::traffic::{TestOrchestrator, TestParams, TrafficError, TrafficTest};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HostStore>,
    pub scanner: Arc<Scanner>,
    pub reservations: Arc<ReservationManager>,
    pub orchestrator: Arc<TestOrchestrator>,
    pub registrar: Arc<MonitoringRegistrar>,
    pub checker: Arc<AgentChecker>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<String>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_body(code: StatusCode, message: String) -> ApiError {
    (code, Json(serde_json::json!({ "error": message })))
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::InvalidRequest(_) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
            ScanError::Store(_) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<ReservationError> for ApiError {
    fn from(e: ReservationError) -> Self {
        match e {
            ReservationError::InvalidRequest(_) => {
                error_body(StatusCode::BAD_REQUEST, e.to_string())
            }
            ReservationError::NotFound(_) => error_body(StatusCode::NOT_FOUND, e.to_string()),
            ReservationError::Store(_) => {
                error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<TrafficError> for ApiError {
    fn from(e: TrafficError) -> Self {
        match e {
            TrafficError::InvalidRequest(_) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
            TrafficError::NotFound(_) => error_body(StatusCode::NOT_FOUND, e.to_string()),
        }
    }
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = &app.api_key else {
        // mode ouvert, signalé au boot
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] rejected request to {} (bad api key)", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/scan", post(run_scan))
        .route("/api/node/{ip}", get(get_node))
        .route("/api/node/update", post(update_node))
        .route("/api/reserve", post(reserve))
        .route("/api/release/{ip}", post(release))
        .route("/api/networks/discover", get(discover_networks))
        .route("/api/network/{subnet}/nodes", get(list_nodes))
        .route("/api/network/clear/{subnet}", post(clear_network))
        .route("/api/network/reset-status/{subnet}", post(reset_network))
        .route("/api/traffic/start", post(start_test))
        .route("/api/traffic/status/{id}", get(test_status))
        .route("/api/traffic/results/{id}", get(test_results))
        .route("/api/traffic/active", get(active_tests))
        .route("/api/traffic/vm/check", post(check_agents))
        .route("/api/monitoring/register", post(register_target))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /health (état du kernel, sans auth)
async fn get_health(State(app): State<AppState>) -> Json<crate::health::KernelHealth> {
    Json(app.health_tracker.get_health(&app.store, &app.orchestrator))
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    subnet: String,
    start_octet: u8,
    end_octet: u8,
}

// POST /api/scan (réconciliation d'une plage, synchrone)
async fn run_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ScanReport>, ApiError> {
    let subnet: Subnet = req
        .subnet
        .parse()
        .map_err(|e: crate::models::RequestError| error_body(StatusCode::BAD_REQUEST, e.to_string()))?;
    let report = app.scanner.scan(&subnet, req.start_octet, req.end_octet).await?;
    Ok(Json(report))
}

#[derive(serde::Serialize)]
struct NodeDetail {
    #[serde(flatten)]
    record: HostRecord,
    /// Les 10 dernières entrées, la plus récente d'abord.
    history: Vec<HistoryEntry>,
}

// GET /api/node/{ip} (détail + historique récent)
async fn get_node(
    State(app): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<NodeDetail>, ApiError> {
    check_address(&ip).map_err(|e| error_body(StatusCode::BAD_REQUEST, e.to_string()))?;
    let record = app
        .store
        .get(&ip)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("no record for {}", ip)))?;
    let history = app
        .store
        .history(&ip, 10)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(NodeDetail { record, history }))
}

#[derive(Debug, Deserialize)]
struct NodeUpdateRequest {
    address: String,
    notes: Option<String>,
    is_reserved: Option<bool>,
}

// POST /api/node/update (annotation manuelle)
async fn update_node(
    State(app): State<AppState>,
    Json(req): Json<NodeUpdateRequest>,
) -> Result<Json<HostRecord>, ApiError> {
    let annotation = Annotation { notes: req.notes, is_reserved: req.is_reserved };
    let record = app.reservations.annotate(&req.address, &annotation)?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct ReserveRequest {
    address: String,
    reserved_for: String,
    reserved_by: Option<String>,
    description: Option<String>,
}

// POST /api/reserve
async fn reserve(
    State(app): State<AppState>,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<HostRecord>, ApiError> {
    let params = ReserveParams {
        address: req.address,
        reserved_for: req.reserved_for,
        reserved_by: req.reserved_by,
        description: req.description,
    };
    let record = app.reservations.reserve(&params)?;
    Ok(Json(record))
}

// POST /api/release/{ip}
async fn release(
    State(app): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<HostRecord>, ApiError> {
    let record = app.reservations.release(&ip)?;
    Ok(Json(record))
}

// GET /api/networks/discover (les /24 locaux candidats)
async fn discover_networks() -> Result<Json<Vec<LocalNetwork>>, ApiError> {
    let networks = discover_local_networks()
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(networks))
}

fn parse_subnet(raw: &str) -> Result<Subnet, ApiError> {
    raw.parse()
        .map_err(|e: crate::models::RequestError| error_body(StatusCode::BAD_REQUEST, e.to_string()))
}

// GET /api/network/{subnet}/nodes (inventaire d'un /24, trié par octet)
async fn list_nodes(
    State(app): State<AppState>,
    Path(subnet): Path<String>,
) -> Result<Json<Vec<HostRecord>>, ApiError> {
    let subnet = parse_subnet(&subnet)?;
    let records = app
        .store
        .list_subnet(&subnet)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(records))
}

// POST /api/network/clear/{subnet} (purge hôtes + historique + scans)
async fn clear_network(
    State(app): State<AppState>,
    Path(subnet): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subnet = parse_subnet(&subnet)?;
    let removed = app
        .store
        .clear_subnet(&subnet)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

// POST /api/network/reset-status/{subnet} (force down sauf réservés)
async fn reset_network(
    State(app): State<AppState>,
    Path(subnet): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let subnet = parse_subnet(&subnet)?;
    let reset = app
        .store
        .reset_subnet(&subnet)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

// POST /api/traffic/start (rend la main immédiatement avec le handle)
async fn start_test(
    State(app): State<AppState>,
    Json(params): Json<TestParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = app.orchestrator.start(&params)?;
    Ok(Json(serde_json::json!({ "id": id, "status": "running" })))
}

// GET /api/traffic/status/{id}
async fn test_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TrafficTest>, ApiError> {
    Ok(Json(app.orchestrator.status(&id)?))
}

// GET /api/traffic/results/{id} (synthèse normalisée)
async fn test_results(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::traffic::TestView>, ApiError> {
    Ok(Json(app.orchestrator.summarize(&id)?))
}

// GET /api/traffic/active
async fn active_tests(State(app): State<AppState>) -> Json<crate::traffic::ActiveTests> {
    Json(app.orchestrator.list_active())
}

#[derive(Debug, Deserialize)]
struct AddressRequest {
    address: String,
}

// POST /api/traffic/vm/check (readiness des agents de mesure)
async fn check_agents(
    State(app): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<AgentReadiness>, ApiError> {
    check_address(&req.address).map_err(|e| error_body(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(app.checker.check(&req.address).await))
}

// POST /api/monitoring/register (cible Prometheus, idempotent)
async fn register_target(
    State(app): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<AddOutcome>, ApiError> {
    check_address(&req.address).map_err(|e| error_body(StatusCode::BAD_REQUEST, e.to_string()))?;
    let outcome = app
        .registrar
        .register(&req.address)
        .await
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(outcome))
}

pub fn log_security_mode(config: &KernelConfig) {
    if config.api_key.is_none() {
        warn!("[http] no api key configured, API is open");
    }
}
