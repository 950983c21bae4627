// Barrio Warehouse - Web Server
// Read-only REST API over the fact tables, coverage and key conflicts

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use clap::Parser;
use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use barrio_warehouse::{
    get_barrios, get_facts, get_open_conflicts, latest_coverage, CanonicalNeighborhood,
    ConflictRecord, EngineConfig, FactQuery, FactRow, FactTable, SourceCoverage,
};

/// Command-line arguments for barrio-server
#[derive(Parser, Debug)]
#[command(name = "barrio-server")]
#[command(about = "Read-only API over the barrio warehouse")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000", env = "BARRIO_SERVER_PORT")]
    port: u16,

    /// Config file (falls back to BARRIO_WAREHOUSE_CONFIG, then ./barrio-warehouse.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, Response> {
        self.db.lock().map_err(|_| {
            error!("database mutex poisoned");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "database unavailable".to_string())
        })
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

fn failure(status: StatusCode, message: String) -> Response {
    (status, Json(ApiResponse::<()>::err(message))).into_response()
}

fn respond<T: Serialize>(what: &str, result: anyhow::Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            error!(error = %e, "error getting {}", what);
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/barrios - Canonical neighborhood list
async fn list_barrios(State(state): State<AppState>) -> Response {
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };
    respond::<Vec<CanonicalNeighborhood>>("barrios", get_barrios(&conn))
}

/// GET /api/facts/:table?barrio_id&year&indicator_id
async fn list_facts(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<FactQuery>,
) -> Response {
    let Some(table) = FactTable::from_name(&table) else {
        return failure(StatusCode::NOT_FOUND, format!("unknown fact table '{}'", table));
    };

    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };
    respond::<Vec<FactRow>>("facts", get_facts(&conn, table, &query))
}

/// GET /api/coverage - Coverage of the latest run
async fn coverage(State(state): State<AppState>) -> Response {
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };

    match latest_coverage(&conn) {
        Ok(Some(report)) => (StatusCode::OK, Json(ApiResponse::ok(report.to_json()))).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, "no runs recorded".to_string()),
        Err(e) => respond::<()>("coverage", Err(e)),
    }
}

/// GET /api/coverage/:source_id - Detailed coverage for one source
async fn source_coverage(State(state): State<AppState>, Path(source_id): Path<String>) -> Response {
    // Decode URL-encoded source id
    let source_id = urlencoding::decode(&source_id)
        .map(|s| s.into_owned())
        .unwrap_or(source_id);

    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };

    match latest_coverage(&conn) {
        Ok(Some(report)) => match report.sources.get(&source_id) {
            Some(source) => respond::<SourceCoverage>("coverage", Ok(source.clone())),
            None => failure(StatusCode::NOT_FOUND, format!("no coverage for source '{}'", source_id)),
        },
        Ok(None) => failure(StatusCode::NOT_FOUND, "no runs recorded".to_string()),
        Err(e) => respond::<()>("coverage", Err(e)),
    }
}

/// GET /api/conflicts - Key conflicts waiting for review
async fn conflicts(State(state): State<AppState>) -> Response {
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };
    respond::<Vec<ConflictRecord>>("conflicts", get_open_conflicts(&conn))
}

fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/barrios", get(list_barrios))
        .route("/facts/:table", get(list_facts))
        .route("/coverage", get(coverage))
        .route("/coverage/:source_id", get(source_coverage))
        .route("/conflicts", get(conflicts))
        .with_state(state)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "barrio_server=info,barrio_warehouse=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = EngineConfig::resolve(args.config.as_deref())?;

    if !config.db_path.exists() {
        anyhow::bail!(
            "Database not found at {:?}. Run: barrio-warehouse init",
            config.db_path
        );
    }

    let conn = Connection::open(&config.db_path)
        .with_context(|| format!("Failed to open database {:?}", config.db_path))?;
    info!("Database opened: {:?}", config.db_path);

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let app = Router::new()
        .nest("/api", api_router(state))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server running on http://localhost:{}/api", args.port);

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
