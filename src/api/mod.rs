//! HTTP API for transfer requests, status lookups and health checks

use crate::config::ApiConfig;
use crate::error::{BridgeError, BridgeResult, ErrorKind};
use crate::ledger::SourceLedger;
use crate::orchestrator::{Orchestrator, TransferRequest};
use crate::state::StateManager;
use crate::types::IntentId;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub state_manager: Arc<StateManager>,
    pub ledger: Arc<SourceLedger>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/intents", post(create_intent))
        .route("/intents/:id", get(get_intent))
        .route("/intents/:id/refund", post(refund_intent))
        .route("/orphans", get(get_orphans))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods([Method::GET, Method::POST])
                        .allow_origin(Any),
                ),
        )
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> BridgeResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Config(format!("cannot bind API server to {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| BridgeError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - database and source ledger
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.state_manager.health_check().await.is_ok();
    let source_block = state.ledger.block_number().await;

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: database,
            database,
            source_chain: state.ledger.chain().to_string(),
            source_block,
        }),
    )
}

async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.state_manager.get_stats().await?;
    Ok(Json(stats))
}

async fn create_intent(
    State(state): State<AppState>,
    Json(body): Json<CreateIntentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let amount = body.amount.parse()?;
    let request = TransferRequest {
        source_chain: body.source_chain,
        target_chain: body.target_chain,
        token: body.token,
        amount,
        receiver: body.receiver,
        sender: None,
    };

    let intent_id = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(CreateIntentResponse { intent_id })))
}

async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = IntentId::from(id);
    match state.orchestrator.get_transfer_view(&id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(BridgeError::IntentNotFound(id).into()),
    }
}

async fn get_orphans(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let orphans = state.orchestrator.orphaned_locks().await?;
    Ok(Json(orphans))
}

async fn refund_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.refund(&IntentId::from(id)).await?;
    Ok(Json(record))
}

// Request and response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIntentBody {
    source_chain: String,
    target_chain: String,
    token: String,
    amount: AmountInput,
    receiver: String,
}

/// Amounts arrive as decimal strings or, when small enough, JSON numbers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountInput {
    Number(u64),
    Text(String),
}

impl AmountInput {
    fn parse(&self) -> BridgeResult<u128> {
        match self {
            AmountInput::Number(n) => Ok(u128::from(*n)),
            AmountInput::Text(s) => s.trim().parse().map_err(|_| {
                BridgeError::InvalidRequest(format!("amount {:?} is not a non-negative integer", s))
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateIntentResponse {
    intent_id: IntentId,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    source_chain: String,
    source_block: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: String,
}

/// A `BridgeError` rendered as an HTTP response
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Expired => StatusCode::GONE,
        ErrorKind::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ExternalFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: format!("{:?}", kind),
        };
        (status, Json(body)).into_response()
    }
}
