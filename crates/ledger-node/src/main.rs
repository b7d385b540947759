use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ledger_core::constants::DEFAULT_DIFFICULTY;
use ledger_core::ledger::{DonationRequest, Ledger};
use ledger_core::validate::IntegrityViolation;
use ledger_core::{BlockDetail, BlockPage, ChainInfo, ChainTransaction, LedgerError};
use ledger_storage::SledStore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use uuid::Uuid;

mod constants;
use constants::{DEFAULT_PAGE_LIMIT, MAX_PENDING_APPENDS};

#[derive(Parser, Debug)]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Data directory for sled
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Leading zero hex chars required of every mined block hash
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: u32,
}

#[derive(Clone)]
struct AppState {
    ledger: Arc<Ledger<SledStore>>,
    append_slots: Arc<Semaphore>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Serialize)]
struct DonateResponse {
    block_height: u64,
    block_hash: String,
    tx_id: Uuid,
    tx_hash: String,
    chain_height: u64,
    total_txs: u64,
    total_amount: Decimal,
}

#[derive(Deserialize)]
struct PageParams {
    #[serde(default)]
    offset: u64,
    #[serde(default = "default_page_limit")]
    limit: u64,
}

fn default_page_limit() -> u64 {
    DEFAULT_PAGE_LIMIT
}

#[derive(Serialize)]
struct TxStatusResponse {
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction: Option<ChainTransaction>,
}

#[derive(Serialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    violation: Option<IntegrityViolation>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

enum ApiError {
    Ledger(LedgerError),
    Busy,
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self::Ledger(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Ledger(err @ LedgerError::Validation { .. }) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            Self::Ledger(err @ LedgerError::Conflict { .. }) => {
                (StatusCode::CONFLICT, err.to_string())
            }
            Self::Ledger(LedgerError::Storage(err)) => {
                error!(%err, "storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal storage failure".to_string(),
                )
            }
            Self::Busy => (
                StatusCode::SERVICE_UNAVAILABLE,
                "append queue is full, retry later".to_string(),
            ),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(err) => {
                error!(%err, "internal failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal failure".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn chain_info(State(state): State<AppState>) -> Result<Json<ChainInfo>, ApiError> {
    Ok(Json(state.ledger.chain_info()?))
}

async fn donate(
    State(state): State<AppState>,
    Json(request): Json<DonationRequest>,
) -> Result<Json<DonateResponse>, ApiError> {
    let Ok(_slot) = state.append_slots.clone().try_acquire_owned() else {
        return Err(ApiError::Busy);
    };
    let ledger = Arc::clone(&state.ledger);
    // Mining is CPU-bound; keep it off the async runtime.
    let (block, tx) = tokio::task::spawn_blocking(move || ledger.append_donation(request))
        .await
        .map_err(|err| ApiError::Internal(err.into()))??;
    let info = state.ledger.chain_info()?;
    Ok(Json(DonateResponse {
        block_height: block.height,
        block_hash: block.hash,
        tx_id: tx.id,
        tx_hash: tx.tx_hash,
        chain_height: info.height,
        total_txs: info.total_tx_count,
        total_amount: info.total_amount,
    }))
}

async fn blocks(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<BlockPage>, ApiError> {
    Ok(Json(state.ledger.blocks_paged(params.offset, params.limit)?))
}

async fn block_detail(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> Result<Json<BlockDetail>, ApiError> {
    state
        .ledger
        .block_detail(height)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no block at height {height}")))
}

async fn tx_by_donate_id(
    State(state): State<AppState>,
    Path(donate_id): Path<u64>,
) -> Result<Json<TxStatusResponse>, ApiError> {
    let transaction = state.ledger.transaction_by_external_id(donate_id)?;
    Ok(Json(TxStatusResponse {
        found: transaction.is_some(),
        transaction,
    }))
}

async fn validate(State(state): State<AppState>) -> Result<Json<ValidateResponse>, ApiError> {
    let ledger = Arc::clone(&state.ledger);
    // The full ascending walk rehashes every block.
    let violation = tokio::task::spawn_blocking(move || ledger.validate())
        .await
        .map_err(|err| ApiError::Internal(err.into()))??;
    Ok(Json(ValidateResponse {
        valid: violation.is_none(),
        violation,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let store = Arc::new(SledStore::open(&args.data_dir)?);
    let ledger = Arc::new(Ledger::with_difficulty(store, args.difficulty));
    let genesis = ledger.ensure_genesis()?;
    info!(hash = %genesis.hash, "genesis block ready");

    let state = AppState {
        ledger,
        append_slots: Arc::new(Semaphore::new(MAX_PENDING_APPENDS)),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/chain/info", get(chain_info))
        .route("/api/v1/chain/tx/donate", post(donate))
        .route("/api/v1/chain/blocks", get(blocks))
        .route("/api/v1/chain/blocks/{height}", get(block_detail))
        .route("/api/v1/chain/tx/by-donate/{donate_id}", get(tx_by_donate_id))
        .route("/api/v1/chain/validate", post(validate))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = args.listen.parse()?;
    info!("ledger-node listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
