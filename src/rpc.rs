//! JSON HTTP RPC for submitting transactions and querying node state.
//!
//! Read paths take read-only handles; transaction submission goes through
//! the mempool's own admission checks and is then broadcast to peers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::consensus::Engine;
use crate::crypto::Address;
use crate::governance;
use crate::mempool::Mempool;
use crate::p2p::{Message, P2pHandle};
use crate::state::StateEngine;

/// Shared RPC state.
#[derive(Clone)]
pub struct RpcState {
    pub chain_id: String,
    pub state: Arc<StateEngine>,
    pub mempool: Arc<Mempool>,
    pub engine: Arc<Mutex<Engine>>,
    pub governance: Arc<governance::Manager>,
    pub p2p: Option<P2pHandle>,
}

/// Build the RPC router.
pub fn router(rpc_state: RpcState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/account/{address}", get(get_account))
        .route("/validators", get(get_validators))
        .route("/mempool", get(get_mempool))
        .route("/governance/proposals", get(get_proposals))
        .route("/tx", post(submit_tx))
        .with_state(rpc_state)
}

/// Start the RPC server.
pub async fn serve(
    addr: SocketAddr,
    rpc_state: RpcState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(rpc_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("RPC server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusResponse {
    chain_id: String,
    height: u64,
    round: u64,
    last_finalized: String,
    validator_count: usize,
    total_power: u64,
    mempool_size: usize,
    peer_count: usize,
}

async fn get_status(State(state): State<RpcState>) -> Json<StatusResponse> {
    let (height, round, last_finalized, validator_count, total_power) = {
        let engine = state.engine.lock();
        let set = engine.validator_set();
        (
            engine.height(),
            engine.round(),
            hex::encode(engine.last_finalized()),
            set.len(),
            set.total_power,
        )
    };
    Json(StatusResponse {
        chain_id: state.chain_id.clone(),
        height,
        round,
        last_finalized,
        validator_count,
        total_power,
        mempool_size: state.mempool.len(),
        peer_count: state.p2p.as_ref().map(|p| p.peer_count()).unwrap_or(0),
    })
}

#[derive(Serialize)]
struct AccountResponse {
    address: String,
    balance: u64,
    nonce: u64,
    stake: u64,
    rc: u64,
    rc_max: u64,
    last_rc_time: i64,
    pubkey: String,
    has_code: bool,
}

async fn get_account(
    State(state): State<RpcState>,
    Path(address): Path<String>,
) -> Result<Json<AccountResponse>, (StatusCode, String)> {
    let addr = Address::parse(&address)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid address: {}", e)))?;
    let acct = state
        .state
        .get_account(&addr)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(AccountResponse {
        address: addr.to_string(),
        balance: acct.balance,
        nonce: acct.nonce,
        stake: acct.stake,
        rc: acct.rc,
        rc_max: acct.rc_max,
        last_rc_time: acct.last_rc_time,
        pubkey: hex::encode(&acct.pubkey),
        has_code: !acct.code.is_empty(),
    }))
}

#[derive(Serialize)]
struct ValidatorResponse {
    operator_address: String,
    consensus_pubkey: String,
    stake: u64,
    power: u64,
    commission: u16,
    index: u32,
    jailed_until_epoch: u64,
}

async fn get_validators(State(state): State<RpcState>) -> Json<Vec<ValidatorResponse>> {
    let engine = state.engine.lock();
    let validators = engine
        .validator_set()
        .validators
        .iter()
        .map(|v| ValidatorResponse {
            operator_address: v.operator_address.to_string(),
            consensus_pubkey: hex::encode(&v.consensus_pubkey),
            stake: v.stake,
            power: v.power,
            commission: v.commission,
            index: v.index,
            jailed_until_epoch: v.jailed_until_epoch,
        })
        .collect();
    Json(validators)
}

#[derive(Serialize)]
struct MempoolResponse {
    pending: usize,
}

async fn get_mempool(State(state): State<RpcState>) -> Json<MempoolResponse> {
    Json(MempoolResponse {
        pending: state.mempool.len(),
    })
}

async fn get_proposals(State(state): State<RpcState>) -> Json<Vec<governance::Proposal>> {
    Json(state.governance.proposals())
}

#[derive(Deserialize)]
struct SubmitTxRequest {
    /// Hex-encoded canonical transaction bytes.
    tx_hex: String,
}

#[derive(Serialize)]
struct SubmitTxResponse {
    tx_hash: String,
}

async fn submit_tx(
    State(state): State<RpcState>,
    Json(req): Json<SubmitTxRequest>,
) -> Result<Json<SubmitTxResponse>, (StatusCode, String)> {
    let tx_bytes = hex::decode(&req.tx_hex)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid hex: {}", e)))?;
    let tx = codec::decode_transaction(&tx_bytes).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid transaction: {}", e),
        )
    })?;
    let tx_hash = tx.hash();

    state
        .mempool
        .add_tx(tx)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("rejected: {}", e)))?;

    if let Some(p2p) = &state.p2p {
        p2p.broadcast(Message::NewTransaction(tx_bytes));
    }

    Ok(Json(SubmitTxResponse {
        tx_hash: hex::encode(tx_hash),
    }))
}
