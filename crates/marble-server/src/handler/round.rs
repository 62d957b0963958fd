//! HTTP endpoints for entries, moderation and round state.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use marble_core::marble::{EntryRequest, MarbleId, RosterEntry};
use marble_core::protocol::{PROTOCOL_VERSION, RouteEntry, route_table};
use marble_core::round::{RoundResults, RoundStatus};
use serde::Serialize;

use crate::common::error::ApiError;
use crate::common::state::AppState;
use crate::service::replication::ClientDiagnostics;

#[derive(Debug, Serialize)]
pub struct EntryResponse {
    pub id: MarbleId,
}

pub async fn create_entry(
    State(state): State<AppState>,
    Json(request): Json<EntryRequest>,
) -> Result<(StatusCode, Json<EntryResponse>), ApiError> {
    let id = state.simulation.enter(request).await?;
    tracing::info!(marble_id = id, "entry accepted");
    Ok((StatusCode::CREATED, Json(EntryResponse { id })))
}

pub async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<MarbleId>,
) -> Result<StatusCode, ApiError> {
    if state.simulation.remove(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::MarbleNotFound(id))
    }
}

pub async fn force_start(State(state): State<AppState>) -> Result<Json<RoundStatus>, ApiError> {
    if !state.simulation.force_start().await? {
        let phase = state.simulation.status().phase;
        return Err(ApiError::WrongPhase("start the race", phase));
    }
    Ok(Json(state.simulation.status()))
}

pub async fn force_end(State(state): State<AppState>) -> Result<Json<RoundStatus>, ApiError> {
    if !state.simulation.force_end().await? {
        let phase = state.simulation.status().phase;
        return Err(ApiError::WrongPhase("end the round", phase));
    }
    Ok(Json(state.simulation.status()))
}

pub async fn round_status(State(state): State<AppState>) -> Json<RoundStatus> {
    Json(state.simulation.status())
}

pub async fn results(State(state): State<AppState>) -> Result<Json<RoundResults>, ApiError> {
    state
        .simulation
        .last_results()
        .map(Json)
        .ok_or(ApiError::NoResults)
}

pub async fn roster(State(state): State<AppState>) -> Json<Vec<RosterEntry>> {
    Json(state.simulation.roster())
}

#[derive(Debug, Serialize)]
pub struct ProtocolResponse {
    pub version: u16,
    pub routes: Vec<RouteEntry>,
}

pub async fn protocol() -> Json<ProtocolResponse> {
    Json(ProtocolResponse {
        version: PROTOCOL_VERSION,
        routes: route_table(),
    })
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub frame: u64,
    /// Hex digest of every body state at `frame`.
    pub state_hash: String,
    pub round: u64,
    pub clients: Vec<ClientDiagnostics>,
}

pub async fn diagnostics(State(state): State<AppState>) -> Json<DiagnosticsResponse> {
    let (frame, hash) = state.simulation.world_hash();
    Json(DiagnosticsResponse {
        frame,
        state_hash: format!("{hash:016x}"),
        round: state.simulation.status().round,
        clients: state.clients.diagnostics(),
    })
}
