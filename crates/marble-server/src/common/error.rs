use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use marble_core::marble::{EntryError, MarbleId};
use marble_core::round::RoundPhase;
use serde::Serialize;

use crate::service::simulation::SimulationError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("Marble {0} not found")]
    MarbleNotFound(MarbleId),

    #[error("No round has finished yet")]
    NoResults,

    #[error("Cannot {0} while the round is {1}")]
    WrongPhase(&'static str, RoundPhase),
}

impl From<EntryError> for ApiError {
    fn from(err: EntryError) -> Self {
        ApiError::Simulation(SimulationError::Entry(err))
    }
}

fn entry_code(err: &EntryError) -> StatusCode {
    match err {
        EntryError::EmptyName
        | EntryError::NameTooLong(_)
        | EntryError::InvalidName
        | EntryError::InvalidColor(_) => StatusCode::BAD_REQUEST,
        EntryError::OwnerLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        EntryError::NotAccepting(_) => StatusCode::CONFLICT,
    }
}

impl ApiError {
    pub fn to_code(&self) -> StatusCode {
        match self {
            ApiError::Simulation(SimulationError::Entry(err)) => entry_code(err),
            ApiError::Simulation(SimulationError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::MarbleNotFound(_) | ApiError::NoResults => StatusCode::NOT_FOUND,
            ApiError::WrongPhase(..) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.to_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            code,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
