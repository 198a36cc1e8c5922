//! HTTP API for the marketplace front end
//!
//! Every `/api` route requires a bearer token; `/api/admin` routes also
//! require elevated privilege.

pub mod routes;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{Session, SessionVerifier};
use crate::error::LedgerError;
use crate::ledger::Ledger;

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub verifier: Arc<dyn SessionVerifier>,
}

impl AppState {
    pub fn new(ledger: Arc<Ledger>, verifier: Arc<dyn SessionVerifier>) -> Self {
        Self { ledger, verifier }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/rewards/rates", get(routes::reward_rates))
        .route("/api/events", post(routes::report_event))
        .route("/api/withdrawals", post(routes::request_withdrawal))
        .route("/api/balance", get(routes::balance))
        .route("/api/entries", get(routes::list_entries))
        .route("/api/entries/:entry_id", get(routes::get_entry))
        .route("/api/account/address", put(routes::set_address))
        // Elevated privilege
        .route("/api/admin/adjustments", post(routes::manual_adjustment))
        .route("/api/admin/accounts/:account_id/status", put(routes::set_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `LedgerError` rendered as `{"error": .., "code": ..}`
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LedgerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InsufficientBalance { .. }
            | LedgerError::InvalidTransition { .. }
            | LedgerError::LeaseLost(_) => StatusCode::CONFLICT,
            LedgerError::TransientStorage(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Storage(_) | LedgerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(LedgerError::InvalidInput(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| LedgerError::Unauthorized("missing bearer token".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LedgerError::Unauthorized("malformed authorization header".to_string()))?;

        Ok(state.verifier.verify(token)?)
    }
}
