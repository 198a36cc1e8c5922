//! API handlers

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ApiError, AppState};
use crate::auth::Session;
use crate::config::RewardConfig;
use crate::error::LedgerError;
use crate::ledger::EntryPage;
use crate::models::{Account, AccountStatus, AppendOutcome, LedgerEntry, RewardEvent};

type ApiResult<T> = Result<T, ApiError>;

fn created_or_ok(outcome: AppendOutcome) -> (StatusCode, Json<AppendOutcome>) {
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(outcome))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let settlements: BTreeMap<String, i64> =
        state.ledger.settlement_counts()?.into_iter().collect();
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "settlements": settlements,
    })))
}

/// GET /api/rewards/rates
pub async fn reward_rates(State(state): State<AppState>, _session: Session) -> Json<RewardConfig> {
    Json(state.ledger.rules().rates().clone())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEventRequest {
    pub event: RewardEvent,
    #[serde(default)]
    pub reference_id: Option<String>,
    /// Credit another account (elevated privilege only)
    #[serde(default)]
    pub account_id: Option<String>,
}

/// POST /api/events - report a reward-earning event
pub async fn report_event(
    State(state): State<AppState>,
    session: Session,
    payload: Result<Json<ReportEventRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;

    match request.event {
        RewardEvent::Withdrawal { .. } => {
            return Err(LedgerError::InvalidInput(
                "withdrawals go through /api/withdrawals".to_string(),
            )
            .into())
        }
        RewardEvent::ManualAdjustment { .. } => {
            return Err(LedgerError::InvalidInput(
                "adjustments go through /api/admin/adjustments".to_string(),
            )
            .into())
        }
        _ => {}
    }

    let account_id = match request.account_id {
        Some(id) if id != session.account_id => {
            session.require_admin()?;
            id
        }
        _ => session.account_id.clone(),
    };

    let outcome = state.ledger.append_entry(
        &account_id,
        request.event,
        request.reference_id.as_deref(),
    )?;
    Ok(created_or_ok(outcome))
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalRequest {
    pub amount: i64,
}

/// POST /api/withdrawals - debit now, settle asynchronously
pub async fn request_withdrawal(
    State(state): State<AppState>,
    session: Session,
    payload: Result<Json<WithdrawalRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let outcome = state.ledger.append_entry(
        &session.account_id,
        RewardEvent::Withdrawal {
            amount: request.amount,
        },
        None,
    )?;
    Ok((StatusCode::ACCEPTED, Json(outcome.entry)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub account_id: String,
    pub balance: i64,
}

/// GET /api/balance
pub async fn balance(
    State(state): State<AppState>,
    session: Session,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.ledger.get_balance(&session.account_id)?;
    Ok(Json(BalanceResponse {
        account_id: session.account_id,
        balance,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListEntriesQuery {
    #[serde(default)]
    pub before: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

/// GET /api/entries?before=&limit=
pub async fn list_entries(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<ListEntriesQuery>,
) -> ApiResult<Json<EntryPage>> {
    let page = state
        .ledger
        .list_entries(&session.account_id, query.before, query.limit)?;
    Ok(Json(page))
}

/// GET /api/entries/:entry_id - re-query an entry and its settlement
pub async fn get_entry(
    State(state): State<AppState>,
    session: Session,
    Path(entry_id): Path<String>,
) -> ApiResult<Json<LedgerEntry>> {
    let entry = state
        .ledger
        .get_entry(&entry_id)?
        .filter(|e| e.account_id == session.account_id || session.is_admin())
        .ok_or_else(|| LedgerError::NotFound(format!("entry {}", entry_id)))?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub address: Option<String>,
}

/// PUT /api/account/address
pub async fn set_address(
    State(state): State<AppState>,
    session: Session,
    payload: Result<Json<AddressRequest>, JsonRejection>,
) -> ApiResult<Json<Account>> {
    let Json(request) = payload?;
    let account = state
        .ledger
        .set_external_address(&session.account_id, request.address.as_deref())?;
    Ok(Json(account))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRequest {
    pub account_id: String,
    pub delta: i64,
    pub reason: String,
    #[serde(default)]
    pub reference_id: Option<String>,
}

/// POST /api/admin/adjustments
pub async fn manual_adjustment(
    State(state): State<AppState>,
    session: Session,
    payload: Result<Json<AdjustmentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    session.require_admin()?;
    let Json(request) = payload?;

    tracing::info!(
        admin = %session.account_id,
        account_id = %request.account_id,
        delta = request.delta,
        "Manual adjustment requested"
    );
    let outcome = state.ledger.append_entry(
        &request.account_id,
        RewardEvent::ManualAdjustment {
            delta: request.delta,
            reason: request.reason,
        },
        request.reference_id.as_deref(),
    )?;
    Ok(created_or_ok(outcome))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: AccountStatus,
}

/// PUT /api/admin/accounts/:account_id/status
pub async fn set_status(
    State(state): State<AppState>,
    session: Session,
    Path(account_id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<Json<Account>> {
    session.require_admin()?;
    let Json(request) = payload?;
    let account = state.ledger.set_account_status(&account_id, request.status)?;
    Ok(Json(account))
}
