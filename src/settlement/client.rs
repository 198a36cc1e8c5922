//! Transfer gateway client
//!
//! The gateway moves ARB tokens from the treasury to a participant wallet.
//! Its contract, as relied on by the reconciler:
//!
//! - `POST /transfers` with an idempotency key. Replaying a key returns the
//!   original transfer rather than sending a second one.
//! - 429 and 5xx responses mean the request was not executed.
//! - Any other 4xx is a permanent rejection (bad address, frozen treasury).
//! - `GET /transfers/{ref}` reports `pending`, `confirmed` or `failed`.
//! - `GET /transfers?idempotencyKey=..` finds a transfer by key, 404 if the
//!   gateway never saw it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::TransferConfig;
use crate::error::LedgerError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The gateway did not execute the request; safe to retry
    #[error("Transient transfer failure: {0}")]
    Transient(String),

    /// The gateway permanently rejected the transfer
    #[error("Transfer rejected: {0}")]
    Terminal(String),

    /// No answer in time; the transfer may or may not have happened
    #[error("Transfer outcome unknown: timed out")]
    Timeout,
}

/// On-chain state of an issued transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Confirmed,
    Failed(String),
}

#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Issue a transfer of `amount` points. Returns the gateway's reference
    /// (transaction signature) as soon as it is known, before confirmation.
    async fn transfer(
        &self,
        destination: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<String, TransferError>;

    async fn transfer_status(&self, external_tx_ref: &str) -> Result<TransferStatus, TransferError>;

    /// Reference of the transfer issued under `idempotency_key`, if any
    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>, TransferError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest<'a> {
    destination: &'a str,
    /// Token base units, as a string to survive JSON number precision
    amount: String,
    idempotency_key: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferResponse {
    tx_ref: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// Convert points into token base units (`points * 10^decimals`)
pub fn to_base_units(points: i64, decimals: u32) -> Result<u128, TransferError> {
    if points <= 0 {
        return Err(TransferError::Terminal(format!(
            "transfer amount must be positive, got {}",
            points
        )));
    }
    10u128
        .checked_pow(decimals)
        .and_then(|scale| (points as u128).checked_mul(scale))
        .ok_or_else(|| TransferError::Terminal("amount overflows token base units".to_string()))
}

/// Transfer gateway over HTTP (reqwest, rustls)
pub struct HttpTransferClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    token_decimals: u32,
}

impl HttpTransferClient {
    pub fn new(config: &TransferConfig, timeout: Duration) -> Result<Self, LedgerError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| LedgerError::Config("transfer.endpoint is not set".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Config(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            token_decimals: config.token_decimals,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

/// Map a send failure. Only a failed connect proves nothing was sent.
fn request_error(e: reqwest::Error) -> TransferError {
    if e.is_connect() {
        TransferError::Transient(e.to_string())
    } else {
        TransferError::Timeout
    }
}

fn status_error(status: StatusCode, body: String) -> TransferError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        TransferError::Transient(format!("HTTP {}: {}", status, body))
    } else {
        TransferError::Terminal(format!("HTTP {}: {}", status, body))
    }
}

#[async_trait]
impl TransferClient for HttpTransferClient {
    async fn transfer(
        &self,
        destination: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<String, TransferError> {
        let base_units = to_base_units(amount, self.token_decimals)?;
        let body = TransferRequest {
            destination,
            amount: base_units.to_string(),
            idempotency_key,
        };

        debug!(idempotency_key, destination, amount, "Issuing transfer");
        let response = self
            .authorized(self.client.post(format!("{}/transfers", self.endpoint)))
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        let parsed: TransferResponse = response.json().await.map_err(|_| TransferError::Timeout)?;
        Ok(parsed.tx_ref)
    }

    async fn transfer_status(&self, external_tx_ref: &str) -> Result<TransferStatus, TransferError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/transfers/{}", self.endpoint, external_tx_ref)),
            )
            .send()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransferError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Transient(format!("bad status response: {}", e)))?;

        match parsed.status.as_str() {
            "pending" => Ok(TransferStatus::Pending),
            "confirmed" => Ok(TransferStatus::Confirmed),
            "failed" => Ok(TransferStatus::Failed(
                parsed.error.unwrap_or_else(|| "transfer failed on chain".to_string()),
            )),
            other => Err(TransferError::Transient(format!(
                "unknown transfer status '{}'",
                other
            ))),
        }
    }

    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>, TransferError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/transfers", self.endpoint))
                    .query(&[("idempotencyKey", idempotency_key)]),
            )
            .send()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransferError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let parsed: TransferResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Transient(format!("bad lookup response: {}", e)))?;
        Ok(Some(parsed.tx_ref))
    }
}
