//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use arb_ledger::config::SettlementConfig;
use arb_ledger::settlement::{TransferClient, TransferError, TransferStatus};
use arb_ledger::{Ledger, RewardEngine, RewardEvent};
use async_trait::async_trait;

pub const ADDRESS: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

pub fn ledger() -> Arc<Ledger> {
    Arc::new(Ledger::open_in_memory(RewardEngine::default()).unwrap())
}

/// Account with a registered address and exactly `points` balance
pub fn funded_account(ledger: &Ledger, account_id: &str, points: i64) {
    ledger
        .append_entry(account_id, RewardEvent::Signup, None)
        .unwrap();
    if points != 100 {
        ledger
            .append_entry(
                account_id,
                RewardEvent::ManualAdjustment {
                    delta: points - 100,
                    reason: "test funding".to_string(),
                },
                None,
            )
            .unwrap();
    }
    ledger.set_external_address(account_id, Some(ADDRESS)).unwrap();
    assert_eq!(ledger.get_balance(account_id).unwrap(), points);
}

pub fn settlement_config() -> SettlementConfig {
    SettlementConfig {
        max_attempts: 3,
        base_backoff_ms: 1_000,
        max_backoff_ms: 10_000,
        lease_secs: 60,
        transfer_timeout_secs: 5,
        confirmation_poll_ms: 500,
        ..SettlementConfig::default()
    }
}

/// Milliseconds comfortably after any record appended so far
pub fn soon() -> i64 {
    chrono::Utc::now().timestamp_millis() + 1_000
}

/// Scripted response to a `transfer` call
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Executes and returns the reference
    Ok,
    Transient,
    Terminal,
    /// Executes, but the caller only sees a timeout
    TimeoutAfterExecuting,
    /// Never reaches the gateway; the caller sees a timeout
    TimeoutLost,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<Scripted>,
    /// Status reported for every reference unless overridden
    default_status: Option<TransferStatus>,
    statuses: HashMap<String, TransferStatus>,
    executed_by_key: HashMap<String, String>,
    transfer_keys: Vec<String>,
    executed: Vec<(String, i64)>,
    lookups: usize,
}

/// In-memory transfer gateway honouring idempotency keys
#[derive(Default)]
pub struct MockTransferClient {
    state: Mutex<MockState>,
}

impl MockTransferClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, responses: impl IntoIterator<Item = Scripted>) {
        self.state.lock().unwrap().script.extend(responses);
    }

    pub fn set_default_status(&self, status: TransferStatus) {
        self.state.lock().unwrap().default_status = Some(status);
    }

    pub fn set_status(&self, tx_ref: &str, status: TransferStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(tx_ref.to_string(), status);
    }

    /// Idempotency keys of every `transfer` call received
    pub fn transfer_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().transfer_keys.clone()
    }

    /// Transfers that actually moved tokens: (destination, amount)
    pub fn executed(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().unwrap().lookups
    }
}

#[async_trait]
impl TransferClient for MockTransferClient {
    async fn transfer(
        &self,
        destination: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<String, TransferError> {
        let mut state = self.state.lock().unwrap();
        state.transfer_keys.push(idempotency_key.to_string());

        if let Some(existing) = state.executed_by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }

        let response = state.script.pop_front().unwrap_or(Scripted::Ok);
        let execute = |state: &mut MockState| {
            let tx_ref = format!("sig-{}", state.executed.len() + 1);
            state.executed.push((destination.to_string(), amount));
            state
                .executed_by_key
                .insert(idempotency_key.to_string(), tx_ref.clone());
            tx_ref
        };

        match response {
            Scripted::Ok => Ok(execute(&mut *state)),
            Scripted::Transient => Err(TransferError::Transient("rate limited".to_string())),
            Scripted::Terminal => Err(TransferError::Terminal("invalid destination".to_string())),
            Scripted::TimeoutAfterExecuting => {
                execute(&mut *state);
                Err(TransferError::Timeout)
            }
            Scripted::TimeoutLost => Err(TransferError::Timeout),
        }
    }

    async fn transfer_status(&self, external_tx_ref: &str) -> Result<TransferStatus, TransferError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .statuses
            .get(external_tx_ref)
            .cloned()
            .or_else(|| state.default_status.clone())
            .unwrap_or(TransferStatus::Confirmed))
    }

    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>, TransferError> {
        let mut state = self.state.lock().unwrap();
        state.lookups += 1;
        Ok(state.executed_by_key.get(idempotency_key).cloned())
    }
}
