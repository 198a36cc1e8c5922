//! Settlement reconciler
//!
//! Each cycle claims a batch of due settlement records under a lease and
//! drives every claim one step:
//!
//! 1. A transfer issued on an earlier attempt whose reference was never
//!    recorded is looked up by its idempotency key first.
//! 2. A record with a reference only has its status checked; a second
//!    transfer is never issued while the first may still land.
//! 3. Otherwise the attempt is counted and a transfer issued under a hard
//!    timeout. A timeout leaves the outcome unknown for step 1 next cycle.
//!
//! No ledger lock is held across an external call; the lease alone keeps
//! other workers away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::client::{TransferClient, TransferError, TransferStatus};
use super::{backoff_delay, idempotency_key};
use crate::config::SettlementConfig;
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::models::{SettlementClaim, SettlementState, SettlementUpdate};

/// Wall clock for one claim cycle, anchored at the cycle's `now_ms` and
/// advanced by real elapsed time. Deadlines written late in a batch are
/// measured from when they are written, not from when the batch was claimed.
struct CycleClock {
    start_ms: i64,
    started: Instant,
}

impl CycleClock {
    fn new(start_ms: i64) -> Self {
        Self {
            start_ms,
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        self.start_ms + self.started.elapsed().as_millis() as i64
    }
}

/// What one claim cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub released: usize,
    pub failed: usize,
    pub lease_lost: usize,
    pub errors: usize,
}

pub struct Reconciler {
    ledger: Arc<Ledger>,
    client: Arc<dyn TransferClient>,
    config: SettlementConfig,
    worker_id: String,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        client: Arc<dyn TransferClient>,
        config: SettlementConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            client,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lease(&self) -> Duration {
        Duration::from_secs(self.config.lease_secs)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.transfer_timeout_secs)
    }

    /// Run one claim cycle at the current time
    pub async fn run_once(&self) -> Result<ReconcileReport, LedgerError> {
        self.run_once_at(Utc::now().timestamp_millis()).await
    }

    /// Run one claim cycle as if the clock read `now_ms`
    pub async fn run_once_at(&self, now_ms: i64) -> Result<ReconcileReport, LedgerError> {
        let claims = self.ledger.claim_settlements(
            &self.worker_id,
            now_ms,
            self.lease(),
            self.config.batch_size,
        )?;

        let mut report = ReconcileReport {
            claimed: claims.len(),
            ..ReconcileReport::default()
        };
        if claims.is_empty() {
            return Ok(report);
        }
        debug!(worker_id = %self.worker_id, claimed = claims.len(), "Claimed settlements");

        let clock = CycleClock::new(now_ms);
        for mut claim in claims {
            let result = match self.settle(&mut claim, &clock).await {
                Ok(update) => self.ledger.mark_settlement(&claim, update),
                Err(e) => Err(e),
            };

            match result {
                Ok(record) => match record.state {
                    SettlementState::Succeeded => report.succeeded += 1,
                    SettlementState::FailedRetryable => report.retried += 1,
                    SettlementState::Pending => report.released += 1,
                    SettlementState::FailedTerminal => report.failed += 1,
                    SettlementState::InFlight => {}
                },
                Err(LedgerError::LeaseLost(entry_id)) => {
                    warn!(
                        worker_id = %self.worker_id,
                        entry_id = %entry_id,
                        "Lease lost, abandoning settlement"
                    );
                    report.lease_lost += 1;
                }
                Err(e) => {
                    // The lease runs out and another cycle picks the record up
                    error!(
                        worker_id = %self.worker_id,
                        entry_id = %claim.entry_id(),
                        error = %e,
                        "Settlement step failed"
                    );
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Decide the write-back for one claim, performing at most one transfer
    async fn settle(
        &self,
        claim: &mut SettlementClaim,
        clock: &CycleClock,
    ) -> Result<SettlementUpdate, LedgerError> {
        let entry_id = claim.entry_id().to_string();

        if claim.record.external_tx_ref.is_none() && claim.record.transfer_issued {
            let key = idempotency_key(&entry_id, claim.record.attempts);
            match timeout(self.call_timeout(), self.client.find_transfer(&key)).await {
                Ok(Ok(Some(tx_ref))) => {
                    info!(entry_id = %entry_id, tx_ref = %tx_ref, "Recovered transfer by idempotency key");
                    self.ledger.record_external_ref(claim, &tx_ref)?;
                }
                Ok(Ok(None)) => {
                    debug!(entry_id = %entry_id, key = %key, "Gateway has no transfer for key");
                    self.ledger.clear_transfer_issued(claim)?;
                }
                Ok(Err(e)) => {
                    return Ok(self.release(clock.now_ms(), format!("transfer lookup failed: {}", e)))
                }
                Err(_) => {
                    return Ok(self.release(clock.now_ms(), "transfer lookup timed out".to_string()))
                }
            }
        }

        if let Some(tx_ref) = claim.record.external_tx_ref.clone() {
            return Ok(self.check_status(claim, &tx_ref, clock).await);
        }

        if claim.record.attempts >= self.config.max_attempts {
            return Ok(SettlementUpdate::FailedTerminal {
                error: format!(
                    "gave up after {} attempts: {}",
                    claim.record.attempts,
                    claim.record.last_error.as_deref().unwrap_or("no error recorded")
                ),
            });
        }

        self.ledger.renew_lease(claim, clock.now_ms(), self.lease())?;
        let deadline = clock.now_ms() + self.call_timeout().as_millis() as i64;
        if claim.record.lease_expires_at.unwrap_or(0) <= deadline {
            warn!(
                entry_id = %entry_id,
                lease_expires_at = claim.record.lease_expires_at,
                "Lease would expire before the transfer times out, not issuing"
            );
            return Ok(self.release(
                clock.now_ms(),
                "lease shorter than transfer timeout".to_string(),
            ));
        }
        let attempt = self.ledger.record_transfer_issued(claim)?;
        let key = idempotency_key(&entry_id, attempt);

        info!(
            entry_id = %entry_id,
            attempt,
            amount = claim.record.amount,
            "Issuing transfer"
        );
        let result = timeout(
            self.call_timeout(),
            self.client
                .transfer(&claim.record.destination, claim.record.amount, &key),
        )
        .await;

        match result {
            Ok(Ok(tx_ref)) => {
                self.ledger.record_external_ref(claim, &tx_ref)?;
                Ok(self.check_status(claim, &tx_ref, clock).await)
            }
            Ok(Err(TransferError::Terminal(reason))) => {
                Ok(SettlementUpdate::FailedTerminal { error: reason })
            }
            Ok(Err(TransferError::Transient(reason))) => {
                Ok(self.retry(claim, reason, true, clock.now_ms()))
            }
            Ok(Err(TransferError::Timeout)) | Err(_) => {
                warn!(entry_id = %entry_id, attempt, "Transfer timed out, outcome unknown");
                Ok(SettlementUpdate::Retry {
                    error: "transfer timed out; outcome unknown".to_string(),
                    next_attempt_at: clock.now_ms() + self.backoff_ms(attempt),
                    clear_transfer: false,
                })
            }
        }
    }

    async fn check_status(
        &self,
        claim: &SettlementClaim,
        tx_ref: &str,
        clock: &CycleClock,
    ) -> SettlementUpdate {
        let status = timeout(self.call_timeout(), self.client.transfer_status(tx_ref)).await;
        let now_ms = clock.now_ms();
        match status {
            Ok(Ok(TransferStatus::Confirmed)) => SettlementUpdate::Succeeded {
                external_tx_ref: tx_ref.to_string(),
            },
            Ok(Ok(TransferStatus::Pending)) => SettlementUpdate::Release {
                note: None,
                next_attempt_at: now_ms + self.config.confirmation_poll_ms as i64,
            },
            Ok(Ok(TransferStatus::Failed(reason))) => {
                warn!(entry_id = %claim.entry_id(), tx_ref, reason = %reason, "Transfer failed on chain");
                self.retry(claim, reason, true, now_ms)
            }
            Ok(Err(e)) => self.release(now_ms, format!("status check failed: {}", e)),
            Err(_) => self.release(now_ms, "status check timed out".to_string()),
        }
    }

    /// Retry later, or give up when the attempt budget is spent
    fn retry(
        &self,
        claim: &SettlementClaim,
        error: String,
        clear_transfer: bool,
        now_ms: i64,
    ) -> SettlementUpdate {
        if claim.record.attempts >= self.config.max_attempts {
            SettlementUpdate::FailedTerminal {
                error: format!("gave up after {} attempts: {}", claim.record.attempts, error),
            }
        } else {
            SettlementUpdate::Retry {
                error,
                next_attempt_at: now_ms + self.backoff_ms(claim.record.attempts),
                clear_transfer,
            }
        }
    }

    fn release(&self, now_ms: i64, note: String) -> SettlementUpdate {
        SettlementUpdate::Release {
            note: Some(note),
            next_attempt_at: now_ms + self.config.confirmation_poll_ms as i64,
        }
    }

    fn backoff_ms(&self, attempts: u32) -> i64 {
        backoff_delay(attempts, self.config.base_backoff_ms, self.config.max_backoff_ms).as_millis()
            as i64
    }

    /// Run claim cycles until `shutdown` flips to true. A full batch is
    /// followed immediately by another cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease_secs,
            "Reconciler started"
        );
        let idle = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(report) if report.claimed >= self.config.batch_size => Duration::ZERO,
                Ok(report) => {
                    if report.claimed > 0 {
                        debug!(worker_id = %self.worker_id, ?report, "Reconcile cycle complete");
                    }
                    idle
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Reconcile cycle failed");
                    idle
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "Reconciler stopped");
    }
}
