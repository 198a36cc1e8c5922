//! Settlement of withdrawals into external token transfers
//!
//! - `client` - the transfer gateway seam and its HTTP implementation
//! - `reconciler` - claim/lease worker driving records to a terminal state
//!
//! Retry timing is stored on the record (`next_attempt_at`), never held in
//! an in-process timer, so a restart resumes where it left off.

pub mod client;
pub mod reconciler;

use std::time::Duration;

pub use client::{HttpTransferClient, TransferClient, TransferError, TransferStatus};
pub use reconciler::{ReconcileReport, Reconciler};

/// Delay before retrying after `attempts` transfers: `base * 2^(attempts-1)`,
/// capped at `max`.
pub fn backoff_delay(attempts: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let delay = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(max_ms))
}

/// Idempotency key sent with the transfer for a given attempt
pub fn idempotency_key(entry_id: &str, attempt: u32) -> String {
    format!("{}:{}", entry_id, attempt)
}
