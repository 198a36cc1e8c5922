//! Ledger data model
//!
//! Accounts own an append-only sequence of entries. Withdrawal entries carry
//! a settlement record tracking the external token transfer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LedgerError;

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Signup,
    Upload,
    Review,
    Verification,
    Withdrawal,
    ManualAdjustment,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Signup => "signup",
            EntryKind::Upload => "upload",
            EntryKind::Review => "review",
            EntryKind::Verification => "verification",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::ManualAdjustment => "manual_adjustment",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signup" => Ok(EntryKind::Signup),
            "upload" => Ok(EntryKind::Upload),
            "review" => Ok(EntryKind::Review),
            "verification" => Ok(EntryKind::Verification),
            "withdrawal" => Ok(EntryKind::Withdrawal),
            "manual_adjustment" => Ok(EntryKind::ManualAdjustment),
            other => Err(LedgerError::Storage(format!("Unknown entry kind: {}", other))),
        }
    }
}

/// Soft account state. Accounts are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    /// May still receive credits and reversals, but cannot withdraw
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            other => Err(LedgerError::InvalidInput(format!(
                "Unknown account status: {}",
                other
            ))),
        }
    }
}

/// A participant with a points balance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: String,
    /// Materialized fold of every entry delta for this account
    pub balance: i64,
    pub external_address: Option<String>,
    pub status: AccountStatus,
    /// Sequence number of the most recent entry (0 when none)
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ordered sub-reason -> sub-amount mapping. Serializes as a JSON object
/// with keys in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Breakdown(Vec<(String, i64)>);

impl Breakdown {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn single(key: impl Into<String>, amount: i64) -> Self {
        let mut b = Self::new();
        b.push(key, amount);
        b
    }

    pub fn push(&mut self, key: impl Into<String>, amount: i64) {
        self.0.push((key.into(), amount));
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all sub-amounts, `None` on overflow
    pub fn total(&self) -> Option<i64> {
        self.0.iter().try_fold(0i64, |acc, (_, v)| acc.checked_add(*v))
    }
}

impl Serialize for Breakdown {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Breakdown {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BreakdownVisitor;

        impl<'de> Visitor<'de> for BreakdownVisitor {
            type Value = Breakdown;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of reason to signed amount")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Breakdown, M::Error> {
                let mut items = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<String, i64>()? {
                    items.push((k, v));
                }
                Ok(Breakdown(items))
            }
        }

        deserializer.deserialize_map(BreakdownVisitor)
    }
}

/// Lifecycle of the external transfer behind a withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Pending,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Pending => "pending",
            SettlementState::InFlight => "in_flight",
            SettlementState::Succeeded => "succeeded",
            SettlementState::FailedRetryable => "failed_retryable",
            SettlementState::FailedTerminal => "failed_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementState::Succeeded | SettlementState::FailedTerminal)
    }

    /// Allowed edges of the settlement state machine. `InFlight -> Pending`
    /// releases a claim whose outcome is not yet known.
    pub fn can_transition_to(&self, next: SettlementState) -> bool {
        use SettlementState::*;
        match (self, next) {
            (Pending, InFlight) | (FailedRetryable, InFlight) => true,
            (InFlight, Succeeded)
            | (InFlight, FailedRetryable)
            | (InFlight, FailedTerminal)
            | (InFlight, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SettlementState::Pending),
            "in_flight" => Ok(SettlementState::InFlight),
            "succeeded" => Ok(SettlementState::Succeeded),
            "failed_retryable" => Ok(SettlementState::FailedRetryable),
            "failed_terminal" => Ok(SettlementState::FailedTerminal),
            other => Err(LedgerError::Storage(format!(
                "Unknown settlement state: {}",
                other
            ))),
        }
    }
}

/// External transfer tracking for a withdrawal entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub entry_id: String,
    /// Destination address snapshotted when the withdrawal was appended
    pub destination: String,
    /// Points to transfer (positive)
    pub amount: i64,
    pub state: SettlementState,
    pub attempts: u32,
    pub external_tx_ref: Option<String>,
    pub last_error: Option<String>,
    /// A transfer may have been issued whose result was never recorded
    pub transfer_issued: bool,
    /// Unix millis before which the record is not reclaimable
    pub next_attempt_at: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable, append-only record of a balance-affecting event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub entry_id: String,
    pub account_id: String,
    /// Per-account monotonic sequence, starting at 1
    pub seq: u64,
    pub kind: EntryKind,
    pub delta: i64,
    pub breakdown: Breakdown,
    pub reference_id: Option<String>,
    pub settlement: Option<SettlementRecord>,
    pub created_at: DateTime<Utc>,
}

/// A reported event with its validated, per-kind input shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum RewardEvent {
    Signup,
    Upload {
        #[serde(rename = "qualityScore")]
        quality_score: i64,
        #[serde(rename = "rowCount")]
        row_count: i64,
        #[serde(rename = "isFirstUpload", default)]
        is_first_upload: bool,
    },
    Review,
    Verification,
    Withdrawal {
        amount: i64,
    },
    ManualAdjustment {
        delta: i64,
        reason: String,
    },
}

impl RewardEvent {
    pub fn kind(&self) -> EntryKind {
        match self {
            RewardEvent::Signup => EntryKind::Signup,
            RewardEvent::Upload { .. } => EntryKind::Upload,
            RewardEvent::Review => EntryKind::Review,
            RewardEvent::Verification => EntryKind::Verification,
            RewardEvent::Withdrawal { .. } => EntryKind::Withdrawal,
            RewardEvent::ManualAdjustment { .. } => EntryKind::ManualAdjustment,
        }
    }
}

/// Result of `append_entry`. A duplicate is the previously persisted entry,
/// returned without applying a second delta.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendOutcome {
    pub entry: LedgerEntry,
    pub duplicate: bool,
}

/// An exclusive, time-bounded right to drive one settlement record
#[derive(Debug, Clone)]
pub struct SettlementClaim {
    pub account_id: String,
    pub record: SettlementRecord,
    pub worker_id: String,
    /// Fencing token; every write-back must present it
    pub lease_token: String,
}

impl SettlementClaim {
    pub fn entry_id(&self) -> &str {
        &self.record.entry_id
    }
}

/// A write-back driven by the reconciler. Attempts are counted when a
/// transfer is issued, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementUpdate {
    Succeeded {
        external_tx_ref: String,
    },
    /// Failed attempt, claimable again after `next_attempt_at`.
    /// `clear_transfer` forgets the issued transfer and its reference; it is
    /// false when the outcome of the attempt is still unknown.
    Retry {
        error: String,
        next_attempt_at: i64,
        clear_transfer: bool,
    },
    /// Hand the record back unchanged, e.g. while awaiting confirmation
    Release {
        note: Option<String>,
        next_attempt_at: i64,
    },
    /// Permanently failed; a compensating entry restores the amount
    FailedTerminal {
        error: String,
    },
}

impl SettlementUpdate {
    pub fn target_state(&self) -> SettlementState {
        match self {
            SettlementUpdate::Succeeded { .. } => SettlementState::Succeeded,
            SettlementUpdate::Retry { .. } => SettlementState::FailedRetryable,
            SettlementUpdate::Release { .. } => SettlementState::Pending,
            SettlementUpdate::FailedTerminal { .. } => SettlementState::FailedTerminal,
        }
    }
}

/// Materialized balance compared with the fold of entries
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceAudit {
    pub account_id: String,
    pub materialized: i64,
    pub folded: i64,
    pub entry_count: u64,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.materialized == self.folded
    }
}
