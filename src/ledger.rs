//! Ledger Store facade
//!
//! Combines the reward rule engine with the SQLite store. Every operation
//! that moves a balance or a settlement runs in one `BEGIN IMMEDIATE`
//! transaction; a failure anywhere rolls the whole unit back.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{accounts, entries, settlements, LedgerDb};
use crate::error::LedgerError;
use crate::models::{
    Account, AccountStatus, AppendOutcome, BalanceAudit, EntryKind, LedgerEntry, RewardEvent,
    SettlementClaim, SettlementRecord, SettlementState, SettlementUpdate,
};
use crate::rules::RewardEngine;

/// Largest page `list_entries` will return
pub const MAX_PAGE_SIZE: u32 = 200;

/// Reason recorded on the entry that reverses a failed withdrawal
pub const REVERSAL_REASON: &str = "withdrawalReversal";

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// One page of entries, newest first
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPage {
    pub entries: Vec<LedgerEntry>,
    /// Pass back as `before` to fetch the next (older) page
    pub next_cursor: Option<u64>,
}

pub struct Ledger {
    db: LedgerDb,
    rules: RewardEngine,
}

impl Ledger {
    pub fn new(db: LedgerDb, rules: RewardEngine) -> Self {
        Self { db, rules }
    }

    pub fn open(db_path: &Path, rules: RewardEngine) -> Result<Self, LedgerError> {
        Ok(Self::new(LedgerDb::open(db_path)?, rules))
    }

    pub fn open_in_memory(rules: RewardEngine) -> Result<Self, LedgerError> {
        Ok(Self::new(LedgerDb::open_in_memory()?, rules))
    }

    pub fn rules(&self) -> &RewardEngine {
        &self.rules
    }

    // ---- Entries and balances ----

    /// Evaluate `event` and append the resulting entry.
    ///
    /// Signups deduplicate per account and verifications per `reference_id`;
    /// a repeated event returns the stored entry with `duplicate = true` and
    /// leaves the balance untouched.
    pub fn append_entry(
        &self,
        account_id: &str,
        event: RewardEvent,
        reference_id: Option<&str>,
    ) -> Result<AppendOutcome, LedgerError> {
        validate_account_id(account_id)?;
        let reference_id = match reference_id.map(str::trim) {
            Some("") => {
                return Err(LedgerError::InvalidInput(
                    "referenceId must not be blank".to_string(),
                ))
            }
            other => other,
        };

        let dedup_key = match &event {
            RewardEvent::Signup => Some(format!("signup:{}", account_id)),
            RewardEvent::Verification => match reference_id {
                Some(reference) => Some(format!("verification:{}", reference)),
                None => {
                    return Err(LedgerError::InvalidInput(
                        "verification requires a referenceId".to_string(),
                    ))
                }
            },
            _ => None,
        };

        let outcome = self.in_transaction(|conn| {
            append_in_tx(
                conn,
                &self.rules,
                account_id,
                &event,
                reference_id,
                dedup_key.as_deref(),
            )
        })?;

        if outcome.duplicate {
            debug!(
                account_id = %account_id,
                entry_id = %outcome.entry.entry_id,
                kind = %outcome.entry.kind,
                "Duplicate event, returning existing entry"
            );
        } else {
            info!(
                account_id = %account_id,
                entry_id = %outcome.entry.entry_id,
                kind = %outcome.entry.kind,
                delta = outcome.entry.delta,
                seq = outcome.entry.seq,
                "Appended ledger entry"
            );
        }
        Ok(outcome)
    }

    /// Materialized balance; zero for an account that has never had an entry
    pub fn get_balance(&self, account_id: &str) -> Result<i64, LedgerError> {
        Ok(self.get_account(account_id)?.map(|a| a.balance).unwrap_or(0))
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<Account>, LedgerError> {
        self.db.with_conn(|conn| accounts::get_account(conn, account_id))
    }

    pub fn get_entry(&self, entry_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        self.db.with_conn(|conn| entries::get_entry(conn, entry_id))
    }

    /// A page of entries strictly older than `before` (by sequence).
    /// Appends never shift a page already handed out.
    pub fn list_entries(
        &self,
        account_id: &str,
        before: Option<u64>,
        limit: u32,
    ) -> Result<EntryPage, LedgerError> {
        if before.is_some_and(|seq| seq > i64::MAX as u64) {
            return Err(LedgerError::InvalidInput(
                "before cursor out of range".to_string(),
            ));
        }
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut page = self
            .db
            .with_conn(|conn| entries::list_entries(conn, account_id, before, limit + 1))?;

        let next_cursor = if page.len() > limit as usize {
            page.truncate(limit as usize);
            page.last().map(|e| e.seq)
        } else {
            None
        };

        Ok(EntryPage {
            entries: page,
            next_cursor,
        })
    }

    /// Lazy iterator over an account's entries, newest first, fetching one
    /// page at a time. Resume later from `EntryIter::cursor`.
    pub fn entries(&self, account_id: &str, before: Option<u64>) -> EntryIter<'_> {
        EntryIter {
            ledger: self,
            account_id: account_id.to_string(),
            cursor: before,
            buffer: VecDeque::new(),
            page_size: 50,
            exhausted: false,
        }
    }

    /// Register (or clear) the account's external settlement address
    pub fn set_external_address(
        &self,
        account_id: &str,
        address: Option<&str>,
    ) -> Result<Account, LedgerError> {
        validate_account_id(account_id)?;
        if let Some(address) = address {
            validate_address(address)?;
        }
        let account = self.in_transaction(|conn| {
            accounts::set_external_address(conn, account_id, address, Utc::now())
        })?;
        info!(account_id = %account_id, has_address = address.is_some(), "Updated external address");
        Ok(account)
    }

    pub fn set_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let account = self
            .in_transaction(|conn| accounts::set_status(conn, account_id, status, Utc::now()))?;
        info!(account_id = %account_id, status = status.as_str(), "Updated account status");
        Ok(account)
    }

    /// Compare the materialized balance with the fold of all entries
    pub fn audit(&self, account_id: &str) -> Result<BalanceAudit, LedgerError> {
        self.db.with_conn(|conn| {
            let materialized = accounts::get_account(conn, account_id)?
                .map(|a| a.balance)
                .unwrap_or(0);
            let (folded, entry_count) = entries::fold_balance(conn, account_id)?;
            Ok(BalanceAudit {
                account_id: account_id.to_string(),
                materialized,
                folded,
                entry_count,
            })
        })
    }

    /// Number of settlement records per state
    pub fn settlement_counts(&self) -> Result<Vec<(String, i64)>, LedgerError> {
        self.db.with_conn(settlements::count_by_state)
    }

    // ---- Settlement claims ----

    /// Claim up to `limit` due settlement records for `worker_id`.
    ///
    /// Records whose lease has expired are reclaimed with `attempts`
    /// unchanged.
    pub fn claim_settlements(
        &self,
        worker_id: &str,
        now_ms: i64,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<SettlementClaim>, LedgerError> {
        let lease_expires_at = now_ms + lease.as_millis() as i64;

        self.in_transaction(|conn| {
            let mut claims = Vec::new();
            for entry_id in settlements::claimable_ids(conn, now_ms, limit)? {
                let token = Uuid::new_v4().to_string();
                let claimed = settlements::try_claim(
                    conn,
                    &entry_id,
                    worker_id,
                    &token,
                    now_ms,
                    lease_expires_at,
                    Utc::now(),
                )?;
                if !claimed {
                    continue;
                }
                if let Some(row) = settlements::get_settlement_row(conn, &entry_id)? {
                    claims.push(SettlementClaim {
                        account_id: row.account_id,
                        record: row.record,
                        worker_id: worker_id.to_string(),
                        lease_token: token,
                    });
                }
            }
            Ok(claims)
        })
    }

    pub fn renew_lease(
        &self,
        claim: &mut SettlementClaim,
        now_ms: i64,
        lease: Duration,
    ) -> Result<(), LedgerError> {
        let expires = now_ms + lease.as_millis() as i64;
        self.in_transaction(|conn| {
            settlements::renew_lease(conn, claim.entry_id(), &claim.lease_token, expires, Utc::now())
        })?;
        claim.record.lease_expires_at = Some(expires);
        Ok(())
    }

    /// Durably count an attempt before the transfer call goes out.
    /// Returns the attempt number, which keys the transfer's idempotency.
    pub fn record_transfer_issued(&self, claim: &mut SettlementClaim) -> Result<u32, LedgerError> {
        let attempts = self.in_transaction(|conn| {
            settlements::begin_transfer(conn, claim.entry_id(), &claim.lease_token, Utc::now())
        })?;
        claim.record.attempts = attempts;
        claim.record.transfer_issued = true;
        Ok(attempts)
    }

    /// Record the reference returned by the transfer gateway
    pub fn record_external_ref(
        &self,
        claim: &mut SettlementClaim,
        external_tx_ref: &str,
    ) -> Result<(), LedgerError> {
        self.in_transaction(|conn| {
            settlements::set_external_ref(
                conn,
                claim.entry_id(),
                &claim.lease_token,
                external_tx_ref,
                Utc::now(),
            )
        })?;
        claim.record.external_tx_ref = Some(external_tx_ref.to_string());
        claim.record.transfer_issued = true;
        Ok(())
    }

    /// Forget an issued transfer the gateway has no record of
    pub fn clear_transfer_issued(&self, claim: &mut SettlementClaim) -> Result<(), LedgerError> {
        self.in_transaction(|conn| {
            settlements::clear_transfer(conn, claim.entry_id(), &claim.lease_token, Utc::now())
        })?;
        claim.record.external_tx_ref = None;
        claim.record.transfer_issued = false;
        Ok(())
    }

    /// Apply a reconciler write-back and release the claim.
    ///
    /// A terminal failure appends the compensating credit in the same
    /// transaction. Records already in a terminal state are rejected with
    /// `InvalidTransition`; a superseded claim gets `LeaseLost`.
    pub fn mark_settlement(
        &self,
        claim: &SettlementClaim,
        update: SettlementUpdate,
    ) -> Result<SettlementRecord, LedgerError> {
        let entry_id = claim.entry_id().to_string();
        let target = update.target_state();

        let record = self.in_transaction(|conn| {
            let row = settlements::get_settlement_row(conn, &entry_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("settlement {}", entry_id)))?;
            let current = row.record.state;

            if current.is_terminal() || !SettlementState::InFlight.can_transition_to(target) {
                return Err(LedgerError::InvalidTransition {
                    from: current.to_string(),
                    to: target.to_string(),
                });
            }
            if current != SettlementState::InFlight
                || row.lease_token.as_deref() != Some(claim.lease_token.as_str())
            {
                return Err(LedgerError::LeaseLost(entry_id.clone()));
            }

            let mut record = row.record;
            record.state = target;
            record.updated_at = Utc::now();
            match &update {
                SettlementUpdate::Succeeded { external_tx_ref } => {
                    record.external_tx_ref = Some(external_tx_ref.clone());
                    record.transfer_issued = true;
                    record.last_error = None;
                }
                SettlementUpdate::Retry {
                    error,
                    next_attempt_at,
                    clear_transfer,
                } => {
                    record.last_error = Some(error.clone());
                    record.next_attempt_at = *next_attempt_at;
                    if *clear_transfer {
                        record.external_tx_ref = None;
                        record.transfer_issued = false;
                    }
                }
                SettlementUpdate::Release {
                    note,
                    next_attempt_at,
                } => {
                    if note.is_some() {
                        record.last_error = note.clone();
                    }
                    record.next_attempt_at = *next_attempt_at;
                }
                SettlementUpdate::FailedTerminal { error } => {
                    record.last_error = Some(error.clone());
                }
            }

            settlements::write_outcome(conn, &record, &claim.lease_token)?;

            if target == SettlementState::FailedTerminal {
                let reversal = RewardEvent::ManualAdjustment {
                    delta: record.amount,
                    reason: REVERSAL_REASON.to_string(),
                };
                let dedup_key = format!("reversal:{}", entry_id);
                let outcome = append_in_tx(
                    conn,
                    &self.rules,
                    &row.account_id,
                    &reversal,
                    Some(&entry_id),
                    Some(&dedup_key),
                )?;
                info!(
                    account_id = %row.account_id,
                    entry_id = %entry_id,
                    reversal_entry_id = %outcome.entry.entry_id,
                    amount = record.amount,
                    "Appended compensating entry for failed withdrawal"
                );
            }

            record.lease_owner = None;
            record.lease_expires_at = None;
            Ok(record)
        })?;

        match record.state {
            SettlementState::FailedTerminal => warn!(
                entry_id = %entry_id,
                attempts = record.attempts,
                error = record.last_error.as_deref().unwrap_or(""),
                "Settlement failed terminally"
            ),
            state => info!(
                entry_id = %entry_id,
                state = %state,
                attempts = record.attempts,
                "Settlement updated"
            ),
        }
        Ok(record)
    }

    fn in_transaction<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

/// The atomic append: dedup check, rule evaluation against the current
/// balance, entry insert, settlement insert and balance update.
fn append_in_tx(
    conn: &Connection,
    rules: &RewardEngine,
    account_id: &str,
    event: &RewardEvent,
    reference_id: Option<&str>,
    dedup_key: Option<&str>,
) -> Result<AppendOutcome, LedgerError> {
    if let Some(key) = dedup_key {
        if let Some(existing) = entries::find_by_dedup_key(conn, key)? {
            return Ok(AppendOutcome {
                entry: existing,
                duplicate: true,
            });
        }
    }

    let now = Utc::now();
    let account = accounts::ensure_account(conn, account_id, now)?;

    let destination = if event.kind() == EntryKind::Withdrawal {
        if account.status == AccountStatus::Suspended {
            return Err(LedgerError::Forbidden(format!(
                "account {} is suspended",
                account_id
            )));
        }
        let address = account.external_address.clone().ok_or_else(|| {
            LedgerError::InvalidInput("account has no external address registered".to_string())
        })?;
        Some(address)
    } else {
        None
    };

    let computation = rules.evaluate(event, account.balance)?;
    let new_balance = account
        .balance
        .checked_add(computation.delta)
        .ok_or_else(|| LedgerError::InvalidInput("balance overflow".to_string()))?;
    if new_balance < 0 {
        return Err(LedgerError::InsufficientBalance {
            requested: -computation.delta,
            available: account.balance,
        });
    }

    let entry_id = Uuid::new_v4().to_string();
    let settlement = destination.map(|destination| SettlementRecord {
        entry_id: entry_id.clone(),
        destination,
        amount: -computation.delta,
        state: SettlementState::Pending,
        attempts: 0,
        external_tx_ref: None,
        last_error: None,
        transfer_issued: false,
        next_attempt_at: now.timestamp_millis(),
        lease_owner: None,
        lease_expires_at: None,
        updated_at: now,
    });

    let entry = LedgerEntry {
        entry_id,
        account_id: account_id.to_string(),
        seq: account.last_seq + 1,
        kind: event.kind(),
        delta: computation.delta,
        breakdown: computation.breakdown,
        reference_id: reference_id.map(str::to_string),
        settlement,
        created_at: now,
    };

    entries::insert_entry(conn, &entry, dedup_key)?;
    if let Some(record) = &entry.settlement {
        settlements::insert_settlement(conn, account_id, record)?;
    }
    accounts::advance_balance(conn, account_id, account.last_seq, new_balance, now)?;

    Ok(AppendOutcome {
        entry,
        duplicate: false,
    })
}

fn validate_account_id(account_id: &str) -> Result<(), LedgerError> {
    if account_id.trim().is_empty() {
        return Err(LedgerError::InvalidInput("account id must not be empty".to_string()));
    }
    if account_id.len() > 128 {
        return Err(LedgerError::InvalidInput("account id too long".to_string()));
    }
    Ok(())
}

/// Wallet addresses are base58, 32-44 characters
pub fn validate_address(address: &str) -> Result<(), LedgerError> {
    if !(32..=44).contains(&address.len()) {
        return Err(LedgerError::InvalidInput(format!(
            "address must be 32-44 characters, got {}",
            address.len()
        )));
    }
    if let Some(c) = address.chars().find(|c| !BASE58_ALPHABET.contains(*c)) {
        return Err(LedgerError::InvalidInput(format!(
            "address contains non-base58 character '{}'",
            c
        )));
    }
    Ok(())
}

/// Page-at-a-time iterator returned by [`Ledger::entries`]
pub struct EntryIter<'a> {
    ledger: &'a Ledger,
    account_id: String,
    cursor: Option<u64>,
    buffer: VecDeque<LedgerEntry>,
    page_size: u32,
    exhausted: bool,
}

impl EntryIter<'_> {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Sequence of the last entry yielded; pass to `Ledger::entries` to
    /// resume after it
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }
}

impl Iterator for EntryIter<'_> {
    type Item = Result<LedgerEntry, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            let before = self.cursor;
            match self.ledger.db.with_conn(|conn| {
                entries::list_entries(conn, &self.account_id, before, self.page_size)
            }) {
                Ok(page) => {
                    if page.len() < self.page_size as usize {
                        self.exhausted = true;
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let entry = self.buffer.pop_front()?;
        self.cursor = Some(entry.seq);
        Some(Ok(entry))
    }
}
