//! Settlement rows and the claim lease
//!
//! A record is claimable when it is `pending`/`failed_retryable` and its
//! `next_attempt_at` has passed, or when it is `in_flight` under an expired
//! lease. Claiming is a conditional UPDATE, so of two workers racing for the
//! same row exactly one sees a changed row count of 1. Every later write
//! presents the claim's `lease_token` as a fencing token.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::LedgerError;
use crate::models::{SettlementRecord, SettlementState};

const SELECT_SETTLEMENT: &str = "SELECT entry_id, account_id, destination, amount, state, \
    attempts, external_tx_ref, last_error, transfer_issued, next_attempt_at, lease_owner, \
    lease_token, lease_expires_at, updated_at FROM settlements";

const CLAIMABLE: &str = "((state IN ('pending', 'failed_retryable') AND next_attempt_at <= ?1) \
    OR (state = 'in_flight' AND lease_expires_at <= ?1))";

/// Settlement record plus the columns not exposed on the model
pub struct SettlementRow {
    pub record: SettlementRecord,
    pub account_id: String,
    pub lease_token: Option<String>,
}

impl SettlementRow {
    fn from_row(row: &Row) -> Result<(Self, String), rusqlite::Error> {
        let state: String = row.get("state")?;
        let attempts: i64 = row.get("attempts")?;
        let transfer_issued: i64 = row.get("transfer_issued")?;
        Ok((
            Self {
                record: SettlementRecord {
                    entry_id: row.get("entry_id")?,
                    destination: row.get("destination")?,
                    amount: row.get("amount")?,
                    state: SettlementState::Pending,
                    attempts: attempts as u32,
                    external_tx_ref: row.get("external_tx_ref")?,
                    last_error: row.get("last_error")?,
                    transfer_issued: transfer_issued != 0,
                    next_attempt_at: row.get("next_attempt_at")?,
                    lease_owner: row.get("lease_owner")?,
                    lease_expires_at: row.get("lease_expires_at")?,
                    updated_at: row.get("updated_at")?,
                },
                account_id: row.get("account_id")?,
                lease_token: row.get("lease_token")?,
            },
            state,
        ))
    }
}

pub fn insert_settlement(
    conn: &Connection,
    account_id: &str,
    record: &SettlementRecord,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO settlements (entry_id, account_id, destination, amount, state, attempts,
                                  next_attempt_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.entry_id,
            account_id,
            record.destination,
            record.amount,
            record.state.as_str(),
            record.attempts as i64,
            record.next_attempt_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_settlement_row(
    conn: &Connection,
    entry_id: &str,
) -> Result<Option<SettlementRow>, LedgerError> {
    let row = conn
        .query_row(
            &format!("{} WHERE entry_id = ?1", SELECT_SETTLEMENT),
            params![entry_id],
            SettlementRow::from_row,
        )
        .optional()?;

    match row {
        Some((mut settlement, state)) => {
            settlement.record.state = state.parse()?;
            Ok(Some(settlement))
        }
        None => Ok(None),
    }
}

pub fn get_settlement(
    conn: &Connection,
    entry_id: &str,
) -> Result<Option<SettlementRecord>, LedgerError> {
    Ok(get_settlement_row(conn, entry_id)?.map(|row| row.record))
}

/// Entry IDs eligible for claiming at `now_ms`, oldest due first
pub fn claimable_ids(conn: &Connection, now_ms: i64, limit: usize) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT entry_id FROM settlements WHERE {} ORDER BY next_attempt_at, entry_id LIMIT ?2",
        CLAIMABLE
    ))?;
    let ids = stmt
        .query_map(params![now_ms, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Conditionally take the lease on one record. Returns false when another
/// worker got there first.
pub fn try_claim(
    conn: &Connection,
    entry_id: &str,
    worker_id: &str,
    lease_token: &str,
    now_ms: i64,
    lease_expires_at: i64,
    now: DateTime<Utc>,
) -> Result<bool, LedgerError> {
    let changed = conn.execute(
        &format!(
            "UPDATE settlements
             SET state = 'in_flight', lease_owner = ?2, lease_token = ?3,
                 lease_expires_at = ?4, updated_at = ?5
             WHERE entry_id = ?6 AND {}",
            CLAIMABLE
        ),
        params![now_ms, worker_id, lease_token, lease_expires_at, now, entry_id],
    )?;
    Ok(changed == 1)
}

fn fenced(changed: usize, entry_id: &str) -> Result<(), LedgerError> {
    if changed == 1 {
        Ok(())
    } else {
        Err(LedgerError::LeaseLost(entry_id.to_string()))
    }
}

pub fn renew_lease(
    conn: &Connection,
    entry_id: &str,
    lease_token: &str,
    lease_expires_at: i64,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE settlements SET lease_expires_at = ?1, updated_at = ?2
         WHERE entry_id = ?3 AND lease_token = ?4 AND state = 'in_flight'",
        params![lease_expires_at, now, entry_id, lease_token],
    )?;
    fenced(changed, entry_id)
}

/// Count an attempt and flag that a transfer is about to be issued.
/// Returns the new attempt number.
pub fn begin_transfer(
    conn: &Connection,
    entry_id: &str,
    lease_token: &str,
    now: DateTime<Utc>,
) -> Result<u32, LedgerError> {
    let changed = conn.execute(
        "UPDATE settlements SET attempts = attempts + 1, transfer_issued = 1, updated_at = ?1
         WHERE entry_id = ?2 AND lease_token = ?3 AND state = 'in_flight'",
        params![now, entry_id, lease_token],
    )?;
    fenced(changed, entry_id)?;

    let attempts: i64 = conn.query_row(
        "SELECT attempts FROM settlements WHERE entry_id = ?1",
        params![entry_id],
        |row| row.get(0),
    )?;
    Ok(attempts as u32)
}

/// Forget an issued transfer that the gateway has no record of
pub fn clear_transfer(
    conn: &Connection,
    entry_id: &str,
    lease_token: &str,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE settlements SET transfer_issued = 0, external_tx_ref = NULL, updated_at = ?1
         WHERE entry_id = ?2 AND lease_token = ?3 AND state = 'in_flight'",
        params![now, entry_id, lease_token],
    )?;
    fenced(changed, entry_id)
}

pub fn set_external_ref(
    conn: &Connection,
    entry_id: &str,
    lease_token: &str,
    external_tx_ref: &str,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE settlements SET external_tx_ref = ?1, transfer_issued = 1, updated_at = ?2
         WHERE entry_id = ?3 AND lease_token = ?4 AND state = 'in_flight'",
        params![external_tx_ref, now, entry_id, lease_token],
    )?;
    fenced(changed, entry_id)
}

/// Persist a reconciler write-back and release the lease
pub fn write_outcome(
    conn: &Connection,
    record: &SettlementRecord,
    lease_token: &str,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE settlements
         SET state = ?1, attempts = ?2, external_tx_ref = ?3, last_error = ?4,
             transfer_issued = ?5, next_attempt_at = ?6, lease_owner = NULL,
             lease_token = NULL, lease_expires_at = NULL, updated_at = ?7
         WHERE entry_id = ?8 AND lease_token = ?9 AND state = 'in_flight'",
        params![
            record.state.as_str(),
            record.attempts as i64,
            record.external_tx_ref,
            record.last_error,
            record.transfer_issued as i64,
            record.next_attempt_at,
            record.updated_at,
            record.entry_id,
            lease_token,
        ],
    )?;
    fenced(changed, &record.entry_id)
}

/// Number of settlements per state, for the health endpoint
pub fn count_by_state(conn: &Connection) -> Result<Vec<(String, i64)>, LedgerError> {
    let mut stmt =
        conn.prepare_cached("SELECT state, COUNT(*) FROM settlements GROUP BY state ORDER BY state")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn conn_with_pending(next_attempt_at: i64) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO accounts (account_id, created_at, updated_at) VALUES ('a', 'now', 'now');
             INSERT INTO entries (entry_id, account_id, seq, kind, delta, breakdown_json, created_at)
             VALUES ('w1', 'a', 1, 'withdrawal', -50, '{}', 'now');",
        )
        .unwrap();
        insert_settlement(
            &conn,
            "a",
            &SettlementRecord {
                entry_id: "w1".to_string(),
                destination: "dest".to_string(),
                amount: 50,
                state: SettlementState::Pending,
                attempts: 0,
                external_tx_ref: None,
                last_error: None,
                transfer_issued: false,
                next_attempt_at,
                lease_owner: None,
                lease_expires_at: None,
                updated_at: Utc::now(),
            },
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_not_claimable_before_due() {
        let conn = conn_with_pending(1_000);
        assert!(claimable_ids(&conn, 999, 10).unwrap().is_empty());
        assert_eq!(claimable_ids(&conn, 1_000, 10).unwrap(), vec!["w1".to_string()]);
    }

    #[test]
    fn test_second_claim_fails_until_lease_expires() {
        let conn = conn_with_pending(0);
        let now = Utc::now();

        assert!(try_claim(&conn, "w1", "worker-a", "tok-a", 10, 5_000, now).unwrap());
        assert!(!try_claim(&conn, "w1", "worker-b", "tok-b", 4_999, 9_999, now).unwrap());

        // Expired lease: taken over, attempts untouched, old token fenced out
        assert!(try_claim(&conn, "w1", "worker-b", "tok-b", 5_000, 9_999, now).unwrap());
        let row = get_settlement_row(&conn, "w1").unwrap().unwrap();
        assert_eq!(row.record.lease_owner.as_deref(), Some("worker-b"));
        assert_eq!(row.record.attempts, 0);
        assert!(matches!(
            begin_transfer(&conn, "w1", "tok-a", now),
            Err(LedgerError::LeaseLost(_))
        ));
        assert_eq!(begin_transfer(&conn, "w1", "tok-b", now).unwrap(), 1);
    }

    #[test]
    fn test_write_outcome_releases_lease() {
        let conn = conn_with_pending(0);
        assert!(try_claim(&conn, "w1", "worker-a", "tok-a", 10, 5_000, Utc::now()).unwrap());

        let mut record = get_settlement(&conn, "w1").unwrap().unwrap();
        record.state = SettlementState::Succeeded;
        record.external_tx_ref = Some("sig-1".to_string());
        write_outcome(&conn, &record, "tok-a").unwrap();

        let row = get_settlement_row(&conn, "w1").unwrap().unwrap();
        assert_eq!(row.record.state, SettlementState::Succeeded);
        assert!(row.lease_token.is_none());
        assert!(row.record.lease_expires_at.is_none());
        assert!(write_outcome(&conn, &record, "tok-a").is_err());
        assert_eq!(count_by_state(&conn).unwrap(), vec![("succeeded".to_string(), 1)]);
    }
}
