//! Ledger entry rows

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::settlements;
use crate::error::LedgerError;
use crate::models::{Breakdown, EntryKind, LedgerEntry};

const SELECT_ENTRY: &str = "SELECT entry_id, account_id, seq, kind, delta, breakdown_json, \
                            reference_id, created_at FROM entries";

/// Raw entry row before kind/breakdown decoding
struct EntryRow {
    entry_id: String,
    account_id: String,
    seq: i64,
    kind: String,
    delta: i64,
    breakdown_json: String,
    reference_id: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl EntryRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            entry_id: row.get("entry_id")?,
            account_id: row.get("account_id")?,
            seq: row.get("seq")?,
            kind: row.get("kind")?,
            delta: row.get("delta")?,
            breakdown_json: row.get("breakdown_json")?,
            reference_id: row.get("reference_id")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_entry(self, conn: &Connection) -> Result<LedgerEntry, LedgerError> {
        let kind: EntryKind = self.kind.parse()?;
        let breakdown: Breakdown = serde_json::from_str(&self.breakdown_json)?;
        let settlement = if kind == EntryKind::Withdrawal {
            settlements::get_settlement(conn, &self.entry_id)?
        } else {
            None
        };

        Ok(LedgerEntry {
            entry_id: self.entry_id,
            account_id: self.account_id,
            seq: self.seq as u64,
            kind,
            delta: self.delta,
            breakdown,
            reference_id: self.reference_id,
            settlement,
            created_at: self.created_at,
        })
    }
}

/// Insert a new entry. The settlement record, if any, is inserted separately.
pub fn insert_entry(
    conn: &Connection,
    entry: &LedgerEntry,
    dedup_key: Option<&str>,
) -> Result<(), LedgerError> {
    let breakdown_json = serde_json::to_string(&entry.breakdown)?;
    conn.execute(
        "INSERT INTO entries (entry_id, account_id, seq, kind, delta, breakdown_json,
                              reference_id, dedup_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.entry_id,
            entry.account_id,
            entry.seq as i64,
            entry.kind.as_str(),
            entry.delta,
            breakdown_json,
            entry.reference_id,
            dedup_key,
            entry.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_entry(conn: &Connection, entry_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
    let row = conn
        .query_row(
            &format!("{} WHERE entry_id = ?1", SELECT_ENTRY),
            params![entry_id],
            EntryRow::from_row,
        )
        .optional()?;

    row.map(|r| r.into_entry(conn)).transpose()
}

/// Look up the entry previously persisted under a dedup key
pub fn find_by_dedup_key(
    conn: &Connection,
    dedup_key: &str,
) -> Result<Option<LedgerEntry>, LedgerError> {
    let row = conn
        .query_row(
            &format!("{} WHERE dedup_key = ?1", SELECT_ENTRY),
            params![dedup_key],
            EntryRow::from_row,
        )
        .optional()?;

    row.map(|r| r.into_entry(conn)).transpose()
}

/// Entries for an account, newest first, strictly older than `before_seq`
pub fn list_entries(
    conn: &Connection,
    account_id: &str,
    before_seq: Option<u64>,
    limit: u32,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    let mut stmt = conn.prepare_cached(&format!(
        "{} WHERE account_id = ?1 AND (?2 IS NULL OR seq < ?2) ORDER BY seq DESC LIMIT ?3",
        SELECT_ENTRY
    ))?;

    let rows = stmt
        .query_map(
            params![account_id, before_seq.map(|s| s as i64), limit as i64],
            EntryRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(|r| r.into_entry(conn)).collect()
}

/// Sum and count of every entry delta for an account
pub fn fold_balance(conn: &Connection, account_id: &str) -> Result<(i64, u64), LedgerError> {
    let (sum, count): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(delta), 0), COUNT(*) FROM entries WHERE account_id = ?1",
        params![account_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((sum, count as u64))
}
