//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        conn.execute_batch(LEDGER_SCHEMA)
            .map_err(|e| LedgerError::Storage(format!("Failed to create ledger tables: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(LedgerError::Storage(format!(
            "Database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| LedgerError::Storage(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    last_seq INTEGER NOT NULL DEFAULT 0,
    external_address TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    entry_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(account_id),
    seq INTEGER NOT NULL,
    kind TEXT NOT NULL,
    delta INTEGER NOT NULL,
    breakdown_json TEXT NOT NULL,
    reference_id TEXT,
    -- signup:<account>, verification:<dataset>, reversal:<withdrawal entry>
    dedup_key TEXT UNIQUE,
    created_at TEXT NOT NULL,
    UNIQUE (account_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_entries_account_seq ON entries(account_id, seq DESC);

CREATE TRIGGER IF NOT EXISTS entries_append_only_update
BEFORE UPDATE ON entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are append-only');
END;

CREATE TRIGGER IF NOT EXISTS entries_append_only_delete
BEFORE DELETE ON entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are append-only');
END;

CREATE TABLE IF NOT EXISTS settlements (
    entry_id TEXT PRIMARY KEY REFERENCES entries(entry_id),
    account_id TEXT NOT NULL REFERENCES accounts(account_id),
    destination TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    external_tx_ref TEXT,
    last_error TEXT,
    transfer_issued INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,
    lease_owner TEXT,
    lease_token TEXT,
    lease_expires_at INTEGER,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_settlements_claimable ON settlements(state, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_settlements_lease ON settlements(state, lease_expires_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_unreadable_version_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version) VALUES ('garbage');",
        )
        .unwrap();

        assert!(matches!(init_schema(&conn), Err(LedgerError::Storage(_))));
        let accounts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'accounts'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(accounts, 0);
    }

    #[test]
    fn test_entries_reject_update_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO accounts (account_id, created_at, updated_at) VALUES ('a', 'now', 'now');
             INSERT INTO entries (entry_id, account_id, seq, kind, delta, breakdown_json, created_at)
             VALUES ('e1', 'a', 1, 'signup', 100, '{}', 'now');",
        )
        .unwrap();

        let update = conn.execute("UPDATE entries SET delta = 5 WHERE entry_id = 'e1'", []);
        assert!(update.unwrap_err().to_string().contains("append-only"));

        let delete = conn.execute("DELETE FROM entries WHERE entry_id = 'e1'", []);
        assert!(delete.is_err());
    }
}
