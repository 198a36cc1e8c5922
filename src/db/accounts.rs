//! Account rows and the materialized balance

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::LedgerError;
use crate::models::{Account, AccountStatus};

const SELECT_ACCOUNT: &str = "SELECT account_id, balance, last_seq, external_address, status, \
                              created_at, updated_at FROM accounts";

fn account_from_row(row: &Row) -> Result<(Account, String), rusqlite::Error> {
    let last_seq: i64 = row.get("last_seq")?;
    let status: String = row.get("status")?;
    Ok((
        Account {
            account_id: row.get("account_id")?,
            balance: row.get("balance")?,
            external_address: row.get("external_address")?,
            status: AccountStatus::Active,
            last_seq: last_seq as u64,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        },
        status,
    ))
}

/// Get an account by ID
pub fn get_account(conn: &Connection, account_id: &str) -> Result<Option<Account>, LedgerError> {
    let row = conn
        .query_row(
            &format!("{} WHERE account_id = ?1", SELECT_ACCOUNT),
            params![account_id],
            account_from_row,
        )
        .optional()?;

    match row {
        Some((mut account, status)) => {
            account.status = status.parse()?;
            Ok(Some(account))
        }
        None => Ok(None),
    }
}

/// Get an account, creating it with a zero balance on first use
pub fn ensure_account(
    conn: &Connection,
    account_id: &str,
    now: DateTime<Utc>,
) -> Result<Account, LedgerError> {
    conn.execute(
        "INSERT OR IGNORE INTO accounts (account_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![account_id, now],
    )?;

    get_account(conn, account_id)?
        .ok_or_else(|| LedgerError::Storage(format!("account {} vanished", account_id)))
}

/// Move the materialized balance forward by one entry.
///
/// Compare-and-set on `last_seq`: fails when another writer appended to the
/// account since `expected_seq` was read.
pub fn advance_balance(
    conn: &Connection,
    account_id: &str,
    expected_seq: u64,
    new_balance: i64,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE accounts SET balance = ?1, last_seq = ?2, updated_at = ?3
         WHERE account_id = ?4 AND last_seq = ?5",
        params![
            new_balance,
            (expected_seq + 1) as i64,
            now,
            account_id,
            expected_seq as i64
        ],
    )?;

    if changed != 1 {
        return Err(LedgerError::TransientStorage(format!(
            "concurrent append on account {}",
            account_id
        )));
    }
    Ok(())
}

pub fn set_external_address(
    conn: &Connection,
    account_id: &str,
    address: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Account, LedgerError> {
    ensure_account(conn, account_id, now)?;
    conn.execute(
        "UPDATE accounts SET external_address = ?1, updated_at = ?2 WHERE account_id = ?3",
        params![address, now, account_id],
    )?;
    get_account(conn, account_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("account {}", account_id)))
}

pub fn set_status(
    conn: &Connection,
    account_id: &str,
    status: AccountStatus,
    now: DateTime<Utc>,
) -> Result<Account, LedgerError> {
    let changed = conn.execute(
        "UPDATE accounts SET status = ?1, updated_at = ?2 WHERE account_id = ?3",
        params![status.as_str(), now, account_id],
    )?;
    if changed == 0 {
        return Err(LedgerError::NotFound(format!("account {}", account_id)));
    }
    get_account(conn, account_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("account {}", account_id)))
}
