//! SQLite ledger store
//!
//! ## Tables
//!
//! - `accounts` - Materialized balance, last entry sequence, wallet address
//! - `entries` - Append-only ledger entries (UPDATE/DELETE rejected by triggers)
//! - `settlements` - Transfer lifecycle and claim lease per withdrawal entry
//!
//! Every balance-affecting write runs inside a `BEGIN IMMEDIATE`
//! transaction, which takes the database write lock up front. Together with
//! the per-account `last_seq` compare-and-set this makes the balance check,
//! entry insert and balance update one atomic unit, across processes too.

pub mod accounts;
pub mod entries;
pub mod schema;
pub mod settlements;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::LedgerError;

/// How long a writer waits on a locked database before reporting a
/// transient failure
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database holding the ledger
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the ledger database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Storage(format!("creating {}: {}", parent.display(), e))
            })?;
        }
        info!("Opening ledger database at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("Opening in-memory ledger database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LedgerError::Storage(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| LedgerError::Storage(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }
}
