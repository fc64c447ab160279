//! SQL gateway: a fixed-size pool of `SQLite` connections.
//!
//! The pool is deliberately small - it matches the worker-pool size so each
//! per-item transaction holds one connection for its duration and external
//! load stays bounded. Connections run in WAL mode with a busy timeout, so
//! concurrent worker writes serialise on the `SQLite` write lock instead of
//! failing.
//!
//! The gateway does not interpret the domain; everything domain-shaped
//! lives in the state store built on top of it.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Maximum concurrent connections; matches the worker-pool contract.
pub const POOL_SIZE: usize = 3;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Per-connection pragmas.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;
    PRAGMA foreign_keys=ON;
";

/// Errors raised by the gateway and the state store above it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while opening the database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed-size pool of `SQLite` connections, handed out round-robin.
pub struct SqlPool {
    slots: Vec<Arc<Mutex<Connection>>>,
    next: AtomicUsize,
}

impl SqlPool {
    /// Opens (creating if necessary) the database at `path` with `size`
    /// pooled connections and applies the schema idempotently.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database cannot be opened or
    /// initialised.
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut slots = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.execute_batch(CONNECTION_PRAGMAS)?;
            if index == 0 {
                conn.execute_batch(SCHEMA_SQL)?;
            }
            slots.push(Arc::new(Mutex::new(conn)));
        }
        Ok(Self {
            slots,
            next: AtomicUsize::new(0),
        })
    }

    /// Creates a single-connection in-memory pool for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when initialisation fails.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            slots: vec![Arc::new(Mutex::new(conn))],
            next: AtomicUsize::new(0),
        })
    }

    /// Hands out the next pooled connection, round-robin.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        Arc::clone(&self.slots[index])
    }

    /// Locks a pooled connection for the duration of `f`.
    ///
    /// # Errors
    ///
    /// Propagates whatever `f` returns.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let slot = self.connection();
        let guard = lock_slot(&slot);
        f(&guard)
    }

    /// Runs `f` inside a transaction on one pooled connection. Commit on
    /// `Ok`; rollback on `Err` (or on panic, via the transaction's drop).
    ///
    /// # Errors
    ///
    /// Propagates `f`'s error after rolling back, or the commit error.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let slot = self.connection();
        let mut guard = lock_slot(&slot);
        let tx = guard.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            },
            Err(err) => {
                // Explicit for clarity; dropping the transaction rolls back.
                let _ = tx.rollback();
                Err(err)
            },
        }
    }
}

fn lock_slot(slot: &Arc<Mutex<Connection>>) -> MutexGuard<'_, Connection> {
    slot.lock().expect("sql connection lock poisoned")
}

impl std::fmt::Debug for SqlPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlPool")
            .field("size", &self.slots.len())
            .finish_non_exhaustive()
    }
}
