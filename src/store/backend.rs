//! SQLite connection, durability configuration and transactions.
//!
//! WAL with `synchronous=NORMAL` means committing does not wait for a flush. On
//! power loss the last few transactions can be lost but the database stays
//! valid, and scavenging resumes from the last persisted checkpoint.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use rusqlite::{Connection, OptionalExtension};

use crate::{
    observability::{log_debug, log_info, log_warn},
    option::DEFAULT_SQLITE_CACHE_SIZE,
    store::error::{StoreError, StoreResult},
};

const EXPECTED_JOURNAL_MODE: &str = "wal";
/// `NORMAL`
const EXPECTED_SYNCHRONOUS: i64 = 1;
pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Shared handle to the scavenge state database.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    in_transaction: Arc<AtomicBool>,
}

impl SqliteBackend {
    /// Open (or create) the state database at `path`.
    pub fn open(path: impl AsRef<Path>, cache_size_bytes: usize) -> StoreResult<Self> {
        let path = path.as_ref();
        log_info!(
            component = "state",
            event = "state_store_opening",
            path = %path.display(),
        );
        let conn = Connection::open(path)?;
        Self::initialize(conn, cache_size_bytes, true)
    }

    /// Open a private in-memory state database.
    ///
    /// SQLite cannot run an in-memory database in WAL mode, so the journal mode
    /// check is skipped here. Nothing in it survives the process anyway.
    pub fn open_in_memory(cache_size_bytes: usize) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, cache_size_bytes, false)
    }

    fn initialize(conn: Connection, cache_size_bytes: usize, durable: bool) -> StoreResult<Self> {
        configure_features(&conn, cache_size_bytes, durable)?;
        initialize_schema_version(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            in_transaction: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run `f` against the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard)?)
    }

    pub(crate) fn init_table(&self, sql: &str) -> StoreResult<()> {
        self.with_conn(|conn| conn.execute_batch(sql))
    }

    /// Begin the single open transaction allowed on this store.
    pub fn begin_transaction(&self) -> StoreResult<SqliteTransaction> {
        if self
            .in_transaction
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        if let Err(err) = self.with_conn(|conn| conn.execute_batch("BEGIN")) {
            self.in_transaction.store(false, Ordering::Release);
            return Err(err);
        }
        Ok(SqliteTransaction {
            backend: self.clone(),
            finished: false,
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    /// Page usage of the database file.
    pub fn stats(&self) -> StoreResult<BackendStats> {
        self.with_conn(|conn| {
            let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
            let page_count: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
            let cache_size: i64 = conn.pragma_query_value(None, "cache_size", |row| row.get(0))?;
            Ok(BackendStats {
                page_size,
                page_count,
                cache_size,
            })
        })
    }

    fn finish(&self, sql: &str) -> StoreResult<()> {
        let result = self.with_conn(|conn| conn.execute_batch(sql));
        self.in_transaction.store(false, Ordering::Release);
        result
    }
}

/// Database size figures reported by [`SqliteBackend::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    pub page_size: i64,
    pub page_count: i64,
    pub cache_size: i64,
}

impl BackendStats {
    pub fn database_size(&self) -> i64 {
        self.page_size * self.page_count
    }
}

/// An open transaction on the state store.
///
/// Writes made through any map of the same backend are invisible to other
/// connections until [`SqliteTransaction::commit`], and undone by
/// [`SqliteTransaction::rollback`]. Dropping an unfinished transaction rolls it
/// back.
pub struct SqliteTransaction {
    backend: SqliteBackend,
    finished: bool,
}

impl SqliteTransaction {
    pub fn commit(mut self) -> StoreResult<()> {
        self.finished = true;
        self.backend.finish("COMMIT")
    }

    pub fn rollback(mut self) -> StoreResult<()> {
        self.finished = true;
        self.backend.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log_warn!(
            component = "state",
            event = "transaction_dropped",
            "rolling back unfinished scavenge state transaction"
        );
        if let Err(err) = self.backend.finish("ROLLBACK") {
            log_warn!(
                component = "state",
                event = "transaction_rollback_failed",
                error = %err,
            );
        }
    }
}

fn cache_size_kib(cache_size_bytes: usize) -> i64 {
    let bytes = cache_size_bytes.max(DEFAULT_SQLITE_CACHE_SIZE);
    i64::try_from(bytes / 1024).unwrap_or(i64::MAX)
}

fn configure_features(conn: &Connection, cache_size_bytes: usize, durable: bool) -> StoreResult<()> {
    let journal_mode: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        EXPECTED_JOURNAL_MODE,
        |row| row.get(0),
    )?;
    if durable && !journal_mode.eq_ignore_ascii_case(EXPECTED_JOURNAL_MODE) {
        return Err(StoreError::Config {
            pragma: "journal_mode",
            actual: journal_mode,
        });
    }

    conn.pragma_update(None, "synchronous", EXPECTED_SYNCHRONOUS)?;
    let synchronous: i64 = conn.pragma_query_value(None, "synchronous", |row| row.get(0))?;
    if synchronous != EXPECTED_SYNCHRONOUS {
        return Err(StoreError::Config {
            pragma: "synchronous",
            actual: synchronous.to_string(),
        });
    }

    // negative cache_size is in KiB, positive is in pages
    let cache_size = -cache_size_kib(cache_size_bytes);
    conn.pragma_update(None, "cache_size", cache_size)?;
    let current: i64 = conn.pragma_query_value(None, "cache_size", |row| row.get(0))?;
    if current != cache_size {
        return Err(StoreError::Config {
            pragma: "cache_size",
            actual: current.to_string(),
        });
    }

    log_debug!(
        component = "state",
        event = "state_store_configured",
        journal_mode = %journal_mode,
        synchronous,
        cache_size,
    );
    Ok(())
}

fn initialize_schema_version(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ScavengingSchemaVersion (version INTEGER PRIMARY KEY)",
    )?;
    let current: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM ScavengingSchemaVersion", [], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();

    match current {
        None => {
            conn.execute(
                "INSERT INTO ScavengingSchemaVersion (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(SCHEMA_VERSION) => Ok(()),
        Some(found) => Err(StoreError::SchemaVersion {
            found,
            expected: SCHEMA_VERSION,
        }),
    }
}
