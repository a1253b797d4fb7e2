use thiserror::Error;

/// Errors surfaced by the scavenge state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scavenge state sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to configure {pragma}, unexpected value: {actual}")]
    Config {
        pragma: &'static str,
        actual: String,
    },
    #[error("scavenge state schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },
    #[error("scavenge checkpoint codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt scavenge state: {0}")]
    Corrupt(String),
    #[error("a scavenge state transaction is already open")]
    TransactionAlreadyOpen,
    #[error("scavenge state connection lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;
