//! Typed key/value maps stored as SQLite tables.

use std::{marker::PhantomData, time::Duration};

use rusqlite::{
    params_from_iter,
    types::{FromSqlError, Type, Value},
    OptionalExtension, Row,
};

use crate::{
    state::{
        CalculationStatus, ChunkTimeStampRange, DiscardPoint, MetastreamData, OriginalStreamData,
    },
    store::{backend::SqliteBackend, error::StoreResult},
    timestamp::Timestamp,
};

/// A durable key/value map. Insertion order is irrelevant.
pub trait ScavengeMap<K, V> {
    fn get(&self, key: &K) -> StoreResult<Option<V>>;

    /// Insert or overwrite.
    fn set(&self, key: &K, value: &V) -> StoreResult<()>;

    fn try_remove(&self, key: &K) -> StoreResult<Option<V>>;

    fn all_records(&self) -> StoreResult<Vec<(K, V)>>;
}

/// A type usable as the primary key of a map table.
pub trait SqlKey: Sized {
    const SQL_TYPE: &'static str;

    fn to_sql_key(&self) -> Value;

    fn from_sql_key(row: &Row<'_>, idx: usize) -> rusqlite::Result<Self>;
}

/// A type stored in the value columns of a map table.
pub trait SqlValue: Sized {
    /// `(column name, column declaration)` pairs, in parameter order.
    const COLUMNS: &'static [(&'static str, &'static str)];

    fn to_sql_values(&self) -> Vec<Value>;

    /// Decode from `row`, starting at column `offset`.
    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self>;
}

impl SqlKey for u64 {
    const SQL_TYPE: &'static str = "INTEGER";

    fn to_sql_key(&self) -> Value {
        // bit-cast: SQLite integers are signed
        Value::Integer(*self as i64)
    }

    fn from_sql_key(row: &Row<'_>, idx: usize) -> rusqlite::Result<Self> {
        row.get::<_, i64>(idx).map(|v| v as u64)
    }
}

impl SqlKey for u32 {
    const SQL_TYPE: &'static str = "INTEGER";

    fn to_sql_key(&self) -> Value {
        Value::Integer(i64::from(*self))
    }

    fn from_sql_key(row: &Row<'_>, idx: usize) -> rusqlite::Result<Self> {
        row.get(idx)
    }
}

impl SqlKey for String {
    const SQL_TYPE: &'static str = "TEXT";

    fn to_sql_key(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_sql_key(row: &Row<'_>, idx: usize) -> rusqlite::Result<Self> {
        row.get(idx)
    }
}

impl SqlValue for () {
    const COLUMNS: &'static [(&'static str, &'static str)] = &[];

    fn to_sql_values(&self) -> Vec<Value> {
        Vec::new()
    }

    fn from_sql_row(_row: &Row<'_>, _offset: usize) -> rusqlite::Result<Self> {
        Ok(())
    }
}

impl SqlValue for String {
    const COLUMNS: &'static [(&'static str, &'static str)] = &[("value", "TEXT NOT NULL")];

    fn to_sql_values(&self) -> Vec<Value> {
        vec![Value::Text(self.clone())]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        row.get(offset)
    }
}

impl SqlValue for f32 {
    const COLUMNS: &'static [(&'static str, &'static str)] = &[("value", "REAL NOT NULL")];

    fn to_sql_values(&self) -> Vec<Value> {
        vec![Value::Real(f64::from(*self))]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        row.get::<_, f64>(offset).map(|v| v as f32)
    }
}

impl SqlValue for MetastreamData {
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("isTombstoned", "INTEGER NOT NULL"),
        ("discardPoint", "INTEGER NOT NULL"),
    ];

    fn to_sql_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(i64::from(self.is_tombstoned)),
            Value::Integer(self.discard_point.first_event_number_to_keep()),
        ]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(MetastreamData {
            is_tombstoned: row.get(offset)?,
            discard_point: DiscardPoint::discard_before(row.get(offset + 1)?),
        })
    }
}

impl SqlValue for OriginalStreamData {
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("maxAge", "INTEGER NULL"),
        ("maxCount", "INTEGER NULL"),
        ("truncateBefore", "INTEGER NULL"),
        ("isTombstoned", "INTEGER NOT NULL"),
        ("discardPoint", "INTEGER NOT NULL"),
        ("maybeDiscardPoint", "INTEGER NOT NULL"),
        ("status", "INTEGER NOT NULL"),
    ];

    fn to_sql_values(&self) -> Vec<Value> {
        vec![
            optional_integer(self.max_age.map(duration_to_millis)),
            optional_integer(self.max_count.map(|c| i64::try_from(c).unwrap_or(i64::MAX))),
            optional_integer(self.truncate_before),
            Value::Integer(i64::from(self.is_tombstoned)),
            Value::Integer(self.discard_point.first_event_number_to_keep()),
            Value::Integer(self.maybe_discard_point.first_event_number_to_keep()),
            Value::Integer(self.status.as_i64()),
        ]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        let max_age: Option<i64> = row.get(offset)?;
        let max_count: Option<i64> = row.get(offset + 1)?;
        let status: i64 = row.get(offset + 6)?;
        let status = CalculationStatus::from_i64(status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                offset + 6,
                Type::Integer,
                Box::new(FromSqlError::OutOfRange(status)),
            )
        })?;
        Ok(OriginalStreamData {
            max_age: max_age.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            max_count: max_count.map(|c| c.max(0) as u64),
            truncate_before: row.get(offset + 2)?,
            is_tombstoned: row.get(offset + 3)?,
            discard_point: DiscardPoint::discard_before(row.get(offset + 4)?),
            maybe_discard_point: DiscardPoint::discard_before(row.get(offset + 5)?),
            status,
        })
    }
}

impl SqlValue for ChunkTimeStampRange {
    const COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("min", "INTEGER NOT NULL"),
        ("max", "INTEGER NOT NULL"),
    ];

    fn to_sql_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.min.as_millis() as i64),
            Value::Integer(self.max.as_millis() as i64),
        ]
    }

    fn from_sql_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        let min: i64 = row.get(offset)?;
        let max: i64 = row.get(offset + 1)?;
        Ok(ChunkTimeStampRange::new(
            Timestamp::from_millis(min as u64),
            Timestamp::from_millis(max as u64),
        ))
    }
}

fn optional_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// A [`ScavengeMap`] persisted in one SQLite table.
pub struct SqliteScavengeMap<K, V> {
    backend: SqliteBackend,
    table: &'static str,
    get_sql: String,
    upsert_sql: String,
    delete_sql: String,
    all_sql: String,
    after_sql: String,
    _p: PhantomData<fn() -> (K, V)>,
}

impl<K, V> SqliteScavengeMap<K, V>
where
    K: SqlKey,
    V: SqlValue,
{
    /// Bind a map to `table`, creating the table if needed.
    pub fn new(backend: SqliteBackend, table: &'static str) -> StoreResult<Self> {
        let mut columns = format!("key {} PRIMARY KEY", K::SQL_TYPE);
        for (name, decl) in V::COLUMNS {
            columns.push_str(&format!(", {name} {decl}"));
        }
        backend.init_table(&format!("CREATE TABLE IF NOT EXISTS {table} ({columns})"))?;

        let value_names: Vec<&str> = V::COLUMNS.iter().map(|(name, _)| *name).collect();
        let select_list = std::iter::once("key")
            .chain(value_names.iter().copied())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=value_names.len() + 1)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let upsert_sql = if value_names.is_empty() {
            format!("INSERT OR IGNORE INTO {table} (key) VALUES (?1)")
        } else {
            let updates = value_names
                .iter()
                .map(|name| format!("{name} = excluded.{name}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {table} ({select_list}) VALUES ({placeholders}) ON CONFLICT(key) DO \
                 UPDATE SET {updates}"
            )
        };

        Ok(Self {
            get_sql: format!("SELECT {select_list} FROM {table} WHERE key = ?1"),
            delete_sql: format!("DELETE FROM {table} WHERE key = ?1"),
            all_sql: format!("SELECT {select_list} FROM {table} ORDER BY key"),
            after_sql: format!(
                "SELECT {select_list} FROM {table} WHERE key > ?1 ORDER BY key LIMIT ?2"
            ),
            upsert_sql,
            backend,
            table,
            _p: PhantomData,
        })
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub(crate) fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    /// Up to `limit` records ordered by key, strictly after `after` when given.
    pub fn records_after(&self, after: Option<&K>, limit: usize) -> StoreResult<Vec<(K, V)>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.backend.with_conn(|conn| match after {
            Some(after) => {
                let mut stmt = conn.prepare_cached(&self.after_sql)?;
                let rows = stmt.query_map(
                    params_from_iter([after.to_sql_key(), Value::Integer(limit)]),
                    read_record::<K, V>,
                )?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare_cached(&self.all_sql)?;
                let rows = stmt.query_map([], read_record::<K, V>)?;
                rows.take(limit as usize).collect()
            }
        })
    }

    pub fn len(&self) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let count: i64 = self
            .backend
            .with_conn(|conn| conn.query_row(&sql, [], |row| row.get(0)))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn read_record<K: SqlKey, V: SqlValue>(row: &Row<'_>) -> rusqlite::Result<(K, V)> {
    Ok((K::from_sql_key(row, 0)?, V::from_sql_row(row, 1)?))
}

impl<K, V> ScavengeMap<K, V> for SqliteScavengeMap<K, V>
where
    K: SqlKey,
    V: SqlValue,
{
    fn get(&self, key: &K) -> StoreResult<Option<V>> {
        self.backend.with_conn(|conn| {
            conn.prepare_cached(&self.get_sql)?
                .query_row([key.to_sql_key()], |row| V::from_sql_row(row, 1))
                .optional()
        })
    }

    fn set(&self, key: &K, value: &V) -> StoreResult<()> {
        let params = std::iter::once(key.to_sql_key()).chain(value.to_sql_values());
        self.backend.with_conn(|conn| {
            conn.prepare_cached(&self.upsert_sql)?
                .execute(params_from_iter(params))
                .map(|_| ())
        })
    }

    fn try_remove(&self, key: &K) -> StoreResult<Option<V>> {
        self.backend.with_conn(|conn| {
            let existing = conn
                .prepare_cached(&self.get_sql)?
                .query_row([key.to_sql_key()], |row| V::from_sql_row(row, 1))
                .optional()?;
            if existing.is_some() {
                conn.prepare_cached(&self.delete_sql)?
                    .execute([key.to_sql_key()])?;
            }
            Ok(existing)
        })
    }

    fn all_records(&self) -> StoreResult<Vec<(K, V)>> {
        self.backend.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.all_sql)?;
            let rows = stmt.query_map([], read_record::<K, V>)?;
            rows.collect()
        })
    }
}

/// Per-logical-chunk weights with range aggregation.
pub struct SqliteChunkWeightMap {
    inner: SqliteScavengeMap<u32, f32>,
}

impl SqliteChunkWeightMap {
    pub const TABLE: &'static str = "ChunkWeights";

    pub fn new(backend: SqliteBackend) -> StoreResult<Self> {
        Ok(Self {
            inner: SqliteScavengeMap::new(backend, Self::TABLE)?,
        })
    }

    /// Add `delta` to the weight of one logical chunk.
    pub fn increase(&self, logical_chunk_number: u32, delta: f32) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = \
             value + excluded.value",
            Self::TABLE
        );
        self.inner.backend().with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .execute((i64::from(logical_chunk_number), f64::from(delta)))
                .map(|_| ())
        })
    }

    /// Total weight of logical chunks `start..=end`.
    pub fn sum(&self, start: u32, end: u32) -> StoreResult<f32> {
        let sql = format!(
            "SELECT COALESCE(SUM(value), 0.0) FROM {} WHERE key BETWEEN ?1 AND ?2",
            Self::TABLE
        );
        self.inner.backend().with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .query_row((i64::from(start), i64::from(end)), |row| row.get::<_, f64>(0))
                .map(|v| v as f32)
        })
    }

    /// Zero the weights of logical chunks `start..=end`.
    pub fn reset(&self, start: u32, end: u32) -> StoreResult<()> {
        let sql = format!("DELETE FROM {} WHERE key BETWEEN ?1 AND ?2", Self::TABLE);
        self.inner.backend().with_conn(|conn| {
            conn.prepare_cached(&sql)?
                .execute((i64::from(start), i64::from(end)))
                .map(|_| ())
        })
    }
}

impl ScavengeMap<u32, f32> for SqliteChunkWeightMap {
    fn get(&self, key: &u32) -> StoreResult<Option<f32>> {
        self.inner.get(key)
    }

    fn set(&self, key: &u32, value: &f32) -> StoreResult<()> {
        self.inner.set(key, value)
    }

    fn try_remove(&self, key: &u32) -> StoreResult<Option<f32>> {
        self.inner.try_remove(key)
    }

    fn all_records(&self) -> StoreResult<Vec<(u32, f32)>> {
        self.inner.all_records()
    }
}
