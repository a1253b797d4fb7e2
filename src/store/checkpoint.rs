use rusqlite::OptionalExtension;

use crate::{
    checkpoint::ScavengeCheckpoint,
    store::{
        backend::SqliteBackend,
        error::{StoreError, StoreResult},
        map::ScavengeMap,
    },
};

const SELECT_SQL: &str = "SELECT stage, value FROM ScavengeCheckpointMap WHERE key = 0";

/// Single-row slot holding the current [`ScavengeCheckpoint`].
///
/// The stage name is stored in its own column next to the JSON payload and
/// checked against the payload's tag on read.
pub struct SqliteCheckpointMap {
    backend: SqliteBackend,
}

impl SqliteCheckpointMap {
    pub fn new(backend: SqliteBackend) -> StoreResult<Self> {
        backend.init_table(
            "CREATE TABLE IF NOT EXISTS ScavengeCheckpointMap (
                key INTEGER PRIMARY KEY,
                stage TEXT NOT NULL,
                value TEXT NOT NULL)",
        )?;
        Ok(Self { backend })
    }

    fn read(&self) -> StoreResult<Option<(String, String)>> {
        self.backend.with_conn(|conn| {
            conn.prepare_cached(SELECT_SQL)?
                .query_row([], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()
        })
    }
}

fn decode(stage: &str, value: &str) -> StoreResult<ScavengeCheckpoint> {
    let checkpoint: ScavengeCheckpoint = serde_json::from_str(value)?;
    if checkpoint.stage().as_str() != stage {
        return Err(StoreError::Corrupt(format!(
            "checkpoint stage column {stage} does not match payload {}",
            checkpoint.stage().as_str()
        )));
    }
    Ok(checkpoint)
}

impl ScavengeMap<(), ScavengeCheckpoint> for SqliteCheckpointMap {
    fn get(&self, _key: &()) -> StoreResult<Option<ScavengeCheckpoint>> {
        self.read()?
            .map(|(stage, value)| decode(&stage, &value))
            .transpose()
    }

    fn set(&self, _key: &(), value: &ScavengeCheckpoint) -> StoreResult<()> {
        let payload = serde_json::to_string(value)?;
        let stage = value.stage().as_str();
        self.backend.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO ScavengeCheckpointMap (key, stage, value) VALUES (0, ?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET stage = excluded.stage, value = excluded.value",
            )?
            .execute((stage, &payload))
            .map(|_| ())
        })
    }

    fn try_remove(&self, key: &()) -> StoreResult<Option<ScavengeCheckpoint>> {
        let existing = self.get(key)?;
        if existing.is_some() {
            self.backend.with_conn(|conn| {
                conn.execute("DELETE FROM ScavengeCheckpointMap WHERE key = 0", [])
                    .map(|_| ())
            })?;
        }
        Ok(existing)
    }

    fn all_records(&self) -> StoreResult<Vec<((), ScavengeCheckpoint)>> {
        Ok(self.get(&())?.map(|c| ((), c)).into_iter().collect())
    }
}
