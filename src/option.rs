use std::path::{Path, PathBuf};

/// Default size of one logical chunk in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Default SQLite page cache budget for the scavenge state store.
pub const DEFAULT_SQLITE_CACHE_SIZE: usize = 2 * 1024 * 1024;

/// Options controlling a scavenge run.
#[derive(Debug, Clone)]
pub struct ScavengeOption {
    pub(crate) state_path: Option<PathBuf>,
    pub(crate) chunk_size: u64,
    pub(crate) unsafe_ignore_hard_deletes: bool,
    pub(crate) cancellation_check_period: usize,
    pub(crate) threshold: i32,
    pub(crate) sqlite_cache_size_bytes: usize,
}

impl Default for ScavengeOption {
    fn default() -> Self {
        ScavengeOption {
            state_path: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            unsafe_ignore_hard_deletes: false,
            cancellation_check_period: 1024,
            threshold: 0,
            sqlite_cache_size_bytes: DEFAULT_SQLITE_CACHE_SIZE,
        }
    }
}

impl<P> From<P> for ScavengeOption
where
    P: Into<PathBuf>,
{
    fn from(path: P) -> Self {
        ScavengeOption {
            state_path: Some(path.into()),
            ..ScavengeOption::default()
        }
    }
}

impl ScavengeOption {
    /// Location of the SQLite scavenge state database. `None` keeps it in memory.
    pub fn state_path(self, path: impl Into<PathBuf>) -> Self {
        ScavengeOption {
            state_path: Some(path.into()),
            ..self
        }
    }

    /// Size in bytes of one logical chunk.
    pub fn chunk_size(self, chunk_size: u64) -> Self {
        ScavengeOption { chunk_size, ..self }
    }

    /// Remove tombstoned streams completely, tombstone included.
    ///
    /// Dangerous: a tombstoned stream's history stops being auditable, and
    /// chunks copied in from a node that has not run the same scavenge can
    /// reference records that no longer exist here.
    pub fn unsafe_ignore_hard_deletes(self, unsafe_ignore_hard_deletes: bool) -> Self {
        ScavengeOption {
            unsafe_ignore_hard_deletes,
            ..self
        }
    }

    /// How many records are processed between cancellation checks inside a chunk.
    pub fn cancellation_check_period(self, cancellation_check_period: usize) -> Self {
        ScavengeOption {
            cancellation_check_period: cancellation_check_period.max(1),
            ..self
        }
    }

    /// Threshold written into newly created scavenge points.
    pub fn threshold(self, threshold: i32) -> Self {
        ScavengeOption { threshold, ..self }
    }

    /// SQLite cache budget in bytes (never below [`DEFAULT_SQLITE_CACHE_SIZE`]).
    pub fn sqlite_cache_size_bytes(self, sqlite_cache_size_bytes: usize) -> Self {
        ScavengeOption {
            sqlite_cache_size_bytes,
            ..self
        }
    }
}

impl ScavengeOption {
    pub(crate) fn state_db_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    pub fn is_unsafe_ignore_hard_deletes(&self) -> bool {
        self.unsafe_ignore_hard_deletes
    }

    pub fn get_chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn get_threshold(&self) -> i32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let option = ScavengeOption::from("/tmp/scavenge.db")
            .chunk_size(1024)
            .unsafe_ignore_hard_deletes(true)
            .cancellation_check_period(0)
            .threshold(-1);

        assert_eq!(option.state_db_path(), Some(Path::new("/tmp/scavenge.db")));
        assert_eq!(option.get_chunk_size(), 1024);
        assert!(option.is_unsafe_ignore_hard_deletes());
        assert_eq!(option.cancellation_check_period, 1);
        assert_eq!(option.get_threshold(), -1);
    }
}
