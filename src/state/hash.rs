use xxhash_rust::xxh3::xxh3_64;

/// 64-bit hash of a stream identifier, used to key the compact state tables.
pub trait StreamHasher: Send + Sync {
    fn hash(&self, stream_id: &str) -> u64;
}

/// Default hasher: XXH3 over the UTF-8 bytes of the stream id.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHashStreamHasher;

impl StreamHasher for XxHashStreamHasher {
    fn hash(&self, stream_id: &str) -> u64 {
        xxh3_64(stream_id.as_bytes())
    }
}

impl<F> StreamHasher for F
where
    F: Fn(&str) -> u64 + Send + Sync,
{
    fn hash(&self, stream_id: &str) -> u64 {
        self(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xxhash_is_stable() {
        let hasher = XxHashStreamHasher;
        assert_eq!(hasher.hash("ab-1"), hasher.hash("ab-1"));
        assert_ne!(hasher.hash("ab-1"), hasher.hash("ab-2"));
    }

    #[test]
    fn closures_are_hashers() {
        let by_len = |id: &str| id.len() as u64;
        assert_eq!(StreamHasher::hash(&by_len, "abc"), 3);
    }
}
