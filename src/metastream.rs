/// Prefix that turns a stream id into its metastream id.
pub const METASTREAM_PREFIX: &str = "$$";

/// Maps between data streams and the metastreams holding their metadata.
pub trait MetastreamLookup: Send + Sync {
    fn is_meta_stream(&self, stream_id: &str) -> bool;

    fn meta_stream_of(&self, stream_id: &str) -> String;

    fn original_stream_of(&self, meta_stream_id: &str) -> String;
}

/// `$$`-prefix naming: the metastream of `ab-1` is `$$ab-1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixMetastreamLookup;

impl MetastreamLookup for PrefixMetastreamLookup {
    fn is_meta_stream(&self, stream_id: &str) -> bool {
        stream_id.starts_with(METASTREAM_PREFIX)
    }

    fn meta_stream_of(&self, stream_id: &str) -> String {
        format!("{METASTREAM_PREFIX}{stream_id}")
    }

    fn original_stream_of(&self, meta_stream_id: &str) -> String {
        meta_stream_id
            .strip_prefix(METASTREAM_PREFIX)
            .unwrap_or(meta_stream_id)
            .to_string()
    }
}
