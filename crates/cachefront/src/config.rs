use serde::{Deserialize, Serialize};

/// Operating mode of the cache.
///
/// The mode decides how request keys are computed, see
/// [`HttpCache::generate_cache_key`](crate::HttpCache::generate_cache_key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Canonical URL keys, optionally prefixed with the upload body
    /// identifier.
    #[default]
    Normal,
    /// Every fetch is cached under a fresh generation-counted key.
    Record,
    /// Fetches replay recorded responses; key computation matches
    /// [`Record`](Self::Record) so repeated fetches of one URL walk through
    /// the recorded generations in order.
    Playback,
    /// The cache is bypassed entirely. Key computation is an error in this
    /// mode.
    Disable,
}

/// Static configuration for [`HttpCache`](crate::HttpCache).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The operating mode, see [`CacheMode`].
    pub mode: CacheMode,
}
