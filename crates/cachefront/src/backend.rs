//! The storage adapter contract.
//!
//! The coordination layer does not implement storage. It drives an adapter
//! that can asynchronously open, create and doom entries by key, and that can
//! asynchronously construct itself. Adapters are free to use background
//! threads or an in-memory table; the returned futures are driven on the
//! runtime handle the cache was created with.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::CacheResult;
use crate::key::CacheKey;

/// Constructs the storage backend.
///
/// Construction runs exactly once, triggered by the first operation that
/// needs the backend. Every transaction arriving while construction is still
/// in flight queues up behind it and is notified in arrival order once the
/// outcome is known, success or failure.
pub trait BackendFactory: Send + Sync + 'static {
    /// Builds the backend. The future may resolve immediately.
    fn create_backend(&self) -> BoxFuture<'static, CacheResult<Arc<dyn Backend>>>;
}

/// A disk-backed store of cache entries, addressed by [`CacheKey`].
///
/// At most one call per key is in flight at any time; concurrent requests for
/// the same key are coalesced by the coordination layer before they reach the
/// adapter.
pub trait Backend: Send + Sync + 'static {
    /// Opens the entry stored under `key`.
    ///
    /// Resolves to [`CacheError::NotFound`](crate::CacheError::NotFound) if
    /// there is no such entry.
    fn open_entry(&self, key: &CacheKey) -> BoxFuture<'static, CacheResult<Arc<dyn BackendEntry>>>;

    /// Creates a fresh entry under `key`.
    ///
    /// Resolves to
    /// [`CacheError::AlreadyExists`](crate::CacheError::AlreadyExists) if an
    /// entry is already stored under the key.
    fn create_entry(&self, key: &CacheKey)
        -> BoxFuture<'static, CacheResult<Arc<dyn BackendEntry>>>;

    /// Dooms the entry stored under `key`: removes it from the index while
    /// leaving already opened handles usable.
    fn doom_entry(&self, key: &CacheKey) -> BoxFuture<'static, CacheResult<()>>;
}

/// An opened backend entry.
///
/// Handles are owned by the coordination layer and never reach transactions
/// directly. The methods are called from inside the cache's internal lock and
/// must return promptly without calling back into the cache.
pub trait BackendEntry: Send + Sync + 'static {
    /// The key this entry is stored under.
    fn key(&self) -> CacheKey;

    /// Removes the entry from the backend index. Open handles stay usable
    /// until closed.
    fn doom(&self);

    /// Releases the handle. Called exactly once per handle.
    fn close(&self);
}
