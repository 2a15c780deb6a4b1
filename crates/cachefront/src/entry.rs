use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::BackendEntry;
use crate::key::CacheKey;
use crate::transaction::Transaction;

/// Opaque token referring to an active cache entry.
///
/// Transactions receive an `EntryRef` when an open or create completes and
/// pass it back into the admission and release calls. The token stays valid
/// while the transaction holds or waits on the entry; access to the
/// underlying backend handle is always mediated by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryRef(pub(crate) u64);

/// In-memory coordination state for one opened backend entry.
///
/// An entry has at most one writer, any number of readers when there is no
/// writer, and a FIFO of transactions waiting for admission. Once doomed it
/// disappears from key lookup but stays alive for its current holders.
pub(crate) struct ActiveEntry {
    /// The key the entry was activated under.
    pub key: CacheKey,
    pub disk_entry: Arc<dyn BackendEntry>,
    pub writer: Option<Transaction>,
    pub readers: Vec<Transaction>,
    pub pending_queue: VecDeque<Transaction>,
    pub doomed: bool,
    /// Set between scheduling and running a queue drain. Coalesces bursts of
    /// releases into one drain and keeps the entry alive until it runs.
    pub will_process_pending_queue: bool,
}

impl ActiveEntry {
    pub fn new(key: CacheKey, disk_entry: Arc<dyn BackendEntry>) -> Self {
        ActiveEntry {
            key,
            disk_entry,
            writer: None,
            readers: Vec::new(),
            pending_queue: VecDeque::new(),
            doomed: false,
            will_process_pending_queue: false,
        }
    }

    /// Whether any transaction currently holds the entry.
    pub fn has_users(&self) -> bool {
        self.writer.is_some() || !self.readers.is_empty()
    }
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        self.disk_entry.close();
    }
}
