use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::EntryRef;
use crate::error::CacheResult;
use crate::key::CacheKey;

/// Access a transaction needs to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The transaction never touches the cache entry.
    None,
    /// Read-only access; any number of readers share an entry.
    Read,
    /// Exclusive write access.
    Write,
    /// Starts out writing and may later convert into a reader, see
    /// [`HttpCache::convert_writer_to_reader`](crate::HttpCache::convert_writer_to_reader).
    ReadWrite,
}

impl Mode {
    /// Whether this mode needs exclusive access to the entry.
    pub fn writes(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }

    /// Whether this mode reads from the entry.
    pub fn reads(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }
}

/// What a transaction blocked on the cache is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Waiting for the backend, an entry, or the current writer to finish.
    WaitingForCache,
    /// The writer holding the entry is idle.
    Idle,
    /// The writer holding the entry is talking to the network.
    SendingRequest,
    /// The writer holding the entry is streaming the response.
    ReadingResponse,
}

/// The result of a pending cache operation, delivered through
/// [`TransactionDelegate::on_cache_io_complete`].
///
/// The entry reference is present when the completion grants access to an
/// entry: a finished open or create, or an admission after queueing. It is
/// absent for completions that only unblock the transaction, such as the
/// backend becoming available.
pub type Completion = CacheResult<Option<EntryRef>>;

/// The cache-facing side of a transaction.
///
/// The transaction state machine itself lives outside the cache; this trait
/// is how the cache reaches back into it. Completions are delivered
/// synchronously from the cache's internal tasks and may re-enter the cache
/// (issue a new request, cancel another transaction). The two probe methods
/// are called from inside the cache's internal lock and must return promptly
/// without calling back into the cache.
pub trait TransactionDelegate: Send + Sync + 'static {
    /// A pending cache operation finished.
    fn on_cache_io_complete(&self, completion: Completion);

    /// A write was cancelled midway and the caller wants to keep the entry.
    /// Records that the stored response is truncated and returns whether that
    /// succeeded; on `false` the entry is retired instead.
    fn add_truncated_flag(&self) -> bool {
        false
    }

    /// The load state to report while this transaction is writing an entry
    /// that others are queued on.
    fn writer_load_state(&self) -> LoadState {
        LoadState::WaitingForCache
    }
}

/// A delegate that ignores every completion.
impl TransactionDelegate for () {
    fn on_cache_io_complete(&self, _completion: Completion) {}
}

struct TransactionInner {
    mode: Mode,
    key: Mutex<Option<CacheKey>>,
    delegate: Arc<dyn TransactionDelegate>,
}

/// Handle for one participant driving a request through the cache.
///
/// Created by [`HttpCache::create_transaction`](crate::HttpCache::create_transaction).
/// Clones refer to the same transaction; the cache tells transactions apart
/// by handle identity, not by key or mode.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(mode: Mode, delegate: Arc<dyn TransactionDelegate>) -> Self {
        Transaction {
            inner: Arc::new(TransactionInner {
                mode,
                key: Mutex::new(None),
                delegate,
            }),
        }
    }

    /// The access mode this transaction was created with.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// The key this transaction is currently working on.
    pub fn key(&self) -> Option<CacheKey> {
        self.inner.key.lock().clone()
    }

    /// Sets the key this transaction is working on. The cache uses it to
    /// locate the transaction when it is cancelled while queued.
    pub fn set_key(&self, key: CacheKey) {
        *self.inner.key.lock() = Some(key);
    }

    pub(crate) fn matches(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn deliver(&self, completion: Completion) {
        self.inner.delegate.on_cache_io_complete(completion);
    }

    pub(crate) fn add_truncated_flag(&self) -> bool {
        self.inner.delegate.add_truncated_flag()
    }

    pub(crate) fn writer_load_state(&self) -> LoadState {
        self.inner.delegate.writer_load_state()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("mode", &self.inner.mode)
            .field("key", &*self.inner.key.lock())
            .finish()
    }
}
