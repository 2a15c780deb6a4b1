use thiserror::Error;

/// An error surfaced by the cache coordination layer.
///
/// Apart from the backend-reported [`NotFound`](Self::NotFound) and
/// [`AlreadyExists`](Self::AlreadyExists), these all describe a sequencing
/// problem rather than a storage problem: the caller's view of the cache went
/// stale while it was waiting, and the error tells it how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backend has no entry stored under the requested key.
    #[error("not found")]
    NotFound,
    /// The backend already has an entry stored under the requested key.
    #[error("already exists")]
    AlreadyExists,
    /// The backend is unavailable, or the operation failed for a reason that
    /// is not worth distinguishing to the caller.
    #[error("cache failure")]
    Failed,
    /// A concurrent doom or a failed create invalidated what this caller was
    /// waiting for. The whole cache interaction has to be restarted from
    /// scratch.
    #[error("raced with a concurrent cache change")]
    Race,
    /// This create lost against a concurrent create that succeeded first. The
    /// caller should not retry as a create; opening the winner is fine.
    #[error("lost the entry creation race")]
    CreateFailure,
}

/// Result alias used throughout the cache.
pub type CacheResult<T = ()> = Result<T, CacheError>;

/// Outcome of a cache operation that may suspend on backend I/O.
///
/// `Pending` promises exactly one later notification through the initiating
/// transaction's delegate, unless the transaction is cancelled first, in
/// which case no notification is delivered at all.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum OpStatus<T = ()> {
    /// The operation completed without suspending.
    Done(CacheResult<T>),
    /// The operation will complete through the transaction's delegate.
    Pending,
}

impl<T> OpStatus<T> {
    /// Returns `true` if the operation is still in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, OpStatus::Pending)
    }

    /// Returns the final result, or `None` if the operation is still in
    /// flight.
    pub fn done(self) -> Option<CacheResult<T>> {
        match self {
            OpStatus::Done(result) => Some(result),
            OpStatus::Pending => None,
        }
    }
}
