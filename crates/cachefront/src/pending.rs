//! Bookkeeping for in-flight backend calls.
//!
//! Every backend request goes through a [`PendingOp`]: the first work item
//! for a key becomes the lead and issues the actual backend call, everything
//! arriving later for the same key queues up behind it and is resolved in
//! arrival order when the call completes. This is what keeps the backend at
//! one outstanding call per key no matter how many transactions pile up.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::backend::Backend;
use crate::entry::EntryRef;
use crate::error::CacheResult;
use crate::key::CacheKey;
use crate::transaction::Transaction;

/// Registry key for a [`PendingOp`].
///
/// Backend construction is the one operation not tied to any cache key, so it
/// gets its own variant instead of a reserved key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum OpKey {
    CreateBackend,
    Entry(CacheKey),
}

/// The backend operation a work item asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkOperation {
    CreateBackend,
    OpenEntry,
    CreateEntry,
    DoomEntry,
}

/// One queued request against the backend, with everything needed to resolve
/// it.
///
/// An item stays valid while somebody still cares about its outcome: the
/// owning transaction, the entry slot it would fill, or an embedder callback.
/// Cancellation clears those, after which the item's result is discarded when
/// the backend call finally completes.
pub(crate) struct WorkItem {
    operation: WorkOperation,
    trans: Option<Transaction>,
    /// Whether the initiating call wants the resulting entry activated even
    /// if the transaction itself is no longer listening.
    wants_entry: bool,
    backend_tx: Option<oneshot::Sender<CacheResult<Arc<dyn Backend>>>>,
}

impl WorkItem {
    /// An item issued on behalf of a transaction.
    pub fn for_transaction(operation: WorkOperation, trans: Transaction) -> Self {
        let wants_entry = matches!(
            operation,
            WorkOperation::OpenEntry | WorkOperation::CreateEntry
        );
        WorkItem {
            operation,
            trans: Some(trans),
            wants_entry,
            backend_tx: None,
        }
    }

    /// A backend-creation item issued by the embedder, optionally with a
    /// channel for the outcome.
    pub fn for_backend(backend_tx: Option<oneshot::Sender<CacheResult<Arc<dyn Backend>>>>) -> Self {
        WorkItem {
            operation: WorkOperation::CreateBackend,
            trans: None,
            wants_entry: false,
            backend_tx,
        }
    }

    pub fn operation(&self) -> WorkOperation {
        self.operation
    }

    pub fn matches(&self, trans: &Transaction) -> bool {
        self.trans.as_ref().is_some_and(|t| t.matches(trans))
    }

    pub fn clear_transaction(&mut self) {
        self.trans = None;
    }

    pub fn clear_entry(&mut self) {
        self.wants_entry = false;
    }

    pub fn has_backend_callback(&self) -> bool {
        self.backend_tx.is_some()
    }

    /// Detaches the embedder callback; the outcome travels through the
    /// initiating call's return value instead.
    pub fn clear_backend_callback(&mut self) {
        self.backend_tx = None;
    }

    /// Whether anyone still cares about this item's outcome.
    pub fn is_valid(&self) -> bool {
        self.trans.is_some() || self.wants_entry || self.backend_tx.is_some()
    }

    /// Reports the outcome to the owning transaction, if it is still
    /// attached. Each item notifies at most once.
    pub fn notify_transaction(&mut self, status: CacheResult<()>, entry: Option<EntryRef>) {
        debug_assert!(entry.is_none() || status.is_ok());
        if let Some(trans) = self.trans.take() {
            trans.deliver(status.map(|()| entry));
        }
    }

    /// Reports the backend-creation outcome to the embedder callback.
    /// Returns whether a callback was attached.
    pub fn do_backend_callback(&mut self, result: CacheResult<Arc<dyn Backend>>) -> bool {
        match self.backend_tx.take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// A single outstanding backend call plus the work items coalesced onto it.
#[derive(Default)]
pub(crate) struct PendingOp {
    /// The item whose arrival issued the backend call.
    pub writer: Option<WorkItem>,
    /// Items that arrived while the call was in flight, in arrival order.
    pub pending_queue: VecDeque<WorkItem>,
}
