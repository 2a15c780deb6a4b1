use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::backend::{Backend, BackendEntry, BackendFactory};
use crate::config::{CacheMode, Config};
use crate::entry::{ActiveEntry, EntryRef};
use crate::error::{CacheError, CacheResult, OpStatus};
use crate::key::{CacheKey, KeyGenerator, RequestInfo};
use crate::metric;
use crate::pending::{OpKey, PendingOp, WorkItem, WorkOperation};
use crate::transaction::{LoadState, Mode, Transaction, TransactionDelegate};
use crate::utils::poll_once;

/// The backend, or a channel that will yield it once construction finishes.
pub enum MaybeBackend {
    /// The backend is live.
    Ready(Arc<dyn Backend>),
    /// Construction is in flight; the receiver resolves when it completes.
    /// If the cache is dropped first, the receiver resolves to a channel
    /// error instead.
    Pending(oneshot::Receiver<CacheResult<Arc<dyn Backend>>>),
}

struct State {
    backend: Option<Arc<dyn Backend>>,
    /// Consumed by the first backend construction that completes.
    backend_factory: Option<Arc<dyn BackendFactory>>,
    building_backend: bool,
    key_generator: KeyGenerator,
    next_entry_id: u64,
    /// Every live entry, doomed ones included, addressed by token.
    entries: HashMap<EntryRef, ActiveEntry>,
    /// Key lookup for entries that have not been doomed.
    active_entries: HashMap<CacheKey, EntryRef>,
    /// Entries detached from key lookup but still held by transactions.
    doomed_entries: HashSet<EntryRef>,
    /// At most one in-flight backend call per key.
    pending_ops: HashMap<OpKey, PendingOp>,
}

impl State {
    /// Registers an opened backend entry in the lookup table and hands out
    /// its token. Refuses to stomp an entry that is already active under the
    /// key.
    fn activate_entry(
        &mut self,
        key: &CacheKey,
        disk_entry: Arc<dyn BackendEntry>,
    ) -> Option<EntryRef> {
        if self.active_entries.contains_key(key) {
            tracing::error!(%key, "attempted to activate a key that is already active");
            return None;
        }
        let id = EntryRef(self.next_entry_id);
        self.next_entry_id += 1;
        self.entries
            .insert(id, ActiveEntry::new(key.clone(), disk_entry));
        self.active_entries.insert(key.clone(), id);
        tracing::trace!(%key, "activated cache entry");
        Some(id)
    }

    /// Removes an entry from all tables and closes its backend handle.
    fn destroy_entry(&mut self, id: EntryRef) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        debug_assert!(entry.writer.is_none());
        debug_assert!(entry.readers.is_empty());
        debug_assert!(entry.pending_queue.is_empty());
        if entry.doomed {
            self.doomed_entries.remove(&id);
        } else {
            debug_assert!(!entry.will_process_pending_queue);
            if self.active_entries.get(&entry.key) == Some(&id) {
                self.active_entries.remove(&entry.key);
            } else {
                tracing::error!(key = %entry.key, "entry table out of sync during deactivation");
            }
        }
        tracing::trace!(key = %entry.key, doomed = entry.doomed, "destroyed cache entry");
        // Dropping the entry closes the backend handle.
    }

    fn remove_pending_transaction_from_entry(&mut self, id: EntryRef, trans: &Transaction) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let before = entry.pending_queue.len();
        entry.pending_queue.retain(|queued| !queued.matches(trans));
        before != entry.pending_queue.len()
    }
}

fn remove_pending_transaction_from_op(op: &mut PendingOp, trans: &Transaction) -> bool {
    if op.writer.as_ref().is_some_and(|item| item.matches(trans)) {
        // The backend call itself cannot be cancelled. Detach the
        // transaction and the entry slot so the result is discarded when the
        // call completes.
        if let Some(writer) = op.writer.as_mut() {
            writer.clear_transaction();
            writer.clear_entry();
        }
        return true;
    }
    let before = op.pending_queue.len();
    op.pending_queue.retain(|item| !item.matches(trans));
    before != op.pending_queue.len()
}

struct CacheInner {
    runtime: tokio::runtime::Handle,
    state: Mutex<State>,
}

/// Coordinates transactions against a disk-backed cache of HTTP responses.
///
/// For any given key, the cache serializes access to the stored entry under a
/// multi-reader, single-writer discipline with FIFO admission, coalesces
/// concurrent backend calls, and converts lost races into
/// [`CacheError::Race`] so the losing transaction can restart. See the crate
/// docs for the full model.
///
/// Cloning is cheap and clones share all state. When the last clone is
/// dropped, every entry handle is closed and outstanding backend calls are
/// left to finish on their own with their results discarded; transactions
/// still queued at that point are never notified.
#[derive(Clone)]
pub struct HttpCache {
    inner: Arc<CacheInner>,
}

enum EnqueueOutcome {
    /// The caller became the lead for its key and must issue the backend
    /// call on this backend.
    Lead(Arc<dyn Backend>),
    /// The request was queued behind an in-flight call.
    Queued,
    Rejected(CacheError),
}

impl HttpCache {
    /// Creates a cache that will lazily construct its backend through
    /// `factory`.
    ///
    /// All deferred work is spawned on `runtime`; completions are delivered
    /// from those tasks.
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        config: Config,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        HttpCache {
            inner: Arc::new(CacheInner {
                runtime,
                state: Mutex::new(State {
                    backend: None,
                    backend_factory: Some(factory),
                    building_backend: false,
                    key_generator: KeyGenerator::new(config.mode),
                    next_entry_id: 0,
                    entries: HashMap::new(),
                    active_entries: HashMap::new(),
                    doomed_entries: HashSet::new(),
                    pending_ops: HashMap::new(),
                }),
            }),
        }
    }

    /// The configured operating mode.
    pub fn mode(&self) -> CacheMode {
        self.inner.state.lock().key_generator.mode()
    }

    /// Creates a transaction handle with the given access mode.
    ///
    /// Creating the first transaction kicks off backend construction so the
    /// backend is warming up while the transaction works out what it needs.
    pub fn create_transaction(
        &self,
        mode: Mode,
        delegate: Arc<dyn TransactionDelegate>,
    ) -> Transaction {
        let backend_missing = self.inner.state.lock().backend.is_none();
        if backend_missing {
            let _ = self.create_backend(None);
        }
        Transaction::new(mode, delegate)
    }

    /// Returns the backend, starting construction if necessary.
    ///
    /// With no backend factory left after a failed construction, this fails
    /// with [`CacheError::Failed`].
    pub fn get_backend(&self) -> CacheResult<MaybeBackend> {
        {
            let state = self.inner.state.lock();
            if let Some(backend) = &state.backend {
                return Ok(MaybeBackend::Ready(Arc::clone(backend)));
            }
        }
        let (tx, rx) = oneshot::channel();
        match self.create_backend(Some(tx)) {
            OpStatus::Done(Ok(backend)) => Ok(MaybeBackend::Ready(backend)),
            OpStatus::Done(Err(err)) => Err(err),
            OpStatus::Pending => Ok(MaybeBackend::Pending(rx)),
        }
    }

    /// Returns the backend if it is already live.
    pub fn current_backend(&self) -> Option<Arc<dyn Backend>> {
        self.inner.state.lock().backend.clone()
    }

    /// Computes the storage key for a request according to the configured
    /// [`CacheMode`].
    pub fn generate_cache_key(&self, request: &RequestInfo) -> CacheResult<CacheKey> {
        self.inner.state.lock().key_generator.generate(request)
    }

    /// Returns the entry stored under `key`.
    ///
    /// Completes immediately when the entry is already active. Otherwise a
    /// backend open is issued, coalescing with any call already in flight for
    /// the key, and the transaction is notified later.
    pub fn open_entry(&self, key: &CacheKey, trans: &Transaction) -> OpStatus<EntryRef> {
        let backend = {
            let mut state = self.inner.state.lock();
            if let Some(&id) = state.active_entries.get(key) {
                metric!(counter("cache.entry.open") += 1, "outcome" => "active");
                return OpStatus::Done(Ok(id));
            }
            match self.enqueue_entry_op(&mut state, WorkOperation::OpenEntry, key, trans) {
                EnqueueOutcome::Lead(backend) => backend,
                EnqueueOutcome::Queued => return OpStatus::Pending,
                EnqueueOutcome::Rejected(err) => return OpStatus::Done(Err(err)),
            }
        };
        tracing::trace!(%key, "opening cache entry");
        let fut = backend.open_entry(key);
        let fut = async move { fut.await.map(Some) }.boxed();
        match self.finish_entry_op(OpKey::Entry(key.clone()), fut) {
            None => OpStatus::Pending,
            Some((Ok(()), Some(id))) => OpStatus::Done(Ok(id)),
            Some((Ok(()), None)) => OpStatus::Done(Err(CacheError::Failed)),
            Some((Err(err), _)) => OpStatus::Done(Err(err)),
        }
    }

    /// Creates a fresh entry under `key`.
    ///
    /// The caller must have doomed any previous entry for the key first, so
    /// no active entry exists when this is called.
    pub fn create_entry(&self, key: &CacheKey, trans: &Transaction) -> OpStatus<EntryRef> {
        let backend = {
            let mut state = self.inner.state.lock();
            if state.active_entries.contains_key(key) {
                tracing::error!(%key, "create requested while an entry is active");
                return OpStatus::Done(Err(CacheError::Failed));
            }
            match self.enqueue_entry_op(&mut state, WorkOperation::CreateEntry, key, trans) {
                EnqueueOutcome::Lead(backend) => backend,
                EnqueueOutcome::Queued => return OpStatus::Pending,
                EnqueueOutcome::Rejected(err) => return OpStatus::Done(Err(err)),
            }
        };
        tracing::trace!(%key, "creating cache entry");
        let fut = backend.create_entry(key);
        let fut = async move { fut.await.map(Some) }.boxed();
        match self.finish_entry_op(OpKey::Entry(key.clone()), fut) {
            None => OpStatus::Pending,
            Some((Ok(()), Some(id))) => OpStatus::Done(Ok(id)),
            Some((Ok(()), None)) => OpStatus::Done(Err(CacheError::Failed)),
            Some((Err(err), _)) => OpStatus::Done(Err(err)),
        }
    }

    /// Dooms the entry stored under `key`.
    ///
    /// An active entry is detached on the spot: it disappears from key
    /// lookup, its current holders keep using it, and it is destroyed once
    /// the last of them leaves. Without an active entry this falls back to
    /// [`async_doom_entry`](Self::async_doom_entry).
    pub fn doom_entry(&self, key: &CacheKey, trans: &Transaction) -> OpStatus<()> {
        let backend = {
            let mut state = self.inner.state.lock();
            if let Some(&id) = state.active_entries.get(key) {
                state.active_entries.remove(key);
                state.doomed_entries.insert(id);
                let Some(entry) = state.entries.get_mut(&id) else {
                    tracing::error!(%key, "active entry table points at a missing entry");
                    state.doomed_entries.remove(&id);
                    return OpStatus::Done(Err(CacheError::Failed));
                };
                entry.disk_entry.doom();
                entry.doomed = true;
                debug_assert!(entry.has_users() || !entry.pending_queue.is_empty());
                tracing::trace!(%key, "doomed active cache entry");
                metric!(counter("cache.entry.doomed") += 1, "reason" => "active");
                return OpStatus::Done(Ok(()));
            }
            match self.enqueue_entry_op(&mut state, WorkOperation::DoomEntry, key, trans) {
                EnqueueOutcome::Lead(backend) => backend,
                EnqueueOutcome::Queued => return OpStatus::Pending,
                EnqueueOutcome::Rejected(err) => return OpStatus::Done(Err(err)),
            }
        };
        self.issue_doom(backend, key)
    }

    /// Dooms the entry stored under `key` through the backend.
    ///
    /// Work items queued behind the doom for the same key are failed with
    /// [`CacheError::Race`] when it completes, since anything sequenced after
    /// a doom has to restart.
    pub fn async_doom_entry(&self, key: &CacheKey, trans: &Transaction) -> OpStatus<()> {
        let backend = {
            let mut state = self.inner.state.lock();
            match self.enqueue_entry_op(&mut state, WorkOperation::DoomEntry, key, trans) {
                EnqueueOutcome::Lead(backend) => backend,
                EnqueueOutcome::Queued => return OpStatus::Pending,
                EnqueueOutcome::Rejected(err) => return OpStatus::Done(Err(err)),
            }
        };
        self.issue_doom(backend, key)
    }

    fn issue_doom(&self, backend: Arc<dyn Backend>, key: &CacheKey) -> OpStatus<()> {
        tracing::trace!(%key, "dooming cache entry");
        let fut = backend.doom_entry(key);
        let fut = async move { fut.await.map(|()| None) }.boxed();
        match self.finish_entry_op(OpKey::Entry(key.clone()), fut) {
            None => OpStatus::Pending,
            Some((status, _)) => OpStatus::Done(status),
        }
    }

    /// Admits a transaction to an entry, or queues it.
    ///
    /// An entry has at most one writer and, while a writer is attached, no
    /// readers. Queued transactions are admitted in arrival order; a queued
    /// writer additionally waits until the readers have drained.
    pub fn add_transaction(&self, entry: EntryRef, trans: &Transaction) -> OpStatus<()> {
        let mut state = self.inner.state.lock();
        self.add_transaction_locked(&mut state, entry, trans)
    }

    fn add_transaction_locked(
        &self,
        state: &mut State,
        id: EntryRef,
        trans: &Transaction,
    ) -> OpStatus<()> {
        let Some(entry) = state.entries.get_mut(&id) else {
            tracing::error!("admission requested for an entry that no longer exists");
            return OpStatus::Done(Err(CacheError::Failed));
        };
        if entry.writer.is_some() || entry.will_process_pending_queue {
            entry.pending_queue.push_back(trans.clone());
            return OpStatus::Pending;
        }
        if trans.mode().writes() {
            if entry.readers.is_empty() {
                entry.writer = Some(trans.clone());
            } else {
                entry.pending_queue.push_back(trans.clone());
                return OpStatus::Pending;
            }
        } else {
            entry.readers.push(trans.clone());
        }
        // Scheduling the drain before reporting the admission forces any
        // later arrival into the queue, behind the transactions already
        // waiting.
        if entry.writer.is_none() && !entry.pending_queue.is_empty() {
            self.process_pending_queue(state, id);
        }
        OpStatus::Done(Ok(()))
    }

    /// Releases a transaction's hold on an entry.
    ///
    /// For the writer, `cancel` says the write was abandoned midway; the
    /// transaction's delegate decides via
    /// [`add_truncated_flag`](TransactionDelegate::add_truncated_flag)
    /// whether the entry is still worth keeping. A writer that finished
    /// normally should use [`done_writing_to_entry`](Self::done_writing_to_entry)
    /// instead.
    pub fn done_with_entry(&self, entry: EntryRef, trans: &Transaction, cancel: bool) {
        let victims = {
            let mut state = self.inner.state.lock();
            let Some(active) = state.entries.get_mut(&entry) else {
                return;
            };
            // A posted drain already covers this release.
            if active.will_process_pending_queue && active.readers.is_empty() {
                return;
            }
            if active.writer.is_some() {
                if !active.writer.as_ref().is_some_and(|w| w.matches(trans)) {
                    tracing::warn!("releasing transaction does not hold the entry");
                    return;
                }
                let mut success = false;
                if cancel {
                    success = trans.add_truncated_flag();
                }
                self.done_writing_locked(&mut state, entry, success)
            } else {
                match active.readers.iter().position(|r| r.matches(trans)) {
                    Some(pos) => {
                        active.readers.remove(pos);
                    }
                    None => {
                        tracing::warn!("releasing transaction is not a reader of the entry");
                        return;
                    }
                }
                self.process_pending_queue(&mut state, entry);
                Vec::new()
            }
        };
        for victim in victims {
            victim.deliver(Err(CacheError::Race));
        }
    }

    /// Releases the writer of an entry.
    ///
    /// On success the queue drains and the next transactions are admitted.
    /// On failure the entry contents are no good: the backend entry is
    /// doomed, the active entry is destroyed, and every queued transaction is
    /// failed with [`CacheError::Race`] so it restarts from scratch.
    pub fn done_writing_to_entry(&self, entry: EntryRef, success: bool) {
        let victims = {
            let mut state = self.inner.state.lock();
            let Some(active) = state.entries.get_mut(&entry) else {
                return;
            };
            if active.writer.is_none() {
                tracing::warn!("no writer to release on the entry");
                return;
            }
            self.done_writing_locked(&mut state, entry, success)
        };
        for victim in victims {
            victim.deliver(Err(CacheError::Race));
        }
    }

    fn done_writing_locked(
        &self,
        state: &mut State,
        id: EntryRef,
        success: bool,
    ) -> Vec<Transaction> {
        let Some(entry) = state.entries.get_mut(&id) else {
            return Vec::new();
        };
        debug_assert!(entry.readers.is_empty());
        entry.writer = None;
        if success {
            self.process_pending_queue(state, id);
            return Vec::new();
        }
        debug_assert!(!entry.will_process_pending_queue);
        let victims = Vec::from(std::mem::take(&mut entry.pending_queue));
        entry.disk_entry.doom();
        state.destroy_entry(id);
        metric!(counter("cache.entry.doomed") += 1, "reason" => "write_failure");
        victims
    }

    /// Turns the writer of an entry into its sole reader.
    ///
    /// Only meaningful for a [`Mode::ReadWrite`] writer that validated the
    /// stored response and will serve it unchanged: queued readers can then
    /// be admitted alongside it.
    pub fn convert_writer_to_reader(&self, entry: EntryRef) {
        let mut state = self.inner.state.lock();
        let Some(active) = state.entries.get_mut(&entry) else {
            return;
        };
        let Some(writer) = active.writer.take() else {
            tracing::warn!("no writer to convert on the entry");
            return;
        };
        debug_assert!(writer.mode() == Mode::ReadWrite);
        debug_assert!(active.readers.is_empty());
        active.readers.push(writer);
        self.process_pending_queue(&mut state, entry);
    }

    /// Reports what a transaction queued in the cache is waiting on.
    pub fn get_load_state_for_pending(&self, trans: &Transaction) -> LoadState {
        let writer = {
            let state = self.inner.state.lock();
            let Some(key) = trans.key() else {
                return LoadState::WaitingForCache;
            };
            let Some(&id) = state.active_entries.get(&key) else {
                // Still creating the backend or the entry.
                return LoadState::WaitingForCache;
            };
            state.entries.get(&id).and_then(|e| e.writer.clone())
        };
        match writer {
            Some(writer) => writer.writer_load_state(),
            None => LoadState::WaitingForCache,
        }
    }

    /// Removes a transaction that aborted before it was admitted.
    ///
    /// After this returns, the transaction's delegate will not hear about any
    /// operation it had in flight; backend calls issued on its behalf keep
    /// running and their results are discarded.
    pub fn remove_pending_transaction(&self, trans: &Transaction) {
        let mut state = self.inner.state.lock();
        let key = trans.key();
        if let Some(key) = &key {
            if let Some(&id) = state.active_entries.get(key) {
                if state.remove_pending_transaction_from_entry(id, trans) {
                    return;
                }
            }
            if let Some(op) = state.pending_ops.get_mut(&OpKey::Entry(key.clone())) {
                if remove_pending_transaction_from_op(op, trans) {
                    return;
                }
            }
        }
        if state.building_backend {
            if let Some(op) = state.pending_ops.get_mut(&OpKey::CreateBackend) {
                if remove_pending_transaction_from_op(op, trans) {
                    return;
                }
            }
        }
        let doomed: Vec<EntryRef> = state.doomed_entries.iter().copied().collect();
        for id in doomed {
            if state.remove_pending_transaction_from_entry(id, trans) {
                return;
            }
        }
        tracing::warn!(?key, "pending transaction not found");
    }

    /// Registers a work item for `key`, becoming the lead or queueing behind
    /// the in-flight call. With no backend yet, the item instead queues on
    /// the backend-creation gate and the transaction retries once notified.
    fn enqueue_entry_op(
        &self,
        state: &mut State,
        operation: WorkOperation,
        key: &CacheKey,
        trans: &Transaction,
    ) -> EnqueueOutcome {
        let backend = match state.backend.clone() {
            Some(backend) => backend,
            None => {
                if !state.building_backend {
                    return EnqueueOutcome::Rejected(CacheError::Failed);
                }
                return match state.pending_ops.get_mut(&OpKey::CreateBackend) {
                    Some(op) if op.writer.is_some() => {
                        op.pending_queue.push_back(WorkItem::for_transaction(
                            WorkOperation::CreateBackend,
                            trans.clone(),
                        ));
                        EnqueueOutcome::Queued
                    }
                    _ => {
                        tracing::error!("backend marked as building without a creation in flight");
                        EnqueueOutcome::Rejected(CacheError::Failed)
                    }
                };
            }
        };
        debug_assert!(!state.active_entries.contains_key(key));
        let op = state
            .pending_ops
            .entry(OpKey::Entry(key.clone()))
            .or_default();
        let item = WorkItem::for_transaction(operation, trans.clone());
        if op.writer.is_some() {
            op.pending_queue.push_back(item);
            metric!(counter("cache.pending.coalesced") += 1);
            return EnqueueOutcome::Queued;
        }
        debug_assert!(op.pending_queue.is_empty());
        op.writer = Some(item);
        EnqueueOutcome::Lead(backend)
    }

    /// Completes an entry operation in place if the backend resolved it on
    /// the first poll, or hands the rest of the future to a driver task.
    /// Returns `None` while the call is in flight.
    fn finish_entry_op(
        &self,
        op_key: OpKey,
        mut fut: BoxFuture<'static, CacheResult<Option<Arc<dyn BackendEntry>>>>,
    ) -> Option<(CacheResult<()>, Option<EntryRef>)> {
        if let Some(result) = poll_once(&mut fut) {
            return Some(self.on_io_complete(op_key, result, true));
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            let result = fut.await;
            match weak.upgrade() {
                Some(inner) => {
                    HttpCache { inner }.on_io_complete(op_key, result, false);
                }
                None => {
                    // The cache is gone; release the handle and move on.
                    if let Ok(Some(disk_entry)) = result {
                        disk_entry.close();
                    }
                }
            }
        });
        None
    }

    /// Resolves a completed backend call for one key: activates the entry for
    /// the lead item, then settles every coalesced item in arrival order.
    ///
    /// The pending op is deleted and its queue snapshotted before anything is
    /// notified, so requests issued from inside a notification land on a
    /// fresh op instead of attaching to this one. With `sync` set, the lead's
    /// transaction is detached first and the outcome is conveyed through the
    /// return value instead.
    fn on_io_complete(
        &self,
        op_key: OpKey,
        result: CacheResult<Option<Arc<dyn BackendEntry>>>,
        sync: bool,
    ) -> (CacheResult<()>, Option<EntryRef>) {
        let status: CacheResult<()> = result.as_ref().map(|_| ()).map_err(|err| *err);
        let (mut lead, pending_items, mut fail_requests, entry, key) = {
            let mut state = self.inner.state.lock();
            let Some(mut op) = state.pending_ops.remove(&op_key) else {
                if let Ok(Some(disk_entry)) = &result {
                    disk_entry.close();
                }
                return (Err(CacheError::Failed), None);
            };
            let Some(mut lead) = op.writer.take() else {
                tracing::error!("pending operation completed without a lead work item");
                if let Ok(Some(disk_entry)) = &result {
                    disk_entry.close();
                }
                return (Err(CacheError::Failed), None);
            };
            if sync {
                lead.clear_transaction();
            }
            let mut fail_requests = false;
            let mut entry = None;
            let mut key = None;
            if let Ok(maybe_entry) = &result {
                if lead.operation() == WorkOperation::DoomEntry {
                    // Anything sequenced after a doom has to restart.
                    fail_requests = true;
                } else if let Some(disk_entry) = maybe_entry {
                    if lead.is_valid() {
                        let entry_key = disk_entry.key();
                        match state.activate_entry(&entry_key, Arc::clone(disk_entry)) {
                            Some(id) => {
                                entry = Some(id);
                                key = Some(entry_key);
                            }
                            None => {
                                disk_entry.close();
                                fail_requests = true;
                            }
                        }
                    } else {
                        // The initiating transaction is gone; discard what
                        // the backend produced.
                        if lead.operation() == WorkOperation::CreateEntry {
                            disk_entry.doom();
                        }
                        disk_entry.close();
                        fail_requests = true;
                    }
                } else {
                    tracing::error!("backend completion carried no entry handle");
                    fail_requests = true;
                }
            }
            let pending_items = std::mem::take(&mut op.pending_queue);
            (lead, pending_items, fail_requests, entry, key)
        };

        lead.notify_transaction(status, entry);

        let lead_op = lead.operation();
        for mut item in pending_items {
            if item.operation() == WorkOperation::DoomEntry {
                fail_requests = true;
            } else if status.is_ok() && !fail_requests {
                // A notified transaction may have doomed the entry already.
                let state = self.inner.state.lock();
                let still_active = key.as_ref().and_then(|k| state.active_entries.get(k).copied());
                if still_active != entry {
                    fail_requests = true;
                }
            }
            if fail_requests {
                metric!(counter("cache.entry.race") += 1);
                item.notify_transaction(Err(CacheError::Race), None);
                continue;
            }
            if item.operation() == WorkOperation::CreateEntry {
                if status.is_ok() {
                    // Only one create can win the key.
                    metric!(counter("cache.entry.create_lost") += 1);
                    item.notify_transaction(Err(CacheError::CreateFailure), None);
                } else if lead_op != WorkOperation::CreateEntry {
                    // A failed open followed by a create: the create has to
                    // start over to see a consistent backend.
                    item.notify_transaction(Err(CacheError::Race), None);
                    fail_requests = true;
                } else {
                    item.notify_transaction(status, entry);
                }
            } else if lead_op == WorkOperation::CreateEntry && status.is_err() {
                // A failed create followed by an open.
                item.notify_transaction(Err(CacheError::Race), None);
                fail_requests = true;
            } else {
                item.notify_transaction(status, entry);
            }
        }
        (status, entry)
    }

    /// Starts backend construction, or joins the one already in flight.
    fn create_backend(
        &self,
        callback: Option<oneshot::Sender<CacheResult<Arc<dyn Backend>>>>,
    ) -> OpStatus<Arc<dyn Backend>> {
        let factory = {
            let mut state = self.inner.state.lock();
            let Some(factory) = state.backend_factory.clone() else {
                return OpStatus::Done(match &state.backend {
                    Some(backend) => Ok(Arc::clone(backend)),
                    None => Err(CacheError::Failed),
                });
            };
            state.building_backend = true;
            let item = WorkItem::for_backend(callback);
            let op = state.pending_ops.entry(OpKey::CreateBackend).or_default();
            if op.writer.is_some() {
                // Fire-and-forget requests do not need to hear the outcome.
                if item.has_backend_callback() {
                    op.pending_queue.push_back(item);
                }
                return OpStatus::Pending;
            }
            debug_assert!(op.pending_queue.is_empty());
            op.writer = Some(item);
            factory
        };
        tracing::debug!("creating cache backend");
        let mut fut = factory.create_backend();
        if let Some(result) = poll_once(&mut fut) {
            return OpStatus::Done(self.on_backend_created(result, true));
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            let result = fut.await;
            if let Some(inner) = weak.upgrade() {
                HttpCache { inner }.on_backend_created(result, false);
            }
        });
        OpStatus::Pending
    }

    /// Settles one waiter on the backend-creation gate.
    ///
    /// The first call installs the backend and consumes the factory. Each
    /// call settles exactly one waiter and, if more are queued, posts itself
    /// again: a waiter whose notification tears the cache down must not take
    /// the remaining waiters with it, and the repost checks the cache is
    /// still alive before touching it.
    fn on_backend_created(
        &self,
        result: CacheResult<Arc<dyn Backend>>,
        sync: bool,
    ) -> CacheResult<Arc<dyn Backend>> {
        let mut item = {
            let mut state = self.inner.state.lock();
            let Some(mut item) = state
                .pending_ops
                .get_mut(&OpKey::CreateBackend)
                .and_then(|op| op.writer.take())
            else {
                return result;
            };
            if sync {
                item.clear_backend_callback();
            }
            if state.backend_factory.is_some() {
                state.backend_factory = None;
                match &result {
                    Ok(backend) => {
                        state.backend = Some(Arc::clone(backend));
                        tracing::debug!("cache backend is live");
                        metric!(counter("cache.backend.created") += 1, "status" => "ok");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "cache backend construction failed");
                        metric!(counter("cache.backend.created") += 1, "status" => "error");
                    }
                }
            }
            let next = state
                .pending_ops
                .get_mut(&OpKey::CreateBackend)
                .and_then(|op| op.pending_queue.pop_front());
            match next {
                Some(next_item) => {
                    debug_assert!(next_item.operation() == WorkOperation::CreateBackend);
                    if let Some(op) = state.pending_ops.get_mut(&OpKey::CreateBackend) {
                        op.writer = Some(next_item);
                    }
                    let weak = Arc::downgrade(&self.inner);
                    let next_result = result.clone();
                    self.inner.runtime.spawn(async move {
                        if let Some(inner) = weak.upgrade() {
                            HttpCache { inner }.on_backend_created(next_result, false);
                        }
                    });
                }
                None => {
                    state.building_backend = false;
                    state.pending_ops.remove(&OpKey::CreateBackend);
                }
            }
            item
        };
        if !item.do_backend_callback(result.clone()) {
            item.notify_transaction(result.as_ref().map(|_| ()).map_err(|err| *err), None);
        }
        result
    }

    /// Schedules a deferred drain of the entry's pending queue.
    ///
    /// Several readers may release at once; one drain covers them all, and
    /// running it from a fresh task keeps a release from re-entering the
    /// entry it is releasing.
    fn process_pending_queue(&self, state: &mut State, id: EntryRef) {
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        if entry.will_process_pending_queue {
            return;
        }
        entry.will_process_pending_queue = true;
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                HttpCache { inner }.on_process_pending_queue(id);
            }
        });
    }

    fn on_process_pending_queue(&self, id: EntryRef) {
        let delivery = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            entry.will_process_pending_queue = false;
            debug_assert!(entry.writer.is_none());
            let queue_empty = entry.pending_queue.is_empty();
            let readers_empty = entry.readers.is_empty();
            if queue_empty {
                if readers_empty {
                    state.destroy_entry(id);
                }
                return;
            }
            // Promote the transaction at the head of the queue. A writer has
            // to wait for the readers to drain; it stays at the head so
            // nothing overtakes it.
            let head_writes = entry
                .pending_queue
                .front()
                .map(|t| t.mode().writes())
                .unwrap_or(false);
            if head_writes && !readers_empty {
                return;
            }
            let Some(next) = entry.pending_queue.pop_front() else {
                return;
            };
            match self.add_transaction_locked(&mut state, id, &next) {
                OpStatus::Done(status) => Some((next, status)),
                OpStatus::Pending => None,
            }
        };
        if let Some((trans, status)) = delivery {
            trans.deliver(status.map(|()| Some(id)));
        }
    }

    pub fn entry_snapshot(&self, id: EntryRef) -> Option<(bool, usize, usize, bool)> {
        let state = self.inner.state.lock();
        state.entries.get(&id).map(|entry| {
            (
                entry.writer.is_some(),
                entry.readers.len(),
                entry.pending_queue.len(),
                entry.doomed,
            )
        })
    }

    pub fn table_sizes(&self) -> (usize, usize, usize) {
        let state = self.inner.state.lock();
        (
            state.active_entries.len(),
            state.doomed_entries.len(),
            state.pending_ops.len(),
        )
    }
}
