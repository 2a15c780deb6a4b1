//! Helpers for testing the cache coordination layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - The mock backend completes calls immediately by default. Call
//!    [`MockBackend::defer`] (or build the factory with
//!    [`MockBackendFactory::deferred`]) to hold calls back and release them
//!    one by one; this is how in-flight interleavings are staged.
//!
//!  - Completions are pushed into each [`TestTransaction`]'s channel as they
//!    are delivered. Await [`TestTransaction::completion`] for the next one,
//!    or call [`settle`] first and use [`TestTransaction::try_completion`] to
//!    assert that nothing arrived.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use cachefront::{
    Backend, BackendEntry, BackendFactory, CacheError, CacheKey, CacheResult, Completion,
    HttpCache, LoadState, Mode, Transaction, TransactionDelegate,
};

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from the `cachefront`
/// crate and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cachefront=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Runs every task the cache has spawned to completion.
///
/// Tests run on a current-thread runtime, so a bounded number of yields
/// guarantees that all posted completions, queue drains and reposts have
/// executed before the caller inspects the outcome.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Decides when mock backend calls complete.
///
/// In immediate mode, calls resolve on their first poll, exercising the
/// synchronous completion path of the cache. In deferred mode, each call
/// parks until the test releases it, in arrival order.
pub struct CallGate {
    immediate: AtomicBool,
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl CallGate {
    fn new(immediate: bool) -> Arc<Self> {
        Arc::new(CallGate {
            immediate: AtomicBool::new(immediate),
            waiters: Mutex::new(VecDeque::new()),
        })
    }

    pub fn set_immediate(&self, immediate: bool) {
        self.immediate.store(immediate, Ordering::SeqCst);
    }

    /// The number of calls waiting to be released.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Releases the oldest waiting call. Returns whether there was one.
    pub fn release_next(&self) -> bool {
        match self.waiters.lock().pop_front() {
            Some(tx) => {
                tx.send(()).ok();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        while self.release_next() {}
    }

    async fn pass(&self) {
        if self.immediate.load(Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(tx);
        // An abandoned gate still releases its waiters.
        let _ = rx.await;
    }
}

/// An entry handle produced by [`MockBackend`], with doom and close
/// accounting for leak checks.
pub struct MockEntry {
    key: String,
    doomed: AtomicBool,
    close_count: AtomicUsize,
}

impl MockEntry {
    fn new(key: String) -> Arc<Self> {
        Arc::new(MockEntry {
            key,
            doomed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        })
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    /// How many times the cache has closed this handle. Exactly one close is
    /// expected over an entry's lifetime.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

impl BackendEntry for MockEntry {
    fn key(&self) -> CacheKey {
        CacheKey::from(self.key.clone())
    }

    fn doom(&self) {
        self.doomed.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockBackendInner {
    gate: Arc<CallGate>,
    entries: Mutex<HashMap<String, Arc<MockEntry>>>,
}

/// An in-memory [`Backend`] with controllable completion timing.
///
/// Doomed entries vanish from the index but already opened handles keep
/// working, matching what a disk cache does.
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<MockBackendInner>,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            inner: Arc::new(MockBackendInner {
                gate: CallGate::new(true),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Holds back subsequent backend calls until released.
    pub fn defer(&self) {
        self.inner.gate.set_immediate(false);
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.gate.pending()
    }

    pub fn release_next(&self) -> bool {
        self.inner.gate.release_next()
    }

    pub fn release_all(&self) {
        self.inner.gate.release_all();
    }

    /// Stores an entry under `key`, as if a previous run had cached it.
    pub fn populate(&self, key: &str) -> Arc<MockEntry> {
        let entry = MockEntry::new(key.to_owned());
        self.inner
            .entries
            .lock()
            .insert(key.to_owned(), Arc::clone(&entry));
        entry
    }

    /// The entry currently stored under `key`, doomed or not.
    pub fn entry(&self, key: &str) -> Option<Arc<MockEntry>> {
        self.inner.entries.lock().get(key).cloned()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        MockBackend::new()
    }
}

impl Backend for MockBackend {
    fn open_entry(&self, key: &CacheKey) -> BoxFuture<'static, CacheResult<Arc<dyn BackendEntry>>> {
        let inner = Arc::clone(&self.inner);
        let key = key.as_str().to_owned();
        async move {
            inner.gate.pass().await;
            let entries = inner.entries.lock();
            match entries.get(&key) {
                Some(entry) if !entry.is_doomed() => Ok(Arc::clone(entry) as Arc<dyn BackendEntry>),
                _ => Err(CacheError::NotFound),
            }
        }
        .boxed()
    }

    fn create_entry(
        &self,
        key: &CacheKey,
    ) -> BoxFuture<'static, CacheResult<Arc<dyn BackendEntry>>> {
        let inner = Arc::clone(&self.inner);
        let key = key.as_str().to_owned();
        async move {
            inner.gate.pass().await;
            let mut entries = inner.entries.lock();
            let exists = entries.get(&key).is_some_and(|entry| !entry.is_doomed());
            if exists {
                return Err(CacheError::AlreadyExists);
            }
            let entry = MockEntry::new(key.clone());
            entries.insert(key, Arc::clone(&entry));
            Ok(entry as Arc<dyn BackendEntry>)
        }
        .boxed()
    }

    fn doom_entry(&self, key: &CacheKey) -> BoxFuture<'static, CacheResult<()>> {
        let inner = Arc::clone(&self.inner);
        let key = key.as_str().to_owned();
        async move {
            inner.gate.pass().await;
            let entries = inner.entries.lock();
            match entries.get(&key) {
                Some(entry) if !entry.is_doomed() => {
                    entry.doom();
                    Ok(())
                }
                _ => Err(CacheError::NotFound),
            }
        }
        .boxed()
    }
}

/// A [`BackendFactory`] producing a [`MockBackend`], with controllable
/// completion timing and failure injection.
pub struct MockBackendFactory {
    backend: MockBackend,
    gate: Arc<CallGate>,
    fail: AtomicBool,
}

impl MockBackendFactory {
    /// A factory that succeeds immediately.
    pub fn new(backend: MockBackend) -> Arc<Self> {
        Arc::new(MockBackendFactory {
            backend,
            gate: CallGate::new(true),
            fail: AtomicBool::new(false),
        })
    }

    /// A factory that parks construction until released.
    pub fn deferred(backend: MockBackend) -> Arc<Self> {
        let factory = MockBackendFactory::new(backend);
        factory.gate.set_immediate(false);
        factory
    }

    /// Makes subsequent constructions fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn pending_creates(&self) -> usize {
        self.gate.pending()
    }

    pub fn release_next(&self) -> bool {
        self.gate.release_next()
    }
}

impl BackendFactory for MockBackendFactory {
    fn create_backend(&self) -> BoxFuture<'static, CacheResult<Arc<dyn Backend>>> {
        let gate = Arc::clone(&self.gate);
        let backend = self.backend.clone();
        let fail = self.fail.load(Ordering::SeqCst);
        async move {
            gate.pass().await;
            if fail {
                Err(CacheError::Failed)
            } else {
                Ok(Arc::new(backend) as Arc<dyn Backend>)
            }
        }
        .boxed()
    }
}

type CompletionHook = Box<dyn FnMut(Completion) + Send>;

/// A [`TransactionDelegate`] that records everything the cache tells it.
///
/// Completions are forwarded into a channel; an optional hook runs
/// synchronously first and may re-enter the cache, which is how re-entrant
/// callback behavior is exercised.
pub struct TestDelegate {
    completions: mpsc::UnboundedSender<Completion>,
    truncate_result: AtomicBool,
    truncate_calls: AtomicUsize,
    load_state: Mutex<LoadState>,
    hook: Mutex<Option<CompletionHook>>,
}

impl TestDelegate {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let delegate = Arc::new(TestDelegate {
            completions: tx,
            truncate_result: AtomicBool::new(false),
            truncate_calls: AtomicUsize::new(0),
            load_state: Mutex::new(LoadState::WaitingForCache),
            hook: Mutex::new(None),
        });
        (delegate, rx)
    }

    /// Sets the value the next `add_truncated_flag` call reports.
    pub fn set_truncate_result(&self, keep_entry: bool) {
        self.truncate_result.store(keep_entry, Ordering::SeqCst);
    }

    /// How many times the cache asked to record a truncation.
    pub fn truncate_calls(&self) -> usize {
        self.truncate_calls.load(Ordering::SeqCst)
    }

    pub fn set_load_state(&self, load_state: LoadState) {
        *self.load_state.lock() = load_state;
    }

    /// Installs a hook that runs synchronously on every completion, before
    /// it is forwarded to the channel.
    pub fn set_hook(&self, hook: impl FnMut(Completion) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl TransactionDelegate for TestDelegate {
    fn on_cache_io_complete(&self, completion: Completion) {
        if let Some(hook) = self.hook.lock().as_mut() {
            hook(completion);
        }
        let _ = self.completions.send(completion);
    }

    fn add_truncated_flag(&self) -> bool {
        self.truncate_calls.fetch_add(1, Ordering::SeqCst);
        self.truncate_result.load(Ordering::SeqCst)
    }

    fn writer_load_state(&self) -> LoadState {
        *self.load_state.lock()
    }
}

/// A transaction bundled with its [`TestDelegate`] and completion channel.
pub struct TestTransaction {
    pub transaction: Transaction,
    pub delegate: Arc<TestDelegate>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl TestTransaction {
    pub fn new(cache: &HttpCache, mode: Mode) -> Self {
        let (delegate, completions) = TestDelegate::new();
        let transaction = cache.create_transaction(mode, delegate.clone());
        TestTransaction {
            transaction,
            delegate,
            completions,
        }
    }

    /// Creates the transaction and points it at `key`.
    pub fn with_key(cache: &HttpCache, mode: Mode, key: &str) -> Self {
        let test_transaction = TestTransaction::new(cache, mode);
        test_transaction.transaction.set_key(CacheKey::from(key));
        test_transaction
    }

    /// Waits for the next completion.
    pub async fn completion(&mut self) -> Completion {
        tokio::time::timeout(Duration::from_secs(5), self.completions.recv())
            .await
            .expect("timed out waiting for a cache completion")
            .expect("transaction delegate dropped")
    }

    /// Returns an already delivered completion, if any.
    pub fn try_completion(&mut self) -> Option<Completion> {
        self.completions.try_recv().ok()
    }
}
