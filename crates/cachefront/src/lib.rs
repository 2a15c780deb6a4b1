//! # HTTP cache coordination
//!
//! `cachefront` is the coordination layer that sits between HTTP transactions
//! and a disk-backed response cache. It does not store anything itself; it
//! owns the lifecycle of the entries that are currently in use and makes sure
//! that any number of concurrent transactions can work against the same
//! backend without stepping on each other.
//!
//! ## The coordination model
//!
//! Storage is provided by a pluggable [`Backend`] that can asynchronously
//! open, create and doom entries by key, and that is itself constructed
//! asynchronously on first use. Everything above it revolves around three
//! tables:
//!
//! - The **active entry table** maps each key to the in-memory entry that is
//!   currently open for it. An active entry has at most one writer, any
//!   number of readers when there is no writer, and a FIFO of transactions
//!   waiting for admission.
//! - The **pending op registry** keeps at most one in-flight backend call per
//!   key. The first request for a key issues the call; every request that
//!   arrives while it is in flight is queued behind it and settled in arrival
//!   order when the call completes.
//! - The **doomed set** holds entries that were removed from key lookup
//!   while transactions still hold them. A doomed entry keeps serving its
//!   current holders and is destroyed when the last one leaves.
//!
//! A transaction asks for an entry by key. On an active hit it gets the entry
//! immediately; otherwise a backend call is issued or joined, and the
//! transaction is notified through its [`TransactionDelegate`] once the
//! outcome is known. Admission then enforces the reader/writer discipline:
//! writers get the entry exclusively, readers share it, and a queued writer
//! waits until the readers have drained. Queue drains run from freshly
//! spawned tasks, one admission per drain, so a release never recurses into
//! the entry it is releasing and arrival order is preserved.
//!
//! ## Races
//!
//! Concurrent opens, creates and dooms of one key can interleave in many
//! ways, and a transaction that waited on somebody else's backend call may
//! find its assumptions stale by the time it is woken. The completion
//! protocol settles each coalesced waiter deterministically: a create that
//! lost to a winning create fails with [`CacheError::CreateFailure`], and
//! every waiter whose precondition evaporated (queued behind a doom, behind a
//! failed create, or bound to an entry that has since gone away) fails with
//! [`CacheError::Race`] and restarts its cache interaction from scratch. The
//! cache converts races into errors; it never retries on a transaction's
//! behalf.
//!
//! ## Backend construction
//!
//! The first operation that needs the backend kicks off its construction.
//! Transactions arriving before the backend is live queue up on the creation
//! gate and are notified one at a time, in arrival order, each from its own
//! task, once construction succeeds or fails.
//!
//! ## Metrics
//!
//! With statsd configured via [`metrics::configure_statsd`], the cache emits:
//!
//! - `cache.entry.open`: entry opens served from the active table.
//! - `cache.pending.coalesced`: backend calls avoided by joining one in
//!   flight.
//! - `cache.entry.race`: waiters failed with [`CacheError::Race`].
//! - `cache.entry.create_lost`: creates that lost to a concurrent create.
//! - `cache.entry.doomed`: entries retired, tagged with the reason.
//! - `cache.backend.created`: backend constructions, tagged with the outcome.

#[macro_use]
pub mod metrics;

pub mod backend;
mod cache;
pub mod config;
mod entry;
mod error;
pub mod key;
mod pending;
mod transaction;
mod utils;

pub use crate::backend::{Backend, BackendEntry, BackendFactory};
pub use crate::cache::{HttpCache, MaybeBackend};
pub use crate::config::{CacheMode, Config};
pub use crate::entry::EntryRef;
pub use crate::error::{CacheError, CacheResult, OpStatus};
pub use crate::key::{CacheKey, RequestInfo};
pub use crate::transaction::{Completion, LoadState, Mode, Transaction, TransactionDelegate};

