//! Typed lifecycle events for query tracking.
//!
//! Every tracked driver call produces a [`QueryStarted`] record before the
//! round-trip and exactly one of [`QueryFinished`] / [`QueryFailed`] after it.
//! Stopping a client produces [`Stopped`]. Subscribers implement
//! [`QueryObserver`]; the [`ObserverSet`] fans each event out to all of them.
//! Emission never fails: with no subscribers it is a no-op, and a panicking
//! observer is isolated and logged rather than unwinding into the caller.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::error;

/// Caller-supplied identity of one logical operation: an operation name plus
/// optional opaque metadata (trace ids, tenant, ...). Immutable once a query
/// proxy has been minted with it; cloning is cheap.
#[derive(Debug, Clone)]
pub struct OperationContext {
    name: Arc<str>,
    metadata: Option<Arc<JsonValue>>,
}

impl OperationContext {
    /// Create a context carrying only an operation name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            metadata: None,
        }
    }

    /// Create a context with opaque caller metadata attached.
    pub fn with_metadata(name: impl Into<String>, metadata: JsonValue) -> Self {
        Self {
            name: Arc::from(name.into()),
            metadata: Some(Arc::new(metadata)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> Option<&JsonValue> {
        self.metadata.as_deref()
    }
}

/// A tracked driver call is about to be awaited.
#[derive(Debug, Clone)]
pub struct QueryStarted {
    pub context: OperationContext,
    pub method: &'static str,
    pub statement: String,
    pub started_at: DateTime<Utc>,
}

/// A tracked driver call resolved successfully.
#[derive(Debug, Clone)]
pub struct QueryFinished {
    pub context: OperationContext,
    pub method: &'static str,
    pub statement: String,
    /// Row count where the operation has one (fetches, rows-affected).
    pub rows: Option<u64>,
    pub elapsed: Duration,
}

/// A tracked driver call resolved with an error. The error itself propagates
/// to the caller unchanged; this record carries its rendering.
#[derive(Debug, Clone)]
pub struct QueryFailed {
    pub context: OperationContext,
    pub method: &'static str,
    pub statement: String,
    pub error: String,
    pub elapsed: Duration,
}

/// The owning client handle was stopped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stopped;

/// Subscriber interface for client lifecycle events. All hooks default to
/// no-ops so observers implement only what they care about.
pub trait QueryObserver: Send + Sync {
    fn on_query_started(&self, _event: &QueryStarted) {}
    fn on_query_finished(&self, _event: &QueryFinished) {}
    fn on_query_failed(&self, _event: &QueryFailed) {}
    fn on_stopped(&self, _event: &Stopped) {}
}

/// Fan-out set of subscribed observers.
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn QueryObserver>>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Observers cannot be removed; they live as long
    /// as the set.
    pub fn subscribe(&self, observer: Arc<dyn QueryObserver>) {
        self.read_write_guarded(|observers| observers.push(observer));
    }

    pub fn subscriber_count(&self) -> usize {
        self.for_each_count()
    }

    pub fn emit_started(&self, event: &QueryStarted) {
        self.for_each(|observer| observer.on_query_started(event));
    }

    pub fn emit_finished(&self, event: &QueryFinished) {
        self.for_each(|observer| observer.on_query_finished(event));
    }

    pub fn emit_failed(&self, event: &QueryFailed) {
        self.for_each(|observer| observer.on_query_failed(event));
    }

    pub fn emit_stopped(&self, event: &Stopped) {
        self.for_each(|observer| observer.on_stopped(event));
    }

    fn read_write_guarded(&self, f: impl FnOnce(&mut Vec<Arc<dyn QueryObserver>>)) {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut observers);
    }

    fn for_each(&self, f: impl Fn(&dyn QueryObserver)) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                error!("query observer panicked during event dispatch");
            }
        }
    }

    fn for_each_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
