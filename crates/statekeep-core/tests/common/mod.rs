//! Shared fixtures for the persistence integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use statekeep_core::{ExceptionSink, PersistenceError};
use statekeep_storage::{
    BackendFactory, Entries, KeyValueBackend, MemoryBackend, MemoryFactory, StorageError,
};
use tokio::sync::RwLock;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};

/// Wraps a [`MemoryBackend`], logging every call and injecting faults.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub inner: MemoryBackend,
    pub sets: Mutex<Vec<Entries>>,
    pub removes: Mutex<Vec<Vec<String>>>,
    pub reopens: AtomicUsize,
    pub fail_sets: AtomicBool,
    pub fail_removes: AtomicBool,
    /// Number of upcoming calls that fail with `ConnectionClosed`.
    pub closed_calls: AtomicUsize,
    /// Held for writing by a test to stall `set` calls.
    pub write_gate: RwLock<()>,
    /// Held for writing by a test to stall `get` calls.
    pub read_gate: RwLock<()>,
    /// `get` calls currently inside the backend.
    pub reads_in_flight: AtomicUsize,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_count(&self) -> usize {
        self.sets.lock().len()
    }

    pub fn last_set(&self) -> Option<Entries> {
        self.sets.lock().last().cloned()
    }

    pub async fn stored(&self, key: &str) -> Option<Value> {
        self.inner.get(&[key.to_owned()]).await.unwrap().remove(0)
    }

    fn check_closed(&self, operation: &str) -> Result<(), StorageError> {
        let closed = self
            .closed_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if closed {
            Err(StorageError::ConnectionClosed {
                operation: operation.to_owned(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl KeyValueBackend for RecordingBackend {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError> {
        self.reads_in_flight.fetch_add(1, Ordering::SeqCst);
        let result = {
            let _gate = self.read_gate.read().await;
            match self.check_closed("get") {
                Ok(()) => self.inner.get(keys).await,
                Err(e) => Err(e),
            }
        };
        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn set(&self, entries: &Entries) -> Result<(), StorageError> {
        let _gate = self.write_gate.read().await;
        self.check_closed("set")?;
        self.sets.lock().push(entries.clone());
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(StorageError::Write {
                key: "batch".to_owned(),
                reason: "injected failure".to_owned(),
            });
        }
        self.inner.set(entries).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        self.check_closed("remove")?;
        self.removes.lock().push(keys.to_vec());
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(StorageError::Delete {
                key: keys.join(","),
                reason: "injected failure".to_owned(),
            });
        }
        self.inner.remove(keys).await
    }

    async fn reset(&self) -> Result<(), StorageError> {
        self.inner.reset().await
    }

    async fn reopen(&self) -> Result<(), StorageError> {
        self.reopens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one [`RecordingBackend`] per store name.
#[derive(Debug, Default)]
pub struct RecordingFactory {
    pub stores: Mutex<HashMap<String, Arc<RecordingBackend>>>,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn store(&self, name: &str) -> Arc<RecordingBackend> {
        Arc::clone(
            self.stores
                .lock()
                .entry(name.to_owned())
                .or_insert_with(RecordingBackend::new),
        )
    }
}

#[async_trait::async_trait]
impl BackendFactory for RecordingFactory {
    async fn open(
        &self,
        name: &str,
        _version: u32,
    ) -> Result<Arc<dyn KeyValueBackend>, StorageError> {
        let backend: Arc<dyn KeyValueBackend> = self.store(name);
        Ok(backend)
    }
}

/// Factory whose medium refuses mutations, or fails outright.
#[derive(Debug)]
pub struct FailingFactory {
    pub mutations_disallowed: bool,
    pub attempts: AtomicUsize,
}

impl FailingFactory {
    pub fn read_only() -> Arc<Self> {
        Arc::new(Self {
            mutations_disallowed: true,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            mutations_disallowed: false,
            attempts: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl BackendFactory for FailingFactory {
    async fn open(
        &self,
        name: &str,
        _version: u32,
    ) -> Result<Arc<dyn KeyValueBackend>, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.mutations_disallowed {
            Err(StorageError::MutationsDisallowed {
                name: name.to_owned(),
                reason: "read-only medium".to_owned(),
            })
        } else {
            Err(StorageError::Open {
                path: name.to_owned(),
                reason: "injected failure".to_owned(),
            })
        }
    }
}

/// Counts captured exceptions.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub captured: Mutex<Vec<String>>,
}

impl CountingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.captured.lock().len()
    }
}

impl ExceptionSink for CountingSink {
    fn capture(&self, error: &PersistenceError) {
        self.captured.lock().push(error.to_string());
    }
}

/// A memory factory with its concrete type kept for inspection.
pub fn memory_factory() -> Arc<MemoryFactory> {
    Arc::new(MemoryFactory::new())
}

/// Let spawned tasks run until they block.
pub async fn settle_tasks() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// A warning event: its message and optional `key` field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Warning {
    pub message: String,
    pub key: Option<String>,
}

impl Visit for Warning {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "key" => self.key = Some(format!("{value:?}")),
            _ => {}
        }
    }
}

/// Layer that records every WARN event.
#[derive(Debug, Clone, Default)]
pub struct WarningLayer {
    pub warnings: Arc<Mutex<Vec<Warning>>>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            let mut warning = Warning::default();
            event.record(&mut warning);
            self.warnings.lock().push(warning);
        }
    }
}

/// Route this thread's events into a fresh [`WarningLayer`] until the guard drops.
pub fn record_warnings() -> (WarningLayer, tracing::subscriber::DefaultGuard) {
    let layer = WarningLayer::default();
    let subscriber = tracing_subscriber::registry().with(layer.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (layer, guard)
}
