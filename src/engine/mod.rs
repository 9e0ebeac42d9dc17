//! Contract between the listener and a change-data-capture engine.
//!
//! The engine owns log tailing, snapshots and offsets. The listener only
//! creates it from [`EngineProperties`], runs it on its own task, waits for
//! the one-shot startup report, and feeds it a [`ChangeConsumer`] that
//! receives ordered batches of raw records.

pub mod json_lines;
pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub use json_lines::{JsonLinesEngine, JsonLinesEngineFactory};
pub use memory::{BatchSender, MemoryEngine};

/// One raw change record as emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub key: Option<String>,
    pub value: String,
}

impl ChangeRecord {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Acknowledges a delivered batch back to the engine.
#[async_trait]
pub trait RecordCommitter: Send {
    async fn mark_batch_finished(&mut self) -> Result<()>;
}

/// Receives batches from the engine.
#[async_trait]
pub trait ChangeConsumer: Send + Sync {
    /// Processes `records` in order and acknowledges them through `committer`.
    async fn handle_batch(&self, records: Vec<ChangeRecord>, committer: &mut dyn RecordCommitter);
}

/// Startup report sent by the engine exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    Started,
    Failed(String),
}

/// One-shot handshake used by [`Listener::start`](crate::Listener::start).
///
/// Only the first report counts; later ones are ignored.
#[derive(Debug, Clone)]
pub struct StartupSignal {
    sender: Arc<Mutex<Option<oneshot::Sender<StartupOutcome>>>>,
}

impl StartupSignal {
    pub fn channel() -> (Self, oneshot::Receiver<StartupOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Reports that the engine task is up. Returns false if a report was
    /// already sent.
    pub fn started(&self) -> bool {
        self.complete(StartupOutcome::Started)
    }

    pub fn failed(&self, message: impl Into<String>) -> bool {
        self.complete(StartupOutcome::Failed(message.into()))
    }

    pub fn is_reported(&self) -> bool {
        self.sender.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }

    fn complete(&self, outcome: StartupOutcome) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Everything an engine needs for one run.
pub struct EngineContext {
    pub properties: EngineProperties,
    pub consumer: Arc<dyn ChangeConsumer>,
    pub startup: StartupSignal,
    /// Tripped by an immediate stop; engines should stop without flushing.
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait CaptureEngine: Send + Sync + 'static {
    /// Runs the capture loop. Must report through `context.startup` once the
    /// engine is ready or has failed, then deliver batches until closed.
    async fn run(&self, context: EngineContext) -> Result<()>;

    /// Requests a clean shutdown: finish the batch in flight, release the
    /// source, and let `run` return.
    async fn close(&self) -> Result<()>;
}

pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self, properties: &EngineProperties) -> Result<Arc<dyn CaptureEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EngineProperties) -> Result<Arc<dyn CaptureEngine>> + Send + Sync + 'static,
{
    fn create(&self, properties: &EngineProperties) -> Result<Arc<dyn CaptureEngine>> {
        self(properties)
    }
}

/// Hands out the same engine instance on every start.
#[derive(Clone)]
pub struct SharedEngineFactory {
    engine: Arc<dyn CaptureEngine>,
}

impl SharedEngineFactory {
    pub fn new(engine: Arc<dyn CaptureEngine>) -> Self {
        Self { engine }
    }
}

impl EngineFactory for SharedEngineFactory {
    fn create(&self, _properties: &EngineProperties) -> Result<Arc<dyn CaptureEngine>> {
        Ok(self.engine.clone())
    }
}

/// String properties passed verbatim to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineProperties {
    values: BTreeMap<String, String>,
}

impl EngineProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds properties from arbitrary option values, stringifying each.
    pub fn from_options<I, K, V>(options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        Self {
            values: options
                .into_iter()
                .map(|(key, value)| (key.into(), value.to_string()))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::Config(format!("Missing engine property '{}'", key)))
    }

    /// Parses `key` when present.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::Config(format!("Invalid value '{}' for engine property '{}'", raw, key))),
            None => Ok(None),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for EngineProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_options(iter)
    }
}
