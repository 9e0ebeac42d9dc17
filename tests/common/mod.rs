#![allow(dead_code)]

use async_trait::async_trait;
use cdc_listener::engine::{BatchSender, CaptureEngine, ChangeRecord, EngineContext, MemoryEngine, SharedEngineFactory};
use cdc_listener::{
    Arguments, Error, Listener, ListenerSettings, Method, MethodName, Service, ServiceError, TableAffinity,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Order {
    pub id: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Change {
        method: MethodName,
        before: Option<Order>,
        after: Option<Order>,
        table: Option<String>,
    },
    Failure {
        kind: String,
        message: String,
    },
}

/// What `onError` does after recording the failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandlerFault {
    Fail,
    Panic,
}

/// Service that records every call it receives.
pub struct RecordingService {
    name: String,
    tables: TableAffinity,
    error_handler: bool,
    error_handler_fault: Option<HandlerFault>,
    fail_on: Option<i64>,
    panic_on: Option<i64>,
    delay: Option<Duration>,
    events: Mutex<Vec<Recorded>>,
}

impl RecordingService {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: TableAffinity::All,
            error_handler: false,
            error_handler_fault: None,
            fail_on: None,
            panic_on: None,
            delay: None,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn for_tables(mut self, tables: impl Into<TableAffinity>) -> Self {
        self.tables = tables.into();
        self
    }

    pub fn with_error_handler(mut self) -> Self {
        self.error_handler = true;
        self
    }

    /// Declares an `onError` that records the failure and then misbehaves.
    pub fn with_faulty_error_handler(mut self, fault: HandlerFault) -> Self {
        self.error_handler = true;
        self.error_handler_fault = Some(fault);
        self
    }

    /// Returns an error for the order with `id`.
    pub fn failing_on(mut self, id: i64) -> Self {
        self.fail_on = Some(id);
        self
    }

    pub fn panicking_on(mut self, id: i64) -> Self {
        self.panic_on = Some(id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn changes(&self) -> Vec<Recorded> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Recorded::Change { .. }))
            .collect()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Failure { kind, message } => Some((kind, message)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Service for RecordingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn tables(&self) -> TableAffinity {
        self.tables.clone()
    }

    fn methods(&self) -> Vec<Method> {
        let mut methods = vec![
            Method::on_read::<Order>().with_table_name(),
            Method::on_create::<Order>().with_table_name(),
            Method::on_update::<Order>().with_table_name(),
            Method::on_delete::<Order>().with_table_name(),
        ];
        if self.error_handler {
            methods.push(Method::on_error());
        }
        methods
    }

    async fn call(&self, method: MethodName, args: Arguments) -> Result<(), ServiceError> {
        if method == MethodName::OnError {
            let error = args.error().ok_or_else(|| ServiceError::argument("error"))?;
            self.events.lock().unwrap().push(Recorded::Failure {
                kind: error.kind().to_string(),
                message: error.to_string(),
            });
            return match self.error_handler_fault {
                Some(HandlerFault::Fail) => Err(ServiceError::failed("error handler gave up")),
                Some(HandlerFault::Panic) => panic!("error handler exploded"),
                None => Ok(()),
            };
        }

        let before = args.before::<Order>().cloned();
        let after = args.after::<Order>().cloned();
        let id = after.as_ref().or(before.as_ref()).map(|order| order.id);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if id.is_some() && id == self.panic_on {
            panic!("order {} exploded", id.unwrap_or_default());
        }
        if id.is_some() && id == self.fail_on {
            return Err(ServiceError::failed(format!("order {} rejected", id.unwrap_or_default())));
        }

        self.events.lock().unwrap().push(Recorded::Change {
            method,
            before,
            after,
            table: args.table_name().map(str::to_string),
        });
        Ok(())
    }
}

/// Builds a raw change record for `db.table`.
pub fn change_event(op: &str, db: &str, table: &str, before: Value, after: Value) -> ChangeRecord {
    ChangeRecord::new(
        json!({
            "schema": {},
            "payload": {
                "op": op,
                "before": before,
                "after": after,
                "source": {"db": db, "schema": "public", "table": table},
                "ts_ms": 1_697_369_400_000i64
            }
        })
        .to_string(),
    )
}

pub fn order(id: i64, status: &str) -> Value {
    json!({"id": id, "status": status})
}

pub fn created(table: &str, id: i64) -> ChangeRecord {
    change_event("c", "shop", table, Value::Null, order(id, "new"))
}

/// Engine that reports readiness after a delay, then idles until stopped.
pub struct ScriptedEngine {
    startup_delay: Duration,
    exit_error: Option<String>,
    runs: AtomicUsize,
    ready: AtomicBool,
    active: Arc<AtomicBool>,
    closed: Notify,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            startup_delay: Duration::ZERO,
            exit_error: None,
            runs: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            active: Arc::new(AtomicBool::new(false)),
            closed: Notify::new(),
        }
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Fails with `message` right after reporting readiness.
    pub fn exiting_with(mut self, message: &str) -> Self {
        self.exit_error = Some(message.to_string());
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Whether any run has reported readiness.
    pub fn reported_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether a `run` future is still alive, i.e. neither finished nor dropped.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveFlag(Arc<AtomicBool>);

impl Drop for ActiveFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureEngine for ScriptedEngine {
    async fn run(&self, context: EngineContext) -> cdc_listener::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        let _active = ActiveFlag(self.active.clone());

        tokio::time::sleep(self.startup_delay).await;
        self.ready.store(true, Ordering::SeqCst);
        context.startup.started();

        if let Some(message) = &self.exit_error {
            return Err(Error::Engine(message.clone()));
        }
        tokio::select! {
            _ = self.closed.notified() => {}
            _ = context.shutdown.cancelled() => {}
        }
        Ok(())
    }

    async fn close(&self) -> cdc_listener::Result<()> {
        self.closed.notify_one();
        Ok(())
    }
}

pub fn scripted_listener(engine: &Arc<ScriptedEngine>) -> Listener {
    Listener::new(SharedEngineFactory::new(engine.clone()))
}

/// Polls `state()` until the listener reaches `expected`.
pub async fn wait_for_state(listener: &Listener, expected: cdc_listener::ListenerState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while listener.state().await != expected {
        assert!(tokio::time::Instant::now() < deadline, "listener never reached {:?}", expected);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A listener driven by an in-memory engine.
pub fn memory_listener() -> (Listener, Arc<MemoryEngine>, BatchSender) {
    memory_listener_with(ListenerSettings::default())
}

pub fn memory_listener_with(settings: ListenerSettings) -> (Listener, Arc<MemoryEngine>, BatchSender) {
    let (engine, sender) = MemoryEngine::channel(8);
    let engine = Arc::new(engine);
    let listener = Listener::with_settings(SharedEngineFactory::new(engine.clone()), settings);
    (listener, engine, sender)
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("cdc_listener=debug")
        .with_test_writer()
        .try_init()
        .ok();
}
