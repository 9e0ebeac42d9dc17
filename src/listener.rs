//! Listener lifecycle.
//!
//! A [`Listener`] owns a service registry and, while running, one capture
//! engine task. Every lifecycle operation takes the instance lock, so
//! attach, detach, start and stop never interleave on the same listener and
//! the registry is never changed while the engine is reading it.
//!
//! ```text
//! New --attach--> Ready --start--> Running --stop--> Stopped --start--> Running
//!  ^                |                   |               |
//!  |                |                   +--engine exit--+
//!  +--detach last---+------------attach/detach----------+
//! ```
//!
//! An engine task that ends on its own is noticed by the next lifecycle
//! call, which moves the listener to `Stopped` before doing anything else.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dispatcher::ChangeEventDispatcher;
use crate::engine::{CaptureEngine, EngineContext, EngineFactory, EngineProperties, StartupOutcome, StartupSignal};
use crate::invoker::{panic_message, Invoker};
use crate::registry::ServiceRegistry;
use crate::service::{Service, ServiceDescriptor, ServiceId};
use crate::{Error, Result};

const NOT_READY: &str = "engine stopped before reporting readiness";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    New,
    Ready,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// How long a graceful stop waits for the engine task before aborting it.
    pub shutdown_timeout: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle on a spawned engine task. Dropping it cancels the task, so an
/// engine is never left behind by a `start` that did not complete.
struct ExecutionContext {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    fn abort(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.abort();
    }
}

struct RunningEngine {
    engine: Arc<dyn CaptureEngine>,
    execution: ExecutionContext,
}

struct ListenerInner {
    state: ListenerState,
    registry: ServiceRegistry,
    running: Option<RunningEngine>,
}

impl ListenerInner {
    fn reap_finished(&mut self, listener_id: Uuid) {
        let finished = self
            .running
            .as_ref()
            .is_some_and(|running| running.execution.task.is_finished());
        if finished {
            self.running = None;
            self.state = ListenerState::Stopped;
            warn!(%listener_id, "Capture engine exited, listener stopped");
        }
    }
}

pub struct Listener {
    id: OnceLock<Uuid>,
    factory: Arc<dyn EngineFactory>,
    invoker: Invoker,
    settings: ListenerSettings,
    inner: Mutex<ListenerInner>,
}

impl Listener {
    pub fn new(factory: impl EngineFactory) -> Self {
        Self::with_settings(factory, ListenerSettings::default())
    }

    pub fn with_settings(factory: impl EngineFactory, settings: ListenerSettings) -> Self {
        Self {
            id: OnceLock::new(),
            factory: Arc::new(factory),
            invoker: Invoker::new(),
            settings,
            inner: Mutex::new(ListenerInner {
                state: ListenerState::New,
                registry: ServiceRegistry::new(),
                running: None,
            }),
        }
    }

    /// Instance id, generated on first use.
    pub fn id(&self) -> Uuid {
        *self.id.get_or_init(Uuid::new_v4)
    }

    async fn lock_inner(&self) -> MutexGuard<'_, ListenerInner> {
        let mut inner = self.inner.lock().await;
        inner.reap_finished(self.id());
        inner
    }

    pub async fn state(&self) -> ListenerState {
        self.lock_inner().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == ListenerState::Running
    }

    /// Routing keys currently registered, sorted.
    pub async fn routing_keys(&self) -> Vec<String> {
        let inner = self.lock_inner().await;
        let mut keys: Vec<String> = inner.registry.keys().map(str::to_string).collect();
        keys.sort();
        keys
    }

    /// Registers `service` under its table affinity.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if the listener is running, the
    /// service declaration is invalid, or its tables conflict with the
    /// services already attached.
    pub async fn attach(&self, service: Arc<dyn Service>) -> Result<()> {
        let listener_id = self.id();
        let mut inner = self.lock_inner().await;

        if inner.state == ListenerState::Running {
            return Err(Error::OperationNotPermitted(
                "Cannot attach a CDC service to the listener once it is running.".to_string(),
            ));
        }

        let descriptor = ServiceDescriptor::new(service)?;
        let name = descriptor.name().to_string();
        inner.registry.register(descriptor)?;
        inner.state = ListenerState::Ready;

        info!(%listener_id, service = %name, "Attached service");
        Ok(())
    }

    /// Removes every routing entry owned by `service`.
    pub async fn detach(&self, service: &Arc<dyn Service>) -> Result<()> {
        let listener_id = self.id();
        let mut inner = self.lock_inner().await;

        if inner.state == ListenerState::Running {
            return Err(Error::OperationNotPermitted(
                "Cannot detach a CDC service from the listener once it is running.".to_string(),
            ));
        }

        inner.registry.unregister(ServiceId::of(service))?;
        if inner.registry.is_empty() {
            inner.state = ListenerState::New;
        }

        info!(%listener_id, service = service.name(), "Detached service");
        Ok(())
    }

    /// Starts the capture engine and waits for it to report readiness.
    ///
    /// Calling `start` on a running listener succeeds without starting a
    /// second engine. On failure, or if this future is dropped before the
    /// engine reports in, the engine task is cancelled and the listener stays
    /// where it was.
    pub async fn start(&self, properties: EngineProperties) -> Result<()> {
        let listener_id = self.id();
        let mut inner = self.lock_inner().await;

        if inner.state == ListenerState::Running {
            debug!(%listener_id, "Listener already running");
            return Ok(());
        }
        if inner.registry.is_empty() {
            return Err(Error::OperationNotPermitted(
                "Cannot start the listener without at least one attached service.".to_string(),
            ));
        }

        info!(%listener_id, properties = properties.len(), "Starting capture engine");

        let engine = self
            .factory
            .create(&properties)
            .map_err(|e| Error::Startup(e.to_string()))?;
        let consumer = Arc::new(ChangeEventDispatcher::new(inner.registry.clone(), self.invoker.clone()));
        let (startup, outcome) = StartupSignal::channel();
        let cancel = CancellationToken::new();

        let context = EngineContext {
            properties,
            consumer,
            startup: startup.clone(),
            shutdown: cancel.clone(),
        };
        let task = tokio::spawn(
            run_engine(engine.clone(), context, startup).instrument(info_span!("listener", %listener_id)),
        );
        // Owned here until the engine reports in; dropped with this future.
        let execution = ExecutionContext { task, cancel };

        match outcome.await {
            Ok(StartupOutcome::Started) => {
                inner.running = Some(RunningEngine { engine, execution });
                inner.state = ListenerState::Running;
                info!(%listener_id, "Listener started");
                Ok(())
            }
            Ok(StartupOutcome::Failed(message)) => {
                error!(%listener_id, error = %message, "Capture engine failed to start");
                Err(Error::Startup(message))
            }
            Err(_) => Err(Error::Startup(NOT_READY.to_string())),
        }
    }

    /// Closes the engine and waits for its task to finish.
    ///
    /// The task is aborted if it outlives the shutdown timeout. Either way
    /// the listener ends up stopped with its services still attached.
    pub async fn graceful_stop(&self) -> Result<()> {
        let listener_id = self.id();
        let mut inner = self.lock_inner().await;

        let Some(RunningEngine { engine, mut execution }) = inner.running.take() else {
            debug!(%listener_id, "Listener is not running");
            return Ok(());
        };
        inner.state = ListenerState::Stopped;

        info!(%listener_id, "Stopping capture engine");

        if let Err(e) = engine.close().await {
            execution.abort();
            error!(%listener_id, error = %e, "Failed to close capture engine");
            return Err(Error::Shutdown(e.to_string()));
        }

        match tokio::time::timeout(self.settings.shutdown_timeout, &mut execution.task).await {
            Ok(Ok(())) => {
                info!(%listener_id, "Listener stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(%listener_id, error = %e, "Capture engine task ended abnormally");
                Ok(())
            }
            Err(_) => {
                execution.abort();
                Err(Error::Shutdown(format!(
                    "engine did not stop within {} seconds",
                    self.settings.shutdown_timeout.as_secs_f64()
                )))
            }
        }
    }

    /// Cancels the engine task without waiting for it.
    ///
    /// A batch in flight is abandoned before it is acknowledged, so the
    /// engine may deliver it again on the next start.
    pub async fn immediate_stop(&self) -> Result<()> {
        let listener_id = self.id();
        let mut inner = self.lock_inner().await;

        let Some(running) = inner.running.take() else {
            debug!(%listener_id, "Listener is not running");
            return Ok(());
        };
        inner.state = ListenerState::Stopped;

        running.execution.abort();

        warn!(%listener_id, "Listener stopped immediately");
        Ok(())
    }
}

/// Runs the engine and turns an early return into the startup outcome.
async fn run_engine(engine: Arc<dyn CaptureEngine>, context: EngineContext, startup: StartupSignal) {
    match AssertUnwindSafe(engine.run(context)).catch_unwind().await {
        Ok(Ok(())) => {
            if !startup.failed(NOT_READY) {
                info!("Capture engine stopped");
            }
        }
        Ok(Err(e)) => {
            if !startup.failed(e.to_string()) {
                error!(error = %e, "Capture engine failed");
            }
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            if !startup.failed(message.clone()) {
                error!(error = %message, "Capture engine panicked");
            }
        }
    }
}
