//! Invocation of service methods under an isolation domain.
//!
//! Isolated methods run as soon as they are called. Non-isolated methods share
//! one exclusion domain per [`Invoker`], so at most one of them runs at a time
//! across every batch the invoker serves. Panics raised by a handler are
//! contained and surfaced as [`ServiceError::Panicked`].

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::service::{Arguments, MethodName, Service, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Isolated,
    Shared,
}

impl Isolation {
    /// Isolated only if both the service and the method are.
    pub fn derive(service_isolated: bool, method_isolated: bool) -> Self {
        if service_isolated && method_isolated {
            Isolation::Isolated
        } else {
            Isolation::Shared
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Invoker {
    shared: Arc<Mutex<()>>,
}

impl Invoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn invoke(
        &self,
        service: &Arc<dyn Service>,
        method: MethodName,
        isolation: Isolation,
        args: Arguments,
    ) -> Result<(), ServiceError> {
        trace!(service = service.name(), %method, ?isolation, "Invoking service method");

        let call = AssertUnwindSafe(service.call(method, args)).catch_unwind();
        let outcome = match isolation {
            Isolation::Isolated => call.await,
            Isolation::Shared => {
                let _guard = self.shared.lock().await;
                call.await
            }
        };

        outcome.unwrap_or_else(|panic| Err(ServiceError::Panicked(panic_message(&*panic))))
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
