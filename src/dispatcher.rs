//! Per-record processing of engine batches.
//!
//! For every record, in order: decode the change event, map its operation to
//! a method, resolve the target service, bind the declared arguments and
//! invoke the method. Any failure becomes an [`EventError`] which is handed to
//! the selected service's `onError` method, or logged when no service was
//! selected or it declares no error handler. A failing record never stops
//! the batch, and the batch is acknowledged exactly once after its last
//! record.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::engine::{ChangeConsumer, ChangeRecord, RecordCommitter};
use crate::error::EventError;
use crate::invoker::{panic_message, Invoker, Isolation};
use crate::payload::Payload;
use crate::registry::{NotFound, ServiceRegistry};
use crate::service::binding::bind_arguments;
use crate::service::{Arguments, MethodName, ServiceDescriptor};

/// Routes batches to the services of a registry snapshot.
#[derive(Debug, Clone)]
pub struct ChangeEventDispatcher {
    registry: ServiceRegistry,
    invoker: Invoker,
}

impl ChangeEventDispatcher {
    pub fn new(registry: ServiceRegistry, invoker: Invoker) -> Self {
        Self { registry, invoker }
    }

    /// Processes one record. Returns false if it ended in an [`EventError`].
    pub async fn dispatch(&self, record: &ChangeRecord) -> bool {
        let mut selected = None;
        let outcome = AssertUnwindSafe(self.deliver(record, &mut selected))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(error)) => error,
            Err(panic) => EventError::Processing {
                message: panic_message(&*panic),
                payload: raw_payload(record),
            },
        };

        self.handle_error(selected.as_ref(), error).await;
        false
    }

    async fn deliver(
        &self,
        record: &ChangeRecord,
        selected: &mut Option<Arc<ServiceDescriptor>>,
    ) -> Result<(), EventError> {
        let payload = decode(record)?;
        let method = MethodName::for_operation(payload.operation());

        let service = self
            .registry
            .resolve(
                payload.database().unwrap_or("null"),
                payload.table().unwrap_or("null"),
            )
            .map_err(|NotFound { key }| EventError::ServiceNotFound {
                key,
                payload: payload.to_value(),
            })?;
        *selected = Some(service.clone());

        if method == MethodName::OnError {
            return Err(EventError::Processing {
                message: format!("Unrecognized operation '{}'", payload.op().unwrap_or("null")),
                payload: payload.to_value(),
            });
        }

        let descriptor = service
            .method(method)
            .ok_or_else(|| EventError::MethodNotAvailable {
                method: method.to_string(),
                payload: payload.to_value(),
            })?;

        let args = bind_arguments(&payload, descriptor)?;
        let isolation = Isolation::derive(service.is_isolated(), descriptor.is_isolated());

        trace!(service = service.name(), %method, key = %payload.routing_key(), "Dispatching change event");

        self.invoker
            .invoke(service.service(), method, isolation, args)
            .await
            .map_err(|source| EventError::Invocation {
                service: service.name().to_string(),
                method: method.to_string(),
                payload: payload.to_value(),
                source,
            })
    }

    async fn handle_error(&self, service: Option<&Arc<ServiceDescriptor>>, error: EventError) {
        match service {
            Some(service) if service.has_error_handler() => {
                debug!(service = service.name(), kind = error.kind(), "Routing event error to service");
                let isolation = Isolation::derive(service.is_isolated(), service.is_error_handler_isolated());
                if let Err(e) = self
                    .invoker
                    .invoke(service.service(), MethodName::OnError, isolation, Arguments::for_error(error))
                    .await
                {
                    warn!(service = service.name(), error = %e, "Error handler failed");
                }
            }
            _ => {
                error!(
                    service = ?service.map(|s| s.name()),
                    kind = error.kind(),
                    error = %error,
                    payload = %error.payload(),
                    "Failed to process change event"
                );
            }
        }
    }
}

#[async_trait]
impl ChangeConsumer for ChangeEventDispatcher {
    async fn handle_batch(&self, records: Vec<ChangeRecord>, committer: &mut dyn RecordCommitter) {
        let mut failed = 0usize;
        for record in &records {
            if !self.dispatch(record).await {
                failed += 1;
            }
        }

        match committer.mark_batch_finished().await {
            Ok(()) => debug!(records = records.len(), failed, "Batch processed"),
            Err(e) => error!(error = %e, records = records.len(), failed, "Failed to acknowledge batch"),
        }
    }
}

fn decode(record: &ChangeRecord) -> Result<Payload, EventError> {
    let event: Value = serde_json::from_str(&record.value).map_err(|e| EventError::Processing {
        message: format!("Malformed change event: {}", e),
        payload: Value::String(record.value.clone()),
    })?;

    Payload::from_event(event).ok_or_else(|| EventError::Processing {
        message: "Change event has no 'payload' object".to_string(),
        payload: raw_payload(record),
    })
}

fn raw_payload(record: &ChangeRecord) -> Value {
    serde_json::from_str(&record.value).unwrap_or_else(|_| Value::String(record.value.clone()))
}
