//! Binding of payload fragments to declared record types.
//!
//! Structural validation is relaxed: unknown fields are ignored, absent
//! optional fields default to `None`, and no constraint checks run. A missing
//! or non-object fragment is bound as JSON `null`, which only succeeds for
//! types that accept it (such as `Option<T>`).

use serde_json::Value;
use tracing::trace;

use super::method::{BoundValue, MethodDescriptor, RecordType};
use super::{Argument, Arguments};
use crate::error::EventError;
use crate::payload::{Payload, AFTER, BEFORE};

/// Binds the arguments for `method` from `payload`, in declared order:
/// before image, after image, then the table name.
pub fn bind_arguments(payload: &Payload, method: &MethodDescriptor) -> Result<Arguments, EventError> {
    let mut args = Arguments::new();

    if let Some(record) = method.before_type() {
        args.push(Argument::Before(bind_fragment(payload, BEFORE, record)?));
    }
    if let Some(record) = method.after_type() {
        args.push(Argument::After(bind_fragment(payload, AFTER, record)?));
    }
    if method.has_table_name() {
        args.push(Argument::TableName(payload.table().unwrap_or_default().to_string()));
    }

    Ok(args)
}

/// Parses one named fragment against the declared type.
pub fn bind_fragment(payload: &Payload, member: &str, record: &RecordType) -> Result<BoundValue, EventError> {
    let fragment = payload
        .member(member)
        .map(|fragment| Value::Object(fragment.clone()))
        .unwrap_or(Value::Null);

    trace!(member, record_type = record.name(), "Binding payload fragment");

    record.bind(fragment).map_err(|e| EventError::PayloadBinding {
        message: format!("'{}' could not be bound to '{}': {}", member, record.name(), e),
        payload: payload.to_value(),
    })
}
