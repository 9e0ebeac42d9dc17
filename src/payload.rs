//! Read-only view over one decoded change event.
//!
//! Capture engines hand over Debezium-style JSON documents. The change itself
//! sits under the top-level `payload` member:
//!
//! ```json
//! {
//!   "payload": {
//!     "op": "c",
//!     "before": null,
//!     "after": { "id": 1, "total": 42.5 },
//!     "source": { "db": "shop", "schema": "public", "table": "orders" },
//!     "ts_ms": 1697369400000
//!   }
//! }
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::fmt;

pub const PAYLOAD: &str = "payload";
pub const BEFORE: &str = "before";
pub const AFTER: &str = "after";
const OP: &str = "op";
const SOURCE: &str = "source";
const DB: &str = "db";
const SCHEMA: &str = "schema";
const TABLE: &str = "table";
const TS_MS: &str = "ts_ms";

/// Category of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Truncate,
    Unrecognized,
}

impl Operation {
    /// Maps a Debezium operation code (`r`, `c`, `u`, `d`, `t`).
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("r") => Operation::Read,
            Some("c") => Operation::Create,
            Some("u") => Operation::Update,
            Some("d") => Operation::Delete,
            Some("t") => Operation::Truncate,
            _ => Operation::Unrecognized,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Payload {
    payload: Map<String, Value>,
}

impl Payload {
    pub fn new(payload: Map<String, Value>) -> Self {
        Self { payload }
    }

    /// Decodes a raw record, returning `None` when the `payload` member is
    /// missing or not an object.
    pub fn from_event(event: Value) -> Option<Self> {
        match event {
            Value::Object(mut root) => match root.remove(PAYLOAD) {
                Some(Value::Object(payload)) => Some(Self::new(payload)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Raw operation code, if present.
    pub fn op(&self) -> Option<&str> {
        self.payload.get(OP).and_then(Value::as_str)
    }

    pub fn operation(&self) -> Operation {
        Operation::from_code(self.op())
    }

    /// Returns the named fragment when it is a JSON object.
    pub fn member(&self, key: &str) -> Option<&Map<String, Value>> {
        self.payload.get(key).and_then(Value::as_object)
    }

    pub fn database(&self) -> Option<&str> {
        self.source_member(DB)
    }

    pub fn schema(&self) -> Option<&str> {
        self.source_member(SCHEMA)
    }

    pub fn table(&self) -> Option<&str> {
        self.source_member(TABLE)
    }

    /// Routing key in `<database>.<table>` form. Missing parts render as `null`.
    pub fn routing_key(&self) -> String {
        format!(
            "{}.{}",
            self.database().unwrap_or("null"),
            self.table().unwrap_or("null")
        )
    }

    /// Event time as reported by the connector.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let millis = self.payload.get(TS_MS).and_then(Value::as_i64)?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// The whole payload as a JSON value, for error details.
    pub fn to_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    fn source_member(&self, key: &str) -> Option<&str> {
        self.member(SOURCE)
            .and_then(|source| source.get(key))
            .and_then(Value::as_str)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.payload.clone()))
    }
}
