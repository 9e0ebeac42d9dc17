use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::fmt;

use crate::payload::Operation;

/// A record bound from a payload fragment, type-erased until the handler
/// downcasts it.
pub type BoundValue = Box<dyn Any + Send + Sync>;

/// Canonical handler method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodName {
    OnRead,
    OnCreate,
    OnUpdate,
    OnDelete,
    OnTruncate,
    OnError,
}

impl MethodName {
    /// Unrecognized operations map to the error handler name.
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Read => MethodName::OnRead,
            Operation::Create => MethodName::OnCreate,
            Operation::Update => MethodName::OnUpdate,
            Operation::Delete => MethodName::OnDelete,
            Operation::Truncate => MethodName::OnTruncate,
            Operation::Unrecognized => MethodName::OnError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodName::OnRead => "onRead",
            MethodName::OnCreate => "onCreate",
            MethodName::OnUpdate => "onUpdate",
            MethodName::OnDelete => "onDelete",
            MethodName::OnTruncate => "onTruncate",
            MethodName::OnError => "onError",
        }
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target type of a before/after parameter.
///
/// Holds the type name for diagnostics and a bind function monomorphised for
/// the declared type, so the descriptor stays object-safe.
#[derive(Clone, Copy)]
pub struct RecordType {
    name: &'static str,
    bind: fn(Value) -> serde_json::Result<BoundValue>,
}

impl RecordType {
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            name: std::any::type_name::<T>(),
            bind: bind_as::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn bind(&self, value: Value) -> serde_json::Result<BoundValue> {
        (self.bind)(value)
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordType").field(&self.name).finish()
    }
}

fn bind_as<T>(value: Value) -> serde_json::Result<BoundValue>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    serde_json::from_value::<T>(value).map(|record| Box::new(record) as BoundValue)
}

/// Declared parameter shape of one handler method.
#[derive(Debug, Clone, Copy)]
pub struct MethodDescriptor {
    before: Option<RecordType>,
    after: Option<RecordType>,
    table_name: bool,
    isolated: bool,
}

impl MethodDescriptor {
    pub fn before_type(&self) -> Option<&RecordType> {
        self.before.as_ref()
    }

    pub fn after_type(&self) -> Option<&RecordType> {
        self.after.as_ref()
    }

    pub fn has_before_param(&self) -> bool {
        self.before.is_some()
    }

    pub fn has_after_param(&self) -> bool {
        self.after.is_some()
    }

    /// Whether a trailing table-name argument is declared.
    pub fn has_table_name(&self) -> bool {
        self.table_name
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }
}

/// A method declaration returned by [`Service::methods`](super::Service::methods).
///
/// ```rust
/// use cdc_listener::service::{Method, MethodName};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Order {
///     id: i64,
/// }
///
/// let method = Method::on_update::<Order>().with_table_name();
/// assert_eq!(method.name(), MethodName::OnUpdate);
/// assert!(method.descriptor().has_before_param());
/// assert!(method.descriptor().has_after_param());
/// assert!(method.descriptor().has_table_name());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Method {
    name: MethodName,
    descriptor: MethodDescriptor,
}

impl Method {
    fn new(name: MethodName, before: Option<RecordType>, after: Option<RecordType>) -> Self {
        Self {
            name,
            descriptor: MethodDescriptor {
                before,
                after,
                table_name: false,
                isolated: true,
            },
        }
    }

    /// Snapshot reads; receives the after image.
    pub fn on_read<T>() -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Self::new(MethodName::OnRead, None, Some(RecordType::of::<T>()))
    }

    /// Inserts; receives the after image.
    pub fn on_create<T>() -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Self::new(MethodName::OnCreate, None, Some(RecordType::of::<T>()))
    }

    /// Updates; receives the before and after images, both of type `T`.
    pub fn on_update<T>() -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let record = RecordType::of::<T>();
        Self::new(MethodName::OnUpdate, Some(record), Some(record))
    }

    /// Deletes; receives the before image.
    pub fn on_delete<T>() -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Self::new(MethodName::OnDelete, Some(RecordType::of::<T>()), None)
    }

    pub fn on_truncate() -> Self {
        Self::new(MethodName::OnTruncate, None, None)
    }

    /// Error handler; receives the [`EventError`](crate::EventError).
    pub fn on_error() -> Self {
        Self::new(MethodName::OnError, None, None)
    }

    /// Appends the source table name as the last argument.
    pub fn with_table_name(mut self) -> Self {
        self.descriptor.table_name = true;
        self
    }

    /// Runs the method inside the invoker's shared exclusion domain.
    pub fn not_isolated(mut self) -> Self {
        self.descriptor.isolated = false;
        self
    }

    pub fn name(&self) -> MethodName {
        self.name
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }
}
