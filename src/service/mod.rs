//! Handler services and their attach-time metadata.
//!
//! A [`Service`] declares which change operations it handles through
//! [`Service::methods`]. The listener queries that declaration once, when the
//! service is attached, and caches it in a [`ServiceDescriptor`].
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use cdc_listener::service::{Arguments, Method, MethodName, Service, ServiceError, TableAffinity};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Order {
//!     id: i64,
//! }
//!
//! struct OrderAudit;
//!
//! #[async_trait]
//! impl Service for OrderAudit {
//!     fn tables(&self) -> TableAffinity {
//!         TableAffinity::from(["shop.orders"])
//!     }
//!
//!     fn methods(&self) -> Vec<Method> {
//!         vec![Method::on_create::<Order>(), Method::on_error()]
//!     }
//!
//!     async fn call(&self, method: MethodName, args: Arguments) -> Result<(), ServiceError> {
//!         match method {
//!             MethodName::OnCreate => {
//!                 let order = args.after::<Order>().ok_or_else(|| ServiceError::argument("after"))?;
//!                 println!("order {} created", order.id);
//!             }
//!             MethodName::OnError => {
//!                 if let Some(error) = args.error() {
//!                     eprintln!("{}", error);
//!                 }
//!             }
//!             _ => {}
//!         }
//!         Ok(())
//!     }
//! }
//! ```

pub mod binding;
pub mod descriptor;
pub mod method;

use async_trait::async_trait;
use std::any::Any;
use thiserror::Error;

use crate::error::EventError;

pub use descriptor::{ServiceDescriptor, ServiceId};
pub use method::{BoundValue, Method, MethodDescriptor, MethodName, RecordType};

/// Which tables a service receives events from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TableAffinity {
    /// Every event delivered to the listener.
    #[default]
    All,
    /// Only the listed `<database>.<table>` keys.
    Tables(Vec<String>),
}

impl From<&str> for TableAffinity {
    fn from(table: &str) -> Self {
        TableAffinity::Tables(vec![table.to_string()])
    }
}

impl From<String> for TableAffinity {
    fn from(table: String) -> Self {
        TableAffinity::Tables(vec![table])
    }
}

impl From<Vec<String>> for TableAffinity {
    fn from(tables: Vec<String>) -> Self {
        TableAffinity::Tables(tables)
    }
}

impl<const N: usize> From<[&str; N]> for TableAffinity {
    fn from(tables: [&str; N]) -> Self {
        TableAffinity::Tables(tables.iter().map(|t| t.to_string()).collect())
    }
}

/// A user handler attached to a [`Listener`](crate::Listener).
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name used in logs and error messages.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn tables(&self) -> TableAffinity {
        TableAffinity::All
    }

    /// Whether the service as a whole may run concurrently with other
    /// isolated work. A method runs isolated only if both the service and
    /// the method are isolated.
    fn is_isolated(&self) -> bool {
        true
    }

    /// Declares the handled methods and their parameter shapes.
    fn methods(&self) -> Vec<Method>;

    /// Invokes one declared method with arguments bound in declared order.
    async fn call(&self, method: MethodName, args: Arguments) -> Result<(), ServiceError>;
}

/// Error returned (or raised) by a service method.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Failed(String),

    /// An expected argument was missing or had another type.
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// The handler panicked; the panic was contained by the invoker.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn failed(message: impl Into<String>) -> Self {
        ServiceError::Failed(message.into())
    }

    pub fn argument(name: impl Into<String>) -> Self {
        ServiceError::Argument(name.into())
    }
}

/// One bound argument, tagged with the role it was bound for.
pub enum Argument {
    Before(BoundValue),
    After(BoundValue),
    TableName(String),
    Error(EventError),
}

impl std::fmt::Debug for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Argument::Before(_) => f.write_str("Before(..)"),
            Argument::After(_) => f.write_str("After(..)"),
            Argument::TableName(table) => f.debug_tuple("TableName").field(table).finish(),
            Argument::Error(error) => f.debug_tuple("Error").field(error).finish(),
        }
    }
}

/// Arguments for one method call, in declared order.
#[derive(Debug, Default)]
pub struct Arguments {
    values: Vec<Argument>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_error(error: EventError) -> Self {
        Self {
            values: vec![Argument::Error(error)],
        }
    }

    pub(crate) fn push(&mut self, argument: Argument) {
        self.values.push(argument);
    }

    /// The before image, if declared and of type `T`.
    pub fn before<T: Any>(&self) -> Option<&T> {
        self.values.iter().find_map(|arg| match arg {
            Argument::Before(value) => value.downcast_ref::<T>(),
            _ => None,
        })
    }

    /// The after image, if declared and of type `T`.
    pub fn after<T: Any>(&self) -> Option<&T> {
        self.values.iter().find_map(|arg| match arg {
            Argument::After(value) => value.downcast_ref::<T>(),
            _ => None,
        })
    }

    pub fn table_name(&self) -> Option<&str> {
        self.values.iter().find_map(|arg| match arg {
            Argument::TableName(table) => Some(table.as_str()),
            _ => None,
        })
    }

    /// The failure handed to an `onError` method.
    pub fn error(&self) -> Option<&EventError> {
        self.values.iter().find_map(|arg| match arg {
            Argument::Error(error) => Some(error),
            _ => None,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
