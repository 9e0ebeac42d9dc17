pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod listener;
pub mod payload;
pub mod registry;
pub mod service;

pub use config::Config;
pub use dispatcher::ChangeEventDispatcher;
pub use engine::{ChangeRecord, EngineProperties};
pub use error::{Error, EventError, Result};
pub use listener::{Listener, ListenerSettings, ListenerState};
pub use payload::{Operation, Payload};
pub use service::{Arguments, Method, MethodName, Service, ServiceError, TableAffinity};
