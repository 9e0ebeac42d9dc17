use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::{MethodDescriptor, MethodName, Service, TableAffinity};
use crate::{Error, Result};

/// Identity of an attached service instance.
///
/// Two `Arc`s pointing at the same service share an id; detach relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(usize);

impl ServiceId {
    pub fn of(service: &Arc<dyn Service>) -> Self {
        Self(Arc::as_ptr(service) as *const () as usize)
    }
}

/// Metadata for one attached service, built once at attach time.
pub struct ServiceDescriptor {
    id: ServiceId,
    name: String,
    service: Arc<dyn Service>,
    affinity: TableAffinity,
    methods: HashMap<MethodName, MethodDescriptor>,
    isolated: bool,
    on_error: Option<MethodDescriptor>,
}

impl ServiceDescriptor {
    /// Queries the service's declaration and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidService`] if:
    /// - no operation method is declared
    /// - a method is declared more than once
    /// - `onError` declares a table-name parameter
    /// - an explicit table list is empty or repeats a table
    pub fn new(service: Arc<dyn Service>) -> Result<Self> {
        let name = service.name().to_string();
        let invalid = |message: String| Error::InvalidService {
            service: name.clone(),
            message,
        };

        let mut methods = HashMap::new();
        let mut on_error = None;

        for method in service.methods() {
            let descriptor = *method.descriptor();
            if method.name() == MethodName::OnError {
                if descriptor.has_table_name() {
                    return Err(invalid(
                        "'onError' must have exactly one parameter of type 'EventError'".to_string(),
                    ));
                }
                if on_error.replace(descriptor).is_some() {
                    return Err(invalid("'onError' is declared more than once".to_string()));
                }
                continue;
            }
            if methods.insert(method.name(), descriptor).is_some() {
                return Err(invalid(format!("'{}' is declared more than once", method.name())));
            }
        }

        if methods.is_empty() {
            return Err(invalid(
                "Service must have at least one of 'onRead', 'onCreate', 'onUpdate', 'onDelete' or 'onTruncate'"
                    .to_string(),
            ));
        }

        let affinity = service.tables();
        if let TableAffinity::Tables(tables) = &affinity {
            if tables.is_empty() {
                return Err(invalid("The table list must not be empty".to_string()));
            }
            let mut seen = HashSet::new();
            for table in tables {
                if !seen.insert(table.as_str()) {
                    return Err(invalid(format!("Table '{}' is listed more than once", table)));
                }
            }
        }

        debug!(
            service = %name,
            methods = methods.len(),
            has_error_handler = on_error.is_some(),
            "Built service descriptor"
        );

        Ok(Self {
            id: ServiceId::of(&service),
            isolated: service.is_isolated(),
            name,
            service,
            affinity,
            methods,
            on_error,
        })
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn affinity(&self) -> &TableAffinity {
        &self.affinity
    }

    pub fn method(&self, name: MethodName) -> Option<&MethodDescriptor> {
        self.methods.get(&name)
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub fn has_error_handler(&self) -> bool {
        self.on_error.is_some()
    }

    pub fn is_error_handler_isolated(&self) -> bool {
        self.on_error.map(|m| m.is_isolated()).unwrap_or(false)
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("affinity", &self.affinity)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("isolated", &self.isolated)
            .field("has_error_handler", &self.on_error.is_some())
            .finish()
    }
}
