//! Routing table from `<database>.<table>` keys to attached services.
//!
//! A registry has one of two shapes: a single catch-all entry, used when the
//! only attached service declares no table affinity, or any number of keyed
//! entries. The shapes never mix and no table is claimed twice.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::service::{ServiceDescriptor, ServiceId, TableAffinity};
use crate::{Error, Result};

/// Key of the catch-all entry.
pub const CATCH_ALL_KEY: &str = "*";

/// Outcome of a failed [`ServiceRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub key: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    entries: HashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `descriptor` under the keys implied by its table affinity.
    ///
    /// The registry is left untouched when an error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationNotPermitted`] if:
    /// - a catch-all service is added to a non-empty registry
    /// - a keyed service is added next to a catch-all service
    /// - a table is already claimed by another service
    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<()> {
        let descriptor = Arc::new(descriptor);

        match descriptor.affinity() {
            TableAffinity::All => {
                if !self.entries.is_empty() {
                    return Err(Error::OperationNotPermitted(
                        "The table affinity is mandatory when attaching multiple services to the listener."
                            .to_string(),
                    ));
                }
                self.entries.insert(CATCH_ALL_KEY.to_string(), descriptor.clone());
            }
            TableAffinity::Tables(tables) => {
                if self.is_catch_all() {
                    return Err(Error::OperationNotPermitted(
                        "The table affinity is mandatory when attaching multiple services to the listener."
                            .to_string(),
                    ));
                }
                if let Some(table) = tables.iter().find(|t| self.entries.contains_key(t.as_str())) {
                    return Err(Error::OperationNotPermitted(format!(
                        "Multiple services cannot be used to receive events from the same table '{}'.",
                        table
                    )));
                }
                for table in tables {
                    self.entries.insert(table.clone(), descriptor.clone());
                }
            }
        }

        debug!(service = descriptor.name(), entries = self.entries.len(), "Registered service");
        Ok(())
    }

    /// Removes every entry owned by the service with `id`.
    pub fn unregister(&mut self, id: ServiceId) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|_, descriptor| descriptor.id() != id);

        if self.entries.len() == before {
            return Err(Error::OperationNotPermitted(
                "Cannot detach a service that is not attached to the listener.".to_string(),
            ));
        }

        debug!(removed = before - self.entries.len(), "Unregistered service");
        Ok(())
    }

    /// Finds the service for a record. A catch-all entry wins regardless of
    /// the coordinates.
    pub fn resolve(&self, database: &str, table: &str) -> std::result::Result<&Arc<ServiceDescriptor>, NotFound> {
        if let Some(descriptor) = self.entries.get(CATCH_ALL_KEY) {
            return Ok(descriptor);
        }

        let key = format!("{}.{}", database, table);
        self.entries.get(&key).ok_or(NotFound { key })
    }

    pub fn is_catch_all(&self) -> bool {
        self.entries.contains_key(CATCH_ALL_KEY)
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.entries.values().any(|descriptor| descriptor.id() == id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of routing entries (not services).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Arguments, Method, MethodName, Service, ServiceError};
    use async_trait::async_trait;
    use serde_json::Value;

    struct TableService {
        name: &'static str,
        tables: TableAffinity,
    }

    #[async_trait]
    impl Service for TableService {
        fn name(&self) -> &str {
            self.name
        }

        fn tables(&self) -> TableAffinity {
            self.tables.clone()
        }

        fn methods(&self) -> Vec<Method> {
            vec![Method::on_create::<Value>()]
        }

        async fn call(&self, _method: MethodName, _args: Arguments) -> std::result::Result<(), ServiceError> {
            Ok(())
        }
    }

    fn create_descriptor(name: &'static str, tables: TableAffinity) -> (Arc<dyn Service>, ServiceDescriptor) {
        let service: Arc<dyn Service> = Arc::new(TableService { name, tables });
        let descriptor = ServiceDescriptor::new(service.clone()).unwrap();
        (service, descriptor)
    }

    #[test]
    fn test_catch_all_resolves_everything() {
        let mut registry = ServiceRegistry::new();
        let (_, all) = create_descriptor("all", TableAffinity::All);
        registry.register(all).unwrap();

        assert!(registry.is_catch_all());
        assert_eq!(registry.resolve("shop", "orders").unwrap().name(), "all");
        assert_eq!(registry.resolve("other", "thing").unwrap().name(), "all");
    }

    #[test]
    fn test_keyed_resolution_is_disjoint() {
        let mut registry = ServiceRegistry::new();
        let (_, h1) = create_descriptor("h1", TableAffinity::from(["db.t1", "db.t3"]));
        let (_, h2) = create_descriptor("h2", TableAffinity::from("db.t2"));
        registry.register(h1).unwrap();
        registry.register(h2).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.resolve("db", "t1").unwrap().name(), "h1");
        assert_eq!(registry.resolve("db", "t3").unwrap().name(), "h1");
        assert_eq!(registry.resolve("db", "t2").unwrap().name(), "h2");

        let missing = registry.resolve("db", "t4").unwrap_err();
        assert_eq!(missing.key, "db.t4");
    }

    #[test]
    fn test_catch_all_after_keyed_is_rejected() {
        let mut registry = ServiceRegistry::new();
        let (_, keyed) = create_descriptor("keyed", TableAffinity::from("db.t1"));
        let (_, all) = create_descriptor("all", TableAffinity::All);
        registry.register(keyed).unwrap();

        let err = registry.register(all).unwrap_err();
        assert!(matches!(err, Error::OperationNotPermitted(_)));
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_catch_all());
    }

    #[test]
    fn test_keyed_after_catch_all_is_rejected() {
        let mut registry = ServiceRegistry::new();
        let (_, all) = create_descriptor("all", TableAffinity::All);
        let (_, keyed) = create_descriptor("keyed", TableAffinity::from("db.t1"));
        registry.register(all).unwrap();

        assert!(registry.register(keyed).is_err());
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec![CATCH_ALL_KEY]);
    }

    #[test]
    fn test_second_catch_all_is_rejected() {
        let mut registry = ServiceRegistry::new();
        let (_, first) = create_descriptor("first", TableAffinity::All);
        let (_, second) = create_descriptor("second", TableAffinity::All);
        registry.register(first).unwrap();

        assert!(registry.register(second).is_err());
        assert_eq!(registry.resolve("db", "t").unwrap().name(), "first");
    }

    #[test]
    fn test_duplicate_table_claim_leaves_registry_unchanged() {
        let mut registry = ServiceRegistry::new();
        let (_, h1) = create_descriptor("h1", TableAffinity::from("db.t"));
        let (_, h2) = create_descriptor("h2", TableAffinity::from(["db.u", "db.t"]));
        registry.register(h1).unwrap();

        let err = registry.register(h2).unwrap_err();
        assert!(err.to_string().contains("'db.t'"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("db", "t").unwrap().name(), "h1");
        assert!(registry.resolve("db", "u").is_err());
    }

    #[test]
    fn test_unregister_removes_all_entries_of_service() {
        let mut registry = ServiceRegistry::new();
        let (s1, h1) = create_descriptor("h1", TableAffinity::from(["db.t1", "db.t2"]));
        let (s2, h2) = create_descriptor("h2", TableAffinity::from("db.t3"));
        registry.register(h1).unwrap();
        registry.register(h2).unwrap();

        registry.unregister(ServiceId::of(&s1)).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(ServiceId::of(&s1)));
        assert!(registry.contains(ServiceId::of(&s2)));

        assert!(registry.unregister(ServiceId::of(&s1)).is_err());
        registry.unregister(ServiceId::of(&s2)).unwrap();
        assert!(registry.is_empty());
    }
}
