//! Service registry: the single construction-time dependency graph.
//!
//! Singletons are registered by name at startup and looked up by typed
//! handle. Duplicate registration replaces the existing entry (with a
//! warning). Lookup of a missing or mistyped service is a fatal
//! [`ProcessorError::ServiceMissing`]. Shutdown hooks run in reverse
//! registration order.

use crate::error::{ProcessorError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Construction-time singleton registry (C10).
#[derive(Default)]
pub struct ServiceRegistry {
    /// Registration order is preserved for shutdown.
    services: Mutex<Vec<(String, Arc<dyn Any + Send + Sync>)>>,
    hooks: Mutex<Vec<(String, ShutdownHook)>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton under `name`. A duplicate name replaces the
    /// previous entry in place.
    pub fn register<T: Send + Sync + 'static>(&self, name: &str, service: Arc<T>) {
        let mut services = self.services.lock();
        if let Some(slot) = services.iter_mut().find(|(n, _)| n == name) {
            tracing::warn!(name, "service re-registered; replacing existing entry");
            slot.1 = service;
        } else {
            services.push((name.to_string(), service));
        }
    }

    /// Look up a singleton by name and type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let services = self.services.lock();
        let entry = services
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| ProcessorError::ServiceMissing(name.to_string()))?;
        entry
            .1
            .clone()
            .downcast::<T>()
            .map_err(|_| ProcessorError::ServiceMissing(format!("{} (type mismatch)", name)))
    }

    /// Whether a service is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.services.lock().iter().any(|(n, _)| n == name)
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.services.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Attach a hook to run when the registry shuts down.
    pub fn on_shutdown(&self, name: &str, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().push((name.to_string(), Box::new(hook)));
    }

    /// Run shutdown hooks in reverse registration order, then drop all
    /// services.
    pub fn shutdown(&self) {
        let mut hooks = self.hooks.lock();
        for (name, hook) in hooks.drain(..).rev() {
            tracing::debug!(service = %name, "running shutdown hook");
            hook();
        }
        drop(hooks);
        self.services.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[test]
    fn test_register_and_get() {
        let registry = ServiceRegistry::new();
        registry.register("answer", Arc::new(42u32));
        let value: Arc<u32> = registry.get("answer").unwrap();
        assert_eq!(*value, 42);
    }

    #[test]
    fn test_missing_service_is_fatal_error() {
        let registry = ServiceRegistry::new();
        let result: Result<Arc<u32>> = registry.get("nope");
        assert!(matches!(result, Err(ProcessorError::ServiceMissing(_))));
    }

    #[test]
    fn test_type_mismatch_is_missing() {
        let registry = ServiceRegistry::new();
        registry.register("value", Arc::new("a string".to_string()));
        let result: Result<Arc<u32>> = registry.get("value");
        assert!(matches!(result, Err(ProcessorError::ServiceMissing(_))));
    }

    #[test]
    fn test_duplicate_replaces_in_place() {
        let registry = ServiceRegistry::new();
        registry.register("svc", Arc::new(1u32));
        registry.register("other", Arc::new(2u32));
        registry.register("svc", Arc::new(3u32));
        assert_eq!(*registry.get::<u32>("svc").unwrap(), 3);
        // Position preserved: registration order unchanged.
        assert_eq!(registry.names(), vec!["svc", "other"]);
    }

    #[test]
    fn test_shutdown_reverse_order() {
        let registry = ServiceRegistry::new();
        let order = Arc::new(PMutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            registry.register(name, Arc::new(name.to_string()));
            let order = Arc::clone(&order);
            registry.on_shutdown(name, move || order.lock().push(name));
        }
        registry.shutdown();
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
        assert!(registry.names().is_empty());
    }
}
