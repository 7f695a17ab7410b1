//! Service registry
//!
//! Holds the declarative definitions of managed units in registration
//! order. Specs are immutable once registered and handed out as `Arc`s, so
//! running units keep a reference to the exact definition they were
//! started from.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::units::ServiceSpec;

/// Registry shared between the supervisor and the update watcher
pub type SharedRegistry = Arc<RwLock<Registry>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Service already registered: {0}")]
    DuplicateName(String),

    #[error("Service not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Default)]
pub struct Registry {
    specs: HashMap<String, Arc<ServiceSpec>>,
    /// Names in registration order
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn register(&mut self, spec: ServiceSpec) -> Result<Arc<ServiceSpec>, RegistryError> {
        if self.specs.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateName(spec.name));
        }
        let spec = Arc::new(spec);
        self.order.push(spec.name.clone());
        self.specs.insert(spec.name.clone(), Arc::clone(&spec));
        log::debug!("Registered {}", spec.name);
        Ok(spec)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ServiceSpec>, RegistryError> {
        self.specs
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Specs in registration order. The iterator is lazy and can be cloned
    /// to walk the sequence again.
    pub fn list(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> + Clone + '_ {
        self.order.iter().filter_map(move |name| self.specs.get(name))
    }

    pub fn remove(&mut self, name: &str) -> Result<Arc<ServiceSpec>, RegistryError> {
        let spec = self
            .specs
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.order.retain(|n| n != name);
        log::debug!("Removed {}", name);
        Ok(spec)
    }

    /// Swap in a new definition for an existing name, keeping its position.
    /// Returns the previous definition.
    pub fn replace(&mut self, spec: ServiceSpec) -> Result<Arc<ServiceSpec>, RegistryError> {
        let slot = self
            .specs
            .get_mut(&spec.name)
            .ok_or_else(|| RegistryError::NotFound(spec.name.clone()))?;
        Ok(std::mem::replace(slot, Arc::new(spec)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::RestartPolicy;
    use tokio_test::{assert_err, assert_ok};

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec::new(name).with_command(["/bin/true"])
    }

    #[test]
    fn test_register_then_get_returns_equal_spec() {
        let mut registry = Registry::new();
        let original = spec("auto-rsa")
            .with_restart(RestartPolicy::UnlessStopped)
            .with_memory_limit(512 * 1024 * 1024);

        assert_ok!(registry.register(original.clone()));
        let fetched = registry.get("auto-rsa").unwrap();
        assert_eq!(*fetched, original);
    }

    #[test]
    fn test_duplicate_name() {
        let mut registry = Registry::new();
        assert_ok!(registry.register(spec("auto-rsa")));
        assert_eq!(
            registry.register(spec("auto-rsa")).unwrap_err(),
            RegistryError::DuplicateName("auto-rsa".to_string())
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let registry = Registry::new();
        assert_eq!(
            registry.get("ghost").unwrap_err(),
            RegistryError::NotFound("ghost".to_string())
        );
    }

    #[test]
    fn test_list_in_registration_order_and_restartable() {
        let mut registry = Registry::new();
        for name in ["watchtower", "auto-rsa", "db"] {
            registry.register(spec(name)).unwrap();
        }

        let iter = registry.list();
        let first: Vec<_> = iter.clone().map(|s| s.name.clone()).collect();
        let second: Vec<_> = iter.map(|s| s.name.clone()).collect();
        assert_eq!(first, vec!["watchtower", "auto-rsa", "db"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_remove() {
        let mut registry = Registry::new();
        registry.register(spec("a")).unwrap();
        registry.register(spec("b")).unwrap();

        assert_ok!(registry.remove("a"));
        assert!(!registry.contains("a"));
        assert_err!(registry.remove("a"));
        let names: Vec<_> = registry.list().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);

        // The name is free again
        assert_ok!(registry.register(spec("a")));
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut registry = Registry::new();
        registry.register(spec("a").with_image("app:1")).unwrap();
        registry.register(spec("b")).unwrap();

        let old = registry.replace(spec("a").with_image("app:2")).unwrap();
        assert_eq!(old.image.as_deref(), Some("app:1"));
        assert_eq!(registry.get("a").unwrap().image.as_deref(), Some("app:2"));

        let names: Vec<_> = registry.list().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_err!(registry.replace(spec("missing")));
    }
}
