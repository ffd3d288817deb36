//! Reporter registry
//!
//! Reporters are named sinks that receive every published [`State`]. The
//! registry enforces name uniqueness and iterates in registration order;
//! entries added or removed while a dispatch is in flight take effect from
//! the next state on.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::state::State;

/// A named sink for published states.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, state: Arc<State>) -> Result<()>;
}

/// Ordered, name-unique reporter registry.
#[derive(Default)]
pub struct ReporterRegistry {
    entries: RwLock<Vec<(String, Arc<dyn Reporter>)>>,
}

impl ReporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reporter; names must be unique and non-empty.
    pub fn add(&self, name: &str, reporter: Arc<dyn Reporter>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidReporter("empty name".to_string()));
        }

        let mut entries = self.entries.write();
        if entries.iter().any(|(n, _)| n == name) {
            return Err(Error::InvalidReporter(format!("duplicate name {name:?}")));
        }

        entries.push((name.to_string(), reporter));
        Ok(())
    }

    /// Remove a reporter by name.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.iter().position(|(n, _)| n == name) {
            Some(idx) => {
                entries.remove(idx);
                Ok(())
            }
            None => Err(Error::ReporterNotFound(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Current entries in registration order.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Reporter>)> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullReporter;

    #[async_trait]
    impl Reporter for NullReporter {
        async fn report(&self, _state: Arc<State>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_add_remove() {
        let registry = ReporterRegistry::new();
        registry.add("log", Arc::new(NullReporter)).unwrap();

        assert!(registry.contains("log"));
        assert_eq!(registry.len(), 1);

        registry.remove("log").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = ReporterRegistry::new();
        registry.add("log", Arc::new(NullReporter)).unwrap();

        let err = registry.add("log", Arc::new(NullReporter)).unwrap_err();
        assert!(matches!(err, Error::InvalidReporter(_)));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = ReporterRegistry::new();
        let err = registry.add("", Arc::new(NullReporter)).unwrap_err();
        assert!(matches!(err, Error::InvalidReporter(_)));
    }

    #[test]
    fn test_remove_unknown_fails() {
        let registry = ReporterRegistry::new();
        let err = registry.remove("ghost").unwrap_err();
        assert!(matches!(err, Error::ReporterNotFound(_)));
    }

    #[test]
    fn test_snapshot_keeps_registration_order() {
        let registry = ReporterRegistry::new();
        for name in ["one", "two", "three"] {
            registry.add(name, Arc::new(NullReporter)).unwrap();
        }

        let names: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }
}
