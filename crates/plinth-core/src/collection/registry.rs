//! The collection catalog.

use std::sync::Arc;

use dashmap::DashMap;

use crate::collection::compiled::Collection;
use crate::error::{Error, Result};

/// Registered collections, keyed by name. Populated at startup and shared
/// across the engine; lookups clone an `Arc`.
#[derive(Debug, Default)]
pub struct Registry {
    collections: DashMap<String, Arc<Collection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compiled collection. Re-registering the same compiled
    /// instance is a no-op; a different collection under an existing name
    /// is an error.
    pub fn insert(&self, collection: Arc<Collection>) -> Result<()> {
        if let Some(existing) = self.collections.get(&collection.name) {
            if Arc::ptr_eq(existing.value(), &collection) {
                return Ok(());
            }
            return Err(Error::InvalidDefinition(format!(
                "collection {} is already registered",
                collection.name
            )));
        }
        self.collections.insert(collection.name.clone(), collection);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.get(name).map(|c| c.value().clone())
    }

    pub fn expect(&self, name: &str) -> Result<Arc<Collection>> {
        self.get(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::field::FieldSpec;
    use crate::collection::CollectionDefinition;

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        CollectionDefinition::new("tags")
            .with_fields(vec![FieldSpec::text("name")])
            .build(&registry)
            .unwrap();
        assert!(registry.get("tags").is_some());
        assert!(registry.get("missing").is_none());
        assert!(matches!(
            registry.expect("missing"),
            Err(Error::UnknownCollection(_))
        ));
        assert_eq!(registry.names(), vec!["tags".to_string()]);
    }

    #[test]
    fn test_rebuild_of_same_definition_is_idempotent() {
        let registry = Registry::new();
        let def = CollectionDefinition::new("tags").with_fields(vec![FieldSpec::text("name")]);
        def.build(&registry).unwrap();
        def.build(&registry).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_name_rejected() {
        let registry = Registry::new();
        CollectionDefinition::new("tags")
            .with_fields(vec![FieldSpec::text("name")])
            .build(&registry)
            .unwrap();
        let err = CollectionDefinition::new("tags")
            .with_fields(vec![FieldSpec::text("label")])
            .build(&registry)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
    }
}
