//! Schema registry
//!
//! This module provides the static table of entity-type descriptors. The
//! registration order is meaningful: parents are registered before the
//! children that reference them, and pull/push phases walk entity types in
//! that order.

use std::collections::HashMap;

use crate::descriptor::EntityDescriptor;
use crate::{Error, Result};

/// Registry of entity-type descriptors, in dependency order.
///
/// # Example
///
/// ```
/// use farmsync_schema::{EntityDescriptor, SchemaRegistry};
///
/// let mut registry = SchemaRegistry::new();
/// registry.register(EntityDescriptor::new("herds", "herds")).unwrap();
/// registry
///     .register(EntityDescriptor::new("cattle", "cattle").parent("herds"))
///     .unwrap();
/// assert_eq!(registry.lookup("cattle").unwrap().table, "cattle");
/// assert!(registry.lookup("pastures").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    /// Descriptors in registration order
    descriptors: Vec<EntityDescriptor>,
    /// Maps entity type name to its position in `descriptors`
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the farm entity types registered.
    ///
    /// Registers, in dependency order:
    /// - `breeds` (global reference data)
    /// - `herds`
    /// - `cattle` -> `herds`, `breeds`
    /// - `health_records` -> `cattle`
    /// - `breeding_records` -> `cattle`
    pub fn farm_defaults() -> Self {
        let mut registry = Self::new();
        for descriptor in [
            EntityDescriptor::new("breeds", "breeds").global(),
            EntityDescriptor::new("herds", "herds"),
            EntityDescriptor::new("cattle", "cattle")
                .parent("herds")
                .parent("breeds"),
            EntityDescriptor::new("health_records", "health_records").parent("cattle"),
            EntityDescriptor::new("breeding_records", "breeding_records").parent("cattle"),
        ] {
            registry.push(descriptor);
        }
        registry
    }

    /// Register an entity type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEntityType`] if the name is taken, or
    /// [`Error::UnknownParent`] if a parent has not been registered yet.
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<()> {
        if self.index.contains_key(&descriptor.entity) {
            return Err(Error::DuplicateEntityType {
                entity: descriptor.entity,
            });
        }
        if let Some(parent) = descriptor
            .parents
            .iter()
            .find(|p| !self.index.contains_key(p.as_str()))
        {
            return Err(Error::UnknownParent {
                entity: descriptor.entity.clone(),
                parent: parent.clone(),
            });
        }
        self.push(descriptor);
        Ok(())
    }

    fn push(&mut self, descriptor: EntityDescriptor) {
        self.index
            .insert(descriptor.entity.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
    }

    /// Look up the descriptor of an entity type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownEntityType`] if the entity type was never registered.
    pub fn lookup(&self, entity: &str) -> Result<&EntityDescriptor> {
        self.index
            .get(entity)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| Error::UnknownEntityType {
                entity: entity.to_string(),
            })
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.index.contains_key(entity)
    }

    /// All descriptors in registration (dependency) order.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.descriptors.iter()
    }

    /// Group entity types by dependency depth.
    ///
    /// Level 0 holds entity types without parents; every other entity type
    /// sits one level below its deepest parent. Entity types within a level
    /// do not depend on each other and keep their registration order.
    pub fn levels(&self) -> Vec<Vec<&EntityDescriptor>> {
        let mut depth: Vec<usize> = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            // Parents always precede children, so their depth is known.
            let d = descriptor
                .parents
                .iter()
                .filter_map(|p| self.index.get(p.as_str()))
                .map(|&i| depth[i] + 1)
                .max()
                .unwrap_or(0);
            depth.push(d);
        }

        let mut levels: Vec<Vec<&EntityDescriptor>> = Vec::new();
        for (descriptor, d) in self.descriptors.iter().zip(depth) {
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(descriptor);
        }
        levels
    }

    /// Every entity type that references `entity`, directly or transitively.
    pub fn descendants(&self, entity: &str) -> Vec<&str> {
        let mut found: Vec<&str> = Vec::new();
        for descriptor in &self.descriptors {
            let depends = descriptor
                .parents
                .iter()
                .any(|p| p == entity || found.contains(&p.as_str()));
            if depends {
                found.push(descriptor.entity.as_str());
            }
        }
        found
    }

    /// Get the number of registered entity types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names<'a>(level: &[&'a EntityDescriptor]) -> Vec<&'a str> {
        level.iter().map(|d| d.entity.as_str()).collect()
    }

    #[test]
    fn test_new_registry_is_empty() {
        let registry = SchemaRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_lookup_before_registration_fails() {
        let registry = SchemaRegistry::new();
        let err = registry.lookup("cattle").unwrap_err();
        assert!(matches!(err, Error::UnknownEntityType { ref entity } if entity == "cattle"));
    }

    #[test]
    fn test_farm_defaults() {
        let registry = SchemaRegistry::farm_defaults();
        assert_eq!(registry.len(), 5);
        assert!(!registry.lookup("breeds").unwrap().tenant_scoped);
        assert!(registry.lookup("cattle").unwrap().tenant_scoped);
        let order: Vec<&str> = registry.entity_types().map(|d| d.entity.as_str()).collect();
        assert_eq!(
            order,
            vec!["breeds", "herds", "cattle", "health_records", "breeding_records"]
        );
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = SchemaRegistry::new();
        registry.register(EntityDescriptor::new("herds", "herds")).unwrap();
        let err = registry
            .register(EntityDescriptor::new("herds", "herds_v2"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEntityType { .. }));
    }

    #[test]
    fn test_register_requires_parents_first() {
        let mut registry = SchemaRegistry::new();
        let err = registry
            .register(EntityDescriptor::new("cattle", "cattle").parent("herds"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownParent { ref parent, .. } if parent == "herds"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_levels_follow_parent_depth() {
        let registry = SchemaRegistry::farm_defaults();
        let levels = registry.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(names(&levels[0]), vec!["breeds", "herds"]);
        assert_eq!(names(&levels[1]), vec!["cattle"]);
        assert_eq!(names(&levels[2]), vec!["health_records", "breeding_records"]);
    }

    #[test]
    fn test_descendants_are_transitive() {
        let registry = SchemaRegistry::farm_defaults();
        assert_eq!(
            registry.descendants("herds"),
            vec!["cattle", "health_records", "breeding_records"]
        );
        assert!(registry.descendants("health_records").is_empty());
    }
}
