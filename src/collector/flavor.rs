//! Passive registry of flavors published by the flavor informer
//!
//! The cache reads a point-in-time snapshot of this registry while refreshing
//! a scheduling snapshot; nothing else in the collector writes to it.

use std::collections::HashMap;
use std::sync::RwLock;

use super::resources::RegionFlavor;

/// Read-mostly flavor table keyed by region-qualified flavor id
#[derive(Debug, Default)]
pub struct FlavorRegistry {
    flavors: RwLock<HashMap<String, RegionFlavor>>,
}

impl FlavorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a flavor
    pub fn upsert(&self, flavor: RegionFlavor) {
        self.flavors
            .write()
            .expect("flavor registry poisoned")
            .insert(flavor.region_flavor_id.clone(), flavor);
    }

    pub fn remove(&self, region_flavor_id: &str) {
        self.flavors
            .write()
            .expect("flavor registry poisoned")
            .remove(region_flavor_id);
    }

    /// Point-in-time copy of every known flavor
    pub fn snapshot(&self) -> Vec<RegionFlavor> {
        self.flavors
            .read()
            .expect("flavor registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flavors.read().expect("flavor registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flavor(id: &str, region: &str) -> RegionFlavor {
        RegionFlavor {
            id: id.to_string(),
            region_flavor_id: format!("{region}--{id}"),
            region: region.to_string(),
            name: format!("flavor {id}"),
            vcpus: 4,
            memory_mb: 8192,
        }
    }

    #[test]
    fn test_upsert_and_snapshot() {
        let registry = FlavorRegistry::new();
        registry.upsert(flavor("m1.large", "kr-north-1"));
        registry.upsert(flavor("m1.large", "us-east-1"));
        registry.upsert(flavor("m1.large", "kr-north-1"));

        assert_eq!(registry.len(), 2);
        let snapshot = registry.snapshot();
        assert!(snapshot.iter().all(|f| f.id == "m1.large"));
    }

    #[test]
    fn test_remove() {
        let registry = FlavorRegistry::new();
        registry.upsert(flavor("m1.large", "kr-north-1"));
        registry.remove("kr-north-1--m1.large");
        assert!(registry.is_empty());
    }
}
