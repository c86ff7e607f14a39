//! Registry of opened catalogs.
//!
//! Owned by the application root and passed to whatever opens sources, so two
//! sources naming the same location share one index and its memoized metadata.

use crate::catalog::{CatalogIndex, CatalogLocation, DataSourceConfig, Partition};
use crate::error::CatalogResult;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
pub struct CatalogRegistry {
    catalogs: HashMap<CatalogLocation, Arc<CatalogIndex>>,
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the index for `location`, opening it on first use.
    pub fn get_or_open(&mut self, location: &CatalogLocation) -> CatalogResult<Arc<CatalogIndex>> {
        if let Some(index) = self.catalogs.get(location) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(CatalogIndex::open(location.clone())?);
        debug!(location = %location, "Catalog registered");
        self.catalogs.insert(location.clone(), Arc::clone(&index));
        Ok(index)
    }

    /// Resolve a source through the index of its catalog location.
    pub fn resolve(&mut self, config: &DataSourceConfig) -> CatalogResult<Vec<Partition>> {
        self.get_or_open(&config.catalog_location)?.resolve(config)
    }

    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogWriter;
    use crate::error::CatalogError;
    use crate::records::DataClass;

    #[test]
    fn test_same_location_shares_index() {
        let dir = tempfile::tempdir().unwrap();
        CatalogWriter::create(dir.path()).unwrap();

        let mut registry = CatalogRegistry::new();
        let location = CatalogLocation::from(dir.path());
        let a = registry.get_or_open(&location).unwrap();
        let b = registry.get_or_open(&location).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_open_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = CatalogRegistry::new();
        let config = DataSourceConfig::new(dir.path(), DataClass::NewsEvent);

        assert!(matches!(
            registry.resolve(&config),
            Err(CatalogError::CatalogNotFound { .. })
        ));
        assert!(registry.is_empty());

        CatalogWriter::create(dir.path()).unwrap();
        assert!(registry.resolve(&config).unwrap().is_empty());
    }
}
