//! Instrument registry stored at the catalog root.

use crate::catalog::schema::INSTRUMENTS_FILE;
use crate::error::{CatalogError, CatalogResult};
use crate::records::InstrumentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Static definition of a tradable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub venue: String,
    #[serde(default)]
    pub asset_class: Option<String>,
    #[serde(default)]
    pub price_precision: u8,
    #[serde(default)]
    pub size_precision: u8,
}

impl Instrument {
    pub fn new(id: impl Into<InstrumentId>, venue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            venue: venue.into(),
            asset_class: None,
            price_precision: 0,
            size_precision: 0,
        }
    }
}

/// Instruments known to one catalog, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentRegistry {
    instruments: BTreeMap<InstrumentId, Instrument>,
}

impl InstrumentRegistry {
    /// Load `instruments.json` from a catalog root.
    ///
    /// A missing file means the directory is not a catalog.
    pub fn load(root: &Path) -> CatalogResult<Self> {
        let path = root.join(INSTRUMENTS_FILE);
        if !path.is_file() {
            return Err(CatalogError::CatalogNotFound {
                location: root.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| CatalogError::io(&path, e))?;
        let list: Vec<Instrument> = serde_json::from_str(&contents)
            .map_err(|e| CatalogError::io(&path, format!("invalid instrument registry: {}", e)))?;
        Ok(list.into_iter().collect())
    }

    /// Write `instruments.json` into a catalog root.
    pub fn save(&self, root: &Path) -> CatalogResult<()> {
        let path = root.join(INSTRUMENTS_FILE);
        let list: Vec<&Instrument> = self.instruments.values().collect();
        let contents = serde_json::to_string_pretty(&list)
            .map_err(|e| CatalogError::io(&path, e))?;
        std::fs::write(&path, contents).map_err(|e| CatalogError::io(&path, e))
    }

    /// Insert or replace an instrument. Returns the previous definition, if any.
    pub fn insert(&mut self, instrument: Instrument) -> Option<Instrument> {
        self.instruments.insert(instrument.id.clone(), instrument)
    }

    pub fn get(&self, id: &str) -> Option<&Instrument> {
        self.instruments.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instruments.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.values()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl FromIterator<Instrument> for InstrumentRegistry {
    fn from_iter<I: IntoIterator<Item = Instrument>>(iter: I) -> Self {
        let mut registry = Self::default();
        for instrument in iter {
            registry.insert(instrument);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_registry_is_not_a_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let err = InstrumentRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::CatalogNotFound { .. }));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = InstrumentRegistry::default();
        registry.insert(Instrument::new("EURUSD.SIM", "SIM"));
        registry.insert(Instrument::new("BTCUSDT.BINANCE", "BINANCE"));
        registry.save(dir.path()).unwrap();

        let loaded = InstrumentRegistry::load(dir.path()).unwrap();
        assert_eq!(loaded, registry);
        assert!(loaded.contains("EURUSD.SIM"));
        assert_eq!(loaded.get("BTCUSDT.BINANCE").unwrap().venue, "BINANCE");
        // BTreeMap keeps ids sorted
        let ids: Vec<&str> = loaded.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["BTCUSDT.BINANCE", "EURUSD.SIM"]);
    }

    #[test]
    fn test_malformed_registry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INSTRUMENTS_FILE), "{not json").unwrap();
        let err = InstrumentRegistry::load(dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
