//! Merge configuration
//!
//! Batch sizing, read granularity and the ordered source list.

use crate::catalog::DataSourceConfig;
use crate::error::{CatalogError, CatalogResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

pub const DEFAULT_TARGET_BATCH_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_READ_NUM_ROWS: usize = 10_000;

/// What to do when a source fails to resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSourceError {
    /// Fail the whole merge before emitting anything.
    #[default]
    Abort,
    /// Log a warning and merge without the source.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Soft cap on estimated bytes per batch
    #[serde(
        default = "default_target_batch_size_bytes",
        deserialize_with = "deserialize_bytes"
    )]
    pub target_batch_size_bytes: u64,

    /// Rows read per source per refill
    #[serde(default = "default_read_num_rows")]
    pub read_num_rows: usize,

    #[serde(default)]
    pub on_source_error: OnSourceError,

    /// Fail a source whose records go backwards in time
    #[serde(default)]
    pub validate_order: bool,

    /// Read the next chunk of each source on a background thread
    #[serde(default)]
    pub prefetch: bool,

    /// Declaration order is the tie-break order
    #[serde(default)]
    pub sources: Vec<DataSourceConfig>,
}

fn default_target_batch_size_bytes() -> u64 {
    DEFAULT_TARGET_BATCH_SIZE_BYTES
}

fn default_read_num_rows() -> usize {
    DEFAULT_READ_NUM_ROWS
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            target_batch_size_bytes: DEFAULT_TARGET_BATCH_SIZE_BYTES,
            read_num_rows: DEFAULT_READ_NUM_ROWS,
            on_source_error: OnSourceError::Abort,
            validate_order: false,
            prefetch: false,
            sources: Vec::new(),
        }
    }
}

impl MergeConfig {
    pub fn new(target_batch_size_bytes: u64, read_num_rows: usize) -> Self {
        Self {
            target_batch_size_bytes,
            read_num_rows,
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: DataSourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_on_source_error(mut self, policy: OnSourceError) -> Self {
        self.on_source_error = policy;
        self
    }

    pub fn with_validate_order(mut self, enabled: bool) -> Self {
        self.validate_order = enabled;
        self
    }

    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
        self
    }

    /// Reject values the merger cannot run with.
    pub fn validate(&self) -> CatalogResult<()> {
        if self.target_batch_size_bytes == 0 {
            return Err(CatalogError::invalid_config(
                "target_batch_size_bytes",
                "must be greater than zero",
            ));
        }
        if self.read_num_rows == 0 {
            return Err(CatalogError::invalid_config(
                "read_num_rows",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `MERGE_CONFIG_PATH` or the default path
    pub fn from_env() -> anyhow::Result<Self> {
        let path =
            std::env::var("MERGE_CONFIG_PATH").unwrap_or_else(|_| "merge_config.toml".to_string());
        tracing::debug!(path = %path, "Loading merge config");
        Self::load(&path)
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Parse a byte count such as `4096`, `"10kib"`, `"1.5mb"` or `"2 GiB"`.
pub fn parse_bytes(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "kib" | "k" => 1 << 10,
        "mb" => 1_000_000,
        "mib" | "m" => 1 << 20,
        "gb" => 1_000_000_000,
        "gib" | "g" => 1 << 30,
        _ => return None,
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return None;
    }
    Some(bytes.round() as u64)
}

fn deserialize_bytes<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => Ok(n),
        Raw::Text(s) => parse_bytes(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid byte size '{}'", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DataClass;

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("4096"), Some(4096));
        assert_eq!(parse_bytes("10kib"), Some(10 * 1024));
        assert_eq!(parse_bytes("1mib"), Some(1024 * 1024));
        assert_eq!(parse_bytes("1.5 MB"), Some(1_500_000));
        assert_eq!(parse_bytes("2GiB"), Some(2 << 30));
        assert_eq!(parse_bytes("ten"), None);
        assert_eq!(parse_bytes("10 parsecs"), None);
    }

    #[test]
    fn test_config_from_toml() {
        let config: MergeConfig = toml::from_str(
            r#"
            target_batch_size_bytes = "64kib"
            read_num_rows = 500
            on_source_error = "skip"

            [[sources]]
            catalog_location = "/data/catalog"
            data_class = "quote_tick"
            instrument_id = "EURUSD.SIM"

            [[sources]]
            catalog_location = "/data/catalog"
            data_class = "news_event"
            client_id = "NewsClient"
            "#,
        )
        .unwrap();

        assert_eq!(config.target_batch_size_bytes, 64 * 1024);
        assert_eq!(config.read_num_rows, 500);
        assert_eq!(config.on_source_error, OnSourceError::Skip);
        assert!(!config.validate_order);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(
            config.sources[0],
            DataSourceConfig::new("/data/catalog", DataClass::QuoteTick).with_instrument("EURUSD.SIM")
        );
    }

    #[test]
    fn test_defaults_and_validation() {
        let config: MergeConfig = toml::from_str("").unwrap();
        assert_eq!(config, MergeConfig::default());
        assert!(config.validate().is_ok());

        let err = MergeConfig::new(0, 10).validate().unwrap_err();
        assert!(matches!(err, CatalogError::InvalidConfig { ref field, .. } if field == "target_batch_size_bytes"));
        let err = MergeConfig::new(10, 0).validate().unwrap_err();
        assert!(matches!(err, CatalogError::InvalidConfig { ref field, .. } if field == "read_num_rows"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge.toml");
        let config = MergeConfig::new(2048, 16)
            .with_validate_order(true)
            .with_source(DataSourceConfig::new("/cat", DataClass::Bar).with_instrument("A.SIM"));
        config.save(&path).unwrap();
        assert_eq!(MergeConfig::load(&path).unwrap(), config);
    }
}
