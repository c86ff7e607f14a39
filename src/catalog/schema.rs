//! Partition file schema.
//!
//! Every partition is a standalone SQLite database. Rows are appended in
//! ascending `ts_init` order, so `row_id` order is time order.

pub const PARTITION_SCHEMA: &str = r#"
PRAGMA journal_mode = DELETE;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS records (
    row_id INTEGER PRIMARY KEY,
    ts_event INTEGER NOT NULL,
    ts_init INTEGER NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_ts_init ON records(ts_init);

CREATE TABLE IF NOT EXISTS partition_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

pub const SCHEMA_VERSION: &str = "1";

pub const META_DATA_CLASS: &str = "data_class";
pub const META_INSTRUMENT_ID: &str = "instrument_id";
pub const META_SCHEMA_VERSION: &str = "schema_version";

pub const INSTRUMENTS_FILE: &str = "instruments.json";
pub const DATA_DIR: &str = "data";

const PARTITION_PREFIX: &str = "part-";
const PARTITION_EXT: &str = "sqlite";

/// File name of the `n`-th partition in a directory.
pub fn partition_file_name(n: u32) -> String {
    format!("{}{:05}.{}", PARTITION_PREFIX, n, PARTITION_EXT)
}

/// Inverse of [`partition_file_name`].
pub fn parse_partition_number(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(PARTITION_PREFIX)?
        .strip_suffix(PARTITION_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_names_sort_in_order() {
        assert_eq!(partition_file_name(3), "part-00003.sqlite");
        assert!(partition_file_name(9) < partition_file_name(10));
        assert_eq!(parse_partition_number("part-00042.sqlite"), Some(42));
        assert_eq!(parse_partition_number("part-00042.sqlite-journal"), None);
        assert_eq!(parse_partition_number("notes.txt"), None);
    }
}
