use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Rewrite an organization's WAL after this many appends.
    pub compact_threshold: u64,
    pub overdue_scan_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            overdue_scan_interval: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Read `SHELF_*` variables, falling back to defaults for missing or unparsable values.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| parse::<u64>(&s));
        Self {
            data_dir: lookup("SHELF_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            compact_threshold: parsed("SHELF_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            overdue_scan_interval: parsed("SHELF_OVERDUE_SCAN_SECS")
                .filter(|secs| *secs > 0)
                .map_or(defaults.overdue_scan_interval, Duration::from_secs),
            metrics_port: lookup("SHELF_METRICS_PORT").and_then(|s| parse(&s)),
        }
    }
}

fn parse<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}
