use std::path::PathBuf;

use serde::Deserialize;

/// Daemon configuration, read from `REZCORE_*` environment variables.
///
/// - `REZCORE_DATA_DIR` (default `./data`)
/// - `REZCORE_WAL_FILE` (default `rezcore.wal`, relative to the data dir)
/// - `REZCORE_COMPACT_THRESHOLD` (default 1000 appends)
/// - `REZCORE_HOUSEKEEPING_INTERVAL_SECS` (default 60)
/// - `REZCORE_METRICS_PORT` (unset disables the Prometheus exporter)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_wal_file")]
    pub wal_file: String,

    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: u64,

    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,

    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_wal_file() -> String {
    "rezcore.wal".into()
}

fn default_compact_threshold() -> u64 {
    1000
}

fn default_housekeeping_interval() -> u64 {
    60
}

impl Config {
    /// Load a `.env` file if present, then read the environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Parse from explicit `(key, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("REZCORE_").from_iter(vars)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_vars(vars(&[("UNRELATED", "x")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.wal_path(), PathBuf::from("./data/rezcore.wal"));
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.housekeeping_interval_secs, 60);
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn prefixed_values_override() {
        let config = Config::from_vars(vars(&[
            ("REZCORE_DATA_DIR", "/var/lib/rezcore"),
            ("REZCORE_COMPACT_THRESHOLD", "50"),
            ("REZCORE_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/rezcore/rezcore.wal"));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_number_is_an_error() {
        assert!(Config::from_vars(vars(&[("REZCORE_COMPACT_THRESHOLD", "lots")])).is_err());
    }
}
