//! Configuration management for tallyd.
//!
//! Loads settings from /etc/tally/config.toml or uses defaults. API keys can
//! always be overridden through the environment so deployments never have to
//! put secrets in the config file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/tally/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// SQLite database holding the daily aggregates.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Append-only JSONL file recording each processed batch.
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,

    /// Static API key required for ingest. TALLY_WRITE_KEY overrides.
    #[serde(default)]
    pub write_key: String,

    /// Static API key accepted for the read endpoints; the write key also
    /// reads. TALLY_READ_KEY overrides.
    #[serde(default)]
    pub read_key: String,

    /// IANA zone the summary endpoint uses when the request names none.
    #[serde(default = "default_tz")]
    pub default_tz: String,

    /// Upper bound on items per ingest batch.
    #[serde(default = "default_max_batch_items")]
    pub max_batch_items: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_db_path() -> PathBuf {
    data_dir().join("aggregates.db")
}

fn default_audit_log_path() -> PathBuf {
    data_dir().join("ingest_audit.jsonl")
}

fn default_tz() -> String {
    "Europe/Madrid".to_string()
}

fn default_max_batch_items() -> usize {
    5000
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("tally")
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: default_db_path(),
            audit_log_path: default_audit_log_path(),
            write_key: String::new(),
            read_key: String::new(),
            default_tz: default_tz(),
            max_batch_items: default_max_batch_items(),
        }
    }
}

impl TallyConfig {
    pub fn load() -> Self {
        Self::load_from(Path::new(CONFIG_PATH))
    }

    pub fn load_from(path: &Path) -> Self {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Invalid config at {}: {} - using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };

        if let Ok(key) = std::env::var("TALLY_WRITE_KEY") {
            config.write_key = key;
        }
        if let Ok(key) = std::env::var("TALLY_READ_KEY") {
            config.read_key = key;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let config = TallyConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8787");
        assert_eq!(config.default_tz, "Europe/Madrid");
        assert_eq!(config.max_batch_items, 5000);
        assert!(config.write_key.is_empty());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen_addr = \"0.0.0.0:9000\"\nwrite_key = \"w-secret\""
        )
        .unwrap();

        let config = TallyConfig::load_from(file.path());
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.write_key, "w-secret");
        assert_eq!(config.max_batch_items, 5000);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = TallyConfig::load_from(Path::new("/nonexistent/tally.toml"));
        assert_eq!(config.listen_addr, "127.0.0.1:8787");
    }
}
