//! Configuration file parsing
//!
//! Reads `/etc/jobstats/config.toml` (or the path given with `--config`).

use jobstats_db::StorageConfig;
use jobstats_logging::Rotation;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jobstats/config.toml";

/// Error type for config operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// `[inline]` and `[external]` sections
    #[serde(flatten)]
    pub storage: StorageConfig,
}

/// `[logging]` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rotated log files
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Filter directives, e.g. `jobstats=debug`
    #[serde(default)]
    pub filter: Option<String>,

    /// Live log file plus rotated copies
    #[serde(default)]
    pub max_files: Option<usize>,

    /// Size at which the log file rolls over, in MiB
    #[serde(default)]
    pub max_file_mb: Option<u64>,
}

impl LoggingConfig {
    pub fn rotation(&self) -> Rotation {
        let default = Rotation::default();
        Rotation {
            max_files: self.max_files.unwrap_or(default.max_files).max(1),
            max_bytes: self
                .max_file_mb
                .map(|mb| mb.max(1) * 1024 * 1024)
                .unwrap_or(default.max_bytes),
        }
    }
}

/// Load configuration. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstats_db::StorageMode;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config(Path::new("/nonexistent/jobstats.toml")).unwrap();
        assert_eq!(config.storage.mode(), StorageMode::Inline);
        assert!(config.storage.inline.is_none());
        assert!(config.logging.dir.is_none());
        assert_eq!(config.logging.rotation(), Rotation::default());
    }

    #[test]
    fn test_full_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[logging]
dir = "/var/log/jobstats"
filter = "jobstats=debug"
max_files = 3
max_file_mb = 2

[inline]
url = "mysql://slurm@dbhost/slurm_acct_db"

[external]
enabled = true
host = "db.example.org"
user = "jobstats"
password = "secret"
database = "jobstats"
max_connections = 4

[external.tables]
summary = "stats_summary"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.logging.dir, Some(PathBuf::from("/var/log/jobstats")));
        assert_eq!(config.logging.filter.as_deref(), Some("jobstats=debug"));
        assert_eq!(
            config.logging.rotation(),
            Rotation {
                max_files: 3,
                max_bytes: 2 * 1024 * 1024,
            }
        );

        let storage = &config.storage;
        assert_eq!(storage.mode(), StorageMode::Relational);
        assert_eq!(
            storage.inline.as_ref().and_then(|c| c.url.as_deref()),
            Some("mysql://slurm@dbhost/slurm_acct_db")
        );

        let external = &storage.external;
        assert_eq!(external.connection.host.as_deref(), Some("db.example.org"));
        assert_eq!(external.connection.port, 3306);
        assert_eq!(external.connection.max_connections, 4);
        assert_eq!(external.tables.summary, "stats_summary");
        assert_eq!(external.tables.nodes, "job_nodes");
    }

    #[test]
    fn test_option_file_credentials() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[external]\nenabled = true\nconfig_file = \"/etc/jobstats/my.cnf\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(
            config.storage.external.connection.config_file,
            Some(PathBuf::from("/etc/jobstats/my.cnf"))
        );
        assert!(config.storage.external.connection.is_configured());
    }

    #[test]
    fn test_rotation_floors_at_one() {
        let logging = LoggingConfig {
            max_files: Some(0),
            max_file_mb: Some(0),
            ..Default::default()
        };
        assert_eq!(
            logging.rotation(),
            Rotation {
                max_files: 1,
                max_bytes: 1024 * 1024,
            }
        );
    }

    #[test]
    fn test_invalid_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[external\nenabled = yes").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }
}
