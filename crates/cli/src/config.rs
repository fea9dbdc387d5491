//! Layered configuration: TOML file, then environment, then CLI flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracksync_engine::{EngineConfig, TrackerEndpoint};

/// Config file read when `--config` is not given. Missing is fine.
pub(crate) const DEFAULT_CONFIG_FILE: &str = "tracksync.toml";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StorageBackend {
    #[default]
    Sqlite,
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "file" => Ok(StorageBackend::File),
            other => Err(format!("expected 'sqlite' or 'file', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ServerConfig {
    pub(crate) port: u16,
    pub(crate) api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct StorageConfig {
    pub(crate) backend: StorageBackend,
    /// Database file (sqlite) or data directory (file).
    pub(crate) path: Option<PathBuf>,
}

impl StorageConfig {
    pub(crate) fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(path), _) => path.clone(),
            (None, StorageBackend::Sqlite) => PathBuf::from("tracksync.db"),
            (None, StorageBackend::File) => PathBuf::from("tracksync-data"),
        }
    }
}

/// The whole configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct AppConfig {
    pub(crate) server: ServerConfig,
    pub(crate) storage: StorageConfig,
    pub(crate) engine: EngineConfig,
    pub(crate) trackers: HashMap<String, TrackerEndpoint>,
}

impl AppConfig {
    /// Load from `path` (or the default file if present), then apply
    /// environment overrides.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    AppConfig::default()
                }
            }
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub(crate) fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `TRACKSYNC_*` overrides. `lookup` is the environment.
    pub(crate) fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = lookup("TRACKSYNC_PORT") {
            self.server.port = port.parse().map_err(|e| ConfigError::Env {
                var: "TRACKSYNC_PORT",
                message: format!("{e}"),
            })?;
        }
        if let Some(key) = lookup("TRACKSYNC_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Some(backend) = lookup("TRACKSYNC_STORAGE_BACKEND") {
            self.storage.backend = backend.parse().map_err(|message| ConfigError::Env {
                var: "TRACKSYNC_STORAGE_BACKEND",
                message,
            })?;
        }
        if let Some(path) = lookup("TRACKSYNC_STORAGE_PATH") {
            self.storage.path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate().map_err(ConfigError::Invalid)?;
        for (system, endpoint) in &self.trackers {
            if !endpoint.base_url.starts_with("http://") && !endpoint.base_url.starts_with("https://")
            {
                return Err(ConfigError::Invalid(format!(
                    "trackers.{system}.base_url must be an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    /// The effective configuration as JSON, with secrets masked.
    pub(crate) fn redacted(&self) -> serde_json::Value {
        let mask = |secret: &Option<String>| secret.as_ref().map(|_| "********");
        let trackers: serde_json::Map<String, serde_json::Value> = self
            .trackers
            .iter()
            .map(|(system, endpoint)| {
                (
                    system.clone(),
                    serde_json::json!({
                        "base_url": endpoint.base_url,
                        "auth_token": mask(&endpoint.auth_token),
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "server": {
                "port": self.server.port,
                "api_key": mask(&self.server.api_key),
            },
            "storage": {
                "backend": self.storage.backend,
                "path": self.storage.resolved_path(),
            },
            "engine": {
                "workers": self.engine.workers,
                "queue_depth": self.engine.queue_depth,
                "call_timeout_ms": self.engine.call_timeout_ms,
                "storage_retries": self.engine.storage_retries,
                "list_limit_max": self.engine.list_limit_max,
                "heartbeat_interval_ms": self.engine.heartbeat_interval_ms,
                "heartbeat_timeout_ms": self.engine.heartbeat_timeout_ms,
                "reference_ttl_ms": self.engine.reference_ttl_ms,
                "snapshot_retention_days": self.engine.snapshot_retention_days,
                "sweep_interval_ms": self.engine.sweep_interval_ms,
            },
            "trackers": trackers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.storage.resolved_path(), PathBuf::from("tracksync.db"));
    }

    #[test]
    fn full_file_parses() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            api_key = "k"

            [storage]
            backend = "file"
            path = "/var/lib/tracksync"

            [engine]
            workers = 8
            reference_ttl_ms = 5000

            [trackers.jira]
            base_url = "https://jira.example.com/api"
            auth_token = "t"

            [trackers.youtrack]
            base_url = "https://youtrack.example.com/api"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.engine.workers, 8);
        assert_eq!(config.engine.queue_depth, 256);
        assert_eq!(config.trackers.len(), 2);
        assert_eq!(config.trackers["youtrack"].auth_token, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<AppConfig>("[server]\nprot = 1\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut config = AppConfig::default();
        config
            .apply_env(|var| match var {
                "TRACKSYNC_PORT" => Some("7070".into()),
                "TRACKSYNC_STORAGE_BACKEND" => Some("file".into()),
                "TRACKSYNC_STORAGE_PATH" => Some("/tmp/ts".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.port, 7070);
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.storage.resolved_path(), PathBuf::from("/tmp/ts"));
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(|var| (var == "TRACKSYNC_STORAGE_BACKEND").then(|| "postgres".into()))
            .unwrap_err();
        assert!(err.to_string().contains("TRACKSYNC_STORAGE_BACKEND"));
    }

    #[test]
    fn non_http_tracker_url_is_invalid() {
        let mut config = AppConfig::default();
        config.trackers.insert(
            "jira".into(),
            TrackerEndpoint {
                base_url: "ftp://jira".into(),
                auth_token: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn redacted_masks_secrets() {
        let mut config = AppConfig::default();
        config.server.api_key = Some("secret".into());
        let shown = config.redacted().to_string();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("********"));
    }
}
