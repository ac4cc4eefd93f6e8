//! Service configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Index backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Sqlite,
    Leveldb,
}

/// Service configuration, resolved from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for per-model blob and index data.
    pub data_dir: PathBuf,

    /// HTTP bind host.
    pub host: String,

    /// HTTP bind port.
    pub port: u16,

    /// Default model name used when a request omits `model_name`.
    pub default_model: String,

    /// Index backend.
    pub db_type: DbType,

    /// Number of request-worker processes to spawn.
    pub workers: usize,

    /// Allowed CORS origins. `["*"]` allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            default_model: String::new(),
            db_type: DbType::Sqlite,
            workers: 1,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Data directory for one model's blob and index files.
    pub fn model_dir(&self, model_name: &str) -> PathBuf {
        self.data_dir
            .join(crate::catalog::Catalog::normalize_name(model_name))
    }
}

/// Config builder for fluent construction from parsed CLI args.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    data_dir: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    default_model: Option<String>,
    db_type: Option<DbType>,
    workers: Option<usize>,
    cors_origins: Option<Vec<String>>,
}

impl ConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn default_model(mut self, name: impl Into<String>) -> Self {
        self.default_model = Some(name.into());
        self
    }

    pub fn db_type(mut self, db_type: DbType) -> Self {
        self.db_type = Some(db_type);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn build(self) -> Config {
        let defaults = Config::default();
        Config {
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            default_model: self.default_model.unwrap_or(defaults.default_model),
            db_type: self.db_type.unwrap_or(defaults.db_type),
            workers: self.workers.unwrap_or(defaults.workers).max(1),
            cors_origins: self.cors_origins.unwrap_or(defaults.cors_origins),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::builder()
            .data_dir("/tmp/cache")
            .port(9090)
            .db_type(DbType::Leveldb)
            .workers(4)
            .build();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(config.port, 9090);
        assert_eq!(config.db_type, DbType::Leveldb);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.db_type, DbType::Sqlite);
        assert_eq!(config.cors_origins, vec!["*".to_string()]);
    }

    #[test]
    fn workers_floored_at_one() {
        let config = Config::builder().workers(0).build();
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn model_dir_normalizes_name() {
        let config = Config::builder().data_dir("/data").build();
        assert_eq!(config.model_dir("a/b"), PathBuf::from("/data/a_b"));
    }
}
