use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::extract::RNA_NAMESPACE;
use crate::schema::PARTITION_COLUMN;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "rna_etl.toml";

/// Settings shared by ingestion and export.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Aid records buffered per file before a flush.
    pub threshold: usize,
    pub namespace_uri: String,
    pub dataset_root: PathBuf,
    pub partition_key: String,
    pub workers: usize,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: 10_000,
            namespace_uri: RNA_NAMESPACE.to_string(),
            dataset_root: PathBuf::from("public/parquet"),
            partition_key: PARTITION_COLUMN.to_string(),
            workers: 4,
            log_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the TOML file (`path`, or [`DEFAULT_CONFIG_FILE`] if it
    /// exists), then `RNA_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let file = match path {
            Some(p) => File::from(p).format(FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };

        let cfg = Config::builder()
            .set_default("threshold", defaults.threshold as i64)?
            .set_default("namespace_uri", defaults.namespace_uri)?
            .set_default("dataset_root", defaults.dataset_root.to_string_lossy().into_owned())?
            .set_default("partition_key", defaults.partition_key)?
            .set_default("workers", defaults.workers as i64)?
            .add_source(file)
            .add_source(Environment::with_prefix("RNA").try_parsing(true))
            .build()?;

        let loaded: Self = cfg.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::Invalid("threshold must be greater than zero".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be greater than zero".into()));
        }
        if self.namespace_uri.trim().is_empty() {
            return Err(ConfigError::Invalid("namespace_uri must not be empty".into()));
        }
        if self.partition_key.trim().is_empty() || self.partition_key.contains(['=', '/']) {
            return Err(ConfigError::Invalid(format!(
                "partition_key {:?} is not a usable directory key",
                self.partition_key
            )));
        }
        Ok(())
    }
}
