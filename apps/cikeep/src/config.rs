//! # Configuration
//!
//! Settings loaded from `cikeep.toml`.
//!
//! ```toml
//! database = "cikeep.redb"
//! # Highest precedence first.
//! read_layers = ["override", "main"]
//! write_layer = "override"
//!
//! [[traits]]
//! id = "host"
//!
//! [[traits.required_attributes]]
//! identifier = "hostname"
//! name = "host.hostname"
//! type = "Text"
//! is_array = false
//! is_id = true
//! ```
//!
//! Every key is optional. Command line flags override file values.

use cikeep_core::{CmdbError, LayerId, LayerSet, TraitSchema, TraitSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when `--config` is absent.
pub const CONFIG_FILE_NAME: &str = "cikeep.toml";

/// Database path used when neither the file nor the flags name one.
pub const DEFAULT_DATABASE: &str = "cikeep.redb";

/// Layer used when neither the file nor the flags name one.
pub const DEFAULT_LAYER: &str = "main";

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

fn default_read_layers() -> Vec<String> {
    vec![DEFAULT_LAYER.to_string()]
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path of the redb database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Layers consulted by reads, highest precedence first.
    #[serde(default = "default_read_layers")]
    pub read_layers: Vec<String>,
    /// Layer receiving writes. Defaults to the first read layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_layer: Option<String>,
    /// Trait definitions.
    #[serde(default)]
    pub traits: Vec<TraitSchema>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            read_layers: default_read_layers(),
            write_layer: None,
            traits: Vec::new(),
        }
    }
}

/// Values given on the command line, taking precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub read_layers: Option<Vec<String>>,
    pub write_layer: Option<String>,
}

impl AppConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, CmdbError> {
        toml::from_str(source).map_err(|e| CmdbError::Config(e.to_string()))
    }

    /// Load `path`, or `cikeep.toml` from the working directory if present,
    /// or fall back to defaults.
    ///
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, CmdbError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let implicit = PathBuf::from(CONFIG_FILE_NAME);
                if !implicit.is_file() {
                    tracing::debug!("no config file, using defaults");
                    return Ok(Self::default());
                }
                implicit
            }
        };
        let source = std::fs::read_to_string(&path).map_err(|e| {
            CmdbError::Io(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), traits = config.traits.len(), "config loaded");
        Ok(config)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(database) = overrides.database {
            self.database = database;
        }
        if let Some(read_layers) = overrides.read_layers {
            self.read_layers = read_layers;
        }
        if let Some(write_layer) = overrides.write_layer {
            self.write_layer = Some(write_layer);
        }
        self
    }

    pub fn layer_set(&self) -> Result<LayerSet, CmdbError> {
        LayerSet::new(self.read_layers.iter().map(LayerId::new).collect())
    }

    /// The configured write layer, else the highest-precedence read layer.
    pub fn write_layer(&self) -> Result<LayerId, CmdbError> {
        self.write_layer
            .as_deref()
            .or_else(|| self.read_layers.first().map(String::as_str))
            .map(LayerId::new)
            .ok_or_else(|| CmdbError::Config("no write layer configured".to_string()))
    }

    /// Validate the configured traits into a [`TraitSet`].
    pub fn trait_set(&self) -> Result<TraitSet, CmdbError> {
        TraitSet::new(self.traits.iter().cloned())
    }
}
