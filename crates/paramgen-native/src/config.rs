//! Configuration: runtime defaults, the optional YAML config file and schema files

use crate::strategy::CancelPolicy;
use paramgen_core::{RuntimeSettings, Schema, SchemaError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Overrides the default GPU offload layer count
pub const GPU_LAYERS_ENV: &str = "PARAMGEN_N_GPU_LAYERS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid schema {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },
}

/// Runtime settings for this machine
///
/// Threads default to the available parallelism but never fewer than 8; GPU
/// layers come from [`GPU_LAYERS_ENV`] when it parses.
pub fn runtime_defaults() -> RuntimeSettings {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(8);
    let n_gpu_layers = std::env::var(GPU_LAYERS_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    RuntimeSettings {
        n_threads: cores.max(8),
        n_gpu_layers,
        ..RuntimeSettings::default()
    }
}

/// Partial runtime settings; unset fields keep the lower layer's value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeOverrides {
    pub n_ctx: Option<u32>,
    pub n_threads: Option<u32>,
    pub n_gpu_layers: Option<u32>,
    pub n_batch: Option<u32>,
    pub cache_prompt: Option<bool>,
}

impl RuntimeOverrides {
    pub fn apply(&self, mut settings: RuntimeSettings) -> RuntimeSettings {
        if let Some(v) = self.n_ctx {
            settings.n_ctx = v;
        }
        if let Some(v) = self.n_threads {
            settings.n_threads = v;
        }
        if let Some(v) = self.n_gpu_layers {
            settings.n_gpu_layers = v;
        }
        if let Some(v) = self.n_batch {
            settings.n_batch = v;
        }
        if let Some(v) = self.cache_prompt {
            settings.cache_prompt = v;
        }
        settings
    }
}

/// Contents of the `--config` YAML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub runtime: RuntimeOverrides,
    pub cancel_policy: Option<CancelPolicy>,
    pub model_path: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read(path)?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and check a schema file. `.yaml`/`.yml` files are YAML, anything else JSON.
pub fn load_schema(path: &Path) -> Result<Schema, ConfigError> {
    let text = read(path)?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let schema = if is_yaml {
        Schema::from_yaml_str(&text)
    } else {
        Schema::from_json_str(&text)
    };
    let schema_err = |source| ConfigError::Schema {
        path: path.to_path_buf(),
        source,
    };
    let schema = schema.map_err(schema_err)?;
    schema.check().map_err(schema_err)?;
    Ok(schema)
}
