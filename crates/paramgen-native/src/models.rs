//! Model manifest resolution
//!
//! A `manifest.json` names the model files the generator expects. Nothing is
//! downloaded here; the catalog only resolves file names against the models
//! directory and reports which are present.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DEFAULT_REPO_ID: &str = "lmstudio-community/Qwen2.5-7B-Instruct-GGUF";
pub const DEFAULT_FILENAME: &str = "Qwen2.5-7B-Instruct-Q4_K_M.gguf";

/// Why a manifest was ignored
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub repo_id: String,
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    required_models: Vec<ModelEntry>,
}

pub fn builtin_entries() -> Vec<ModelEntry> {
    vec![ModelEntry {
        repo_id: DEFAULT_REPO_ID.to_string(),
        filename: DEFAULT_FILENAME.to_string(),
    }]
}

/// One manifest entry resolved against the models directory
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub entry: ModelEntry,
    pub path: PathBuf,
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models_dir: PathBuf,
    manifest: Option<PathBuf>,
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    /// Read `<dir>/manifest.json`, else `<dir>/../manifest.json`.
    ///
    /// A missing or unreadable manifest falls back to the built-in entry.
    pub fn load(models_dir: &Path) -> Self {
        let manifest = manifest_path(models_dir);
        let entries = match &manifest {
            None => {
                debug!(dir = %models_dir.display(), "no manifest, using built-in model entry");
                builtin_entries()
            }
            Some(path) => match read_manifest(path) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "manifest load failed, using built-in model entry");
                    builtin_entries()
                }
            },
        };

        Self {
            models_dir: models_dir.to_path_buf(),
            manifest,
            entries,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Manifest the entries came from, if any
    pub fn manifest(&self) -> Option<&Path> {
        self.manifest.as_deref()
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Path of the first entry's file. It may not exist yet.
    pub fn default_model_path(&self) -> Option<PathBuf> {
        self.entries
            .first()
            .filter(|entry| !entry.filename.is_empty())
            .map(|entry| self.models_dir.join(&entry.filename))
    }

    pub fn status(&self) -> Vec<ModelStatus> {
        self.entries
            .iter()
            .filter(|entry| !entry.filename.is_empty())
            .map(|entry| {
                let path = self.models_dir.join(&entry.filename);
                ModelStatus {
                    entry: entry.clone(),
                    present: path.is_file(),
                    path,
                }
            })
            .collect()
    }
}

fn manifest_path(models_dir: &Path) -> Option<PathBuf> {
    let inside = models_dir.join(MANIFEST_FILE);
    let beside = models_dir.parent().map(|parent| parent.join(MANIFEST_FILE));
    std::iter::once(inside)
        .chain(beside)
        .find(|candidate| candidate.is_file())
}

fn read_manifest(path: &Path) -> Result<Vec<ModelEntry>, ManifestError> {
    let text = fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest: Manifest = serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(manifest.required_models)
}
