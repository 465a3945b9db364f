use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelLoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub size_class: SizeClass,
    /// Validation accuracy reported by the model publisher, `0.0..=1.0`.
    pub accuracy: Option<f64>,
}

/// A model artifact ready for inference.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub id: String,
    pub version: String,
    pub metadata: ModelMetadata,
    pub artifact: Vec<u8>,
}

/// Where model artifacts come from.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<LoadedModel, ModelLoadError>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    version: String,
    size_class: SizeClass,
    #[serde(default)]
    accuracy: Option<f64>,
    /// Artifact file name relative to the model directory.
    #[serde(default)]
    artifact: Option<String>,
}

/// Loads `<dir>/<model_id>.json` manifests and the artifact they name.
#[derive(Debug, Clone)]
pub struct DirectoryModelSource {
    dir: PathBuf,
}

impl DirectoryModelSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn valid_model_id(model_id: &str) -> bool {
    !model_id.is_empty()
        && model_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !model_id.starts_with('.')
}

#[async_trait]
impl ModelSource for DirectoryModelSource {
    async fn load(&self, model_id: &str) -> Result<LoadedModel, ModelLoadError> {
        if !valid_model_id(model_id) {
            return Err(ModelLoadError::NotFound {
                model_id: model_id.to_string(),
            });
        }

        let manifest_path = self.dir.join(format!("{model_id}.json"));
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => ModelLoadError::NotFound {
                    model_id: model_id.to_string(),
                },
                _ => ModelLoadError::source_error(model_id, err.to_string()),
            })?;

        let manifest: Manifest = serde_json::from_str(&raw).map_err(|err| {
            ModelLoadError::source_error(model_id, format!("bad manifest: {err}"))
        })?;

        let artifact = match &manifest.artifact {
            Some(file) => {
                let file_name = Path::new(file)
                    .file_name()
                    .ok_or_else(|| ModelLoadError::source_error(model_id, "artifact has no file name"))?;
                tokio::fs::read(self.dir.join(file_name)).await.map_err(|err| {
                    ModelLoadError::source_error(model_id, format!("artifact {file}: {err}"))
                })?
            }
            None => Vec::new(),
        };

        tracing::debug!(model_id, version = %manifest.version, bytes = artifact.len(), "model artifact read");

        Ok(LoadedModel {
            id: model_id.to_string(),
            version: manifest.version,
            metadata: ModelMetadata {
                size_class: manifest.size_class,
                accuracy: manifest.accuracy,
            },
            artifact,
        })
    }
}
