//! Conversion of a saved parameter file into a JSON document.

use core::fmt;
use std::path::{Path, PathBuf};

use burn::prelude::*;

use crate::{
    artifact::{load_model, write_atomic, ArtifactError},
    document::{ParameterDocument, TransformError},
    model::ModelConfig,
    CpuBackend,
};

const DOCUMENT_SUFFIX: &str = "_weights_biases.json";

/// Configuration of a parameter export.
#[derive(Config, Debug)]
pub struct ExportConfig {
    /// Parameter file written by training.
    pub source: String,
    /// Document to write, `<source without extension>_weights_biases.json` when absent.
    pub destination: Option<String>,
    /// Network the parameter file must describe.
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
}

impl ExportConfig {
    /// Resolved destination path.
    pub fn destination_path(&self) -> PathBuf {
        match &self.destination {
            Some(destination) => PathBuf::from(destination),
            None => default_destination(Path::new(&self.source)),
        }
    }
}

/// Default document path of a parameter file: its extension replaced by `_weights_biases.json`.
pub fn default_destination(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    source.with_file_name(format!("{stem}{DOCUMENT_SUFFIX}"))
}

/// Step of the export pipeline an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading the parameter file.
    Load,
    /// Flattening parameters into the document.
    Transform,
    /// Rendering and writing the document.
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Transform => "transform",
            Self::Write => "write",
        })
    }
}

/// A failed export. No document is written when one is returned.
#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    /// The parameter file is missing, corrupt or describes another network.
    #[error("export failed at load stage: {0}")]
    Load(#[source] ArtifactError),

    /// A parameter cannot be represented in the document.
    #[error("export failed at transform stage: {0}")]
    Transform(#[from] TransformError),

    /// The document could not be rendered.
    #[error("export failed at write stage: {0}")]
    Render(#[from] serde_json::Error),

    /// The document could not be written.
    #[error("export failed at write stage: {0}")]
    Write(#[source] ArtifactError),
}

impl ExportError {
    /// The stage the export stopped at.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Load(_) => Stage::Load,
            Self::Transform(_) => Stage::Transform,
            Self::Render(_) | Self::Write(_) => Stage::Write,
        }
    }
}

/// Summary of a successful export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Written document.
    pub destination: PathBuf,
    /// Exported parameter names, in document order.
    pub parameters: Vec<String>,
}

/// Loads a parameter file on the CPU and writes it as a nested-array JSON document.
pub fn export(config: &ExportConfig) -> Result<ExportReport, ExportError> {
    let source = Path::new(&config.source);
    let destination = config.destination_path();
    let device = Default::default();

    log::info!("Exporting {}", source.display());
    let model =
        load_model::<CpuBackend>(source, &config.model, &device).map_err(ExportError::Load)?;

    let document = ParameterDocument::from_store(&model.parameters())?;
    for entry in document.entries() {
        log::debug!("{} {:?}", entry.name, entry.array.shape());
    }

    let bytes = document.to_json_pretty()?;
    write_atomic(&destination, &bytes).map_err(ExportError::Write)?;

    log::info!("Parameters exported to {}", destination.display());

    Ok(ExportReport {
        destination,
        parameters: document.names().map(str::to_string).collect(),
    })
}
