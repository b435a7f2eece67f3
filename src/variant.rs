//! Supported dataset variants and the artifact names derived from them.

use core::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::ModelConfig;

/// The dataset a model is trained on.
///
/// Both variants share the same 28x28 grey-scale layout and ten classes; they differ only in the
/// images, the data directory and the names of the produced artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DatasetVariant {
    /// Handwritten digits.
    Mnist,
    /// Zalando's Fashion-MNIST clothing images.
    Fashion,
}

impl DatasetVariant {
    /// Short lowercase name used as a file and directory prefix.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mnist => "mnist",
            Self::Fashion => "fashion",
        }
    }

    /// Human readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mnist => "MNIST",
            Self::Fashion => "Fashion-MNIST",
        }
    }

    /// File stem of the parameter file, e.g. `mnist_fc128_relu_fc10_softmax`.
    pub fn model_stem(&self, model: &ModelConfig) -> String {
        format!("{}_{}", self.name(), model.name())
    }

    /// File stem of the qualitative sample bitmap, e.g. `fashion_9`.
    pub fn sample_stem(&self, label: u8) -> String {
        format!("{}_{label}", self.name())
    }

    /// Directory holding the IDX files of this variant.
    pub fn data_dir(&self, root: &Path) -> PathBuf {
        root.join(self.name())
    }
}

impl fmt::Display for DatasetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
