//! Files produced by training: the binary parameter file and the sample bitmap.
//!
//! Every file is first written to a temporary file next to its destination and only renamed into
//! place once complete, so an interrupted run never leaves a truncated artifact behind.

use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder, RecorderError},
};
use image::{GrayImage, ImageFormat};

use crate::{
    data::DigitItem,
    model::{Model, ModelConfig, ModelRecord},
    store::ParameterError,
    variant::DatasetVariant,
};

const MODEL_EXTENSION: &str = "mpk";

type ModelRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Errors raised while reading or writing artifacts.
#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    /// The requested file does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// Reading or writing failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The parameter record could not be encoded or decoded.
    #[error("invalid parameter record {path}: {source}")]
    Record {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: RecorderError,
    },

    /// The record decoded but does not describe the configured network.
    #[error("parameters of {path} do not match the model: {source}")]
    Parameters {
        /// File involved.
        path: PathBuf,
        /// Mismatch found.
        source: ParameterError,
    },

    /// The sample could not be encoded as a bitmap.
    #[error("cannot encode sample image: {0}")]
    Image(#[from] image::ImageError),

    /// The sample does not hold a full 28x28 image.
    #[error("sample has {0} pixels, not a 28x28 image")]
    InvalidSample(usize),
}

/// Path of the parameter file of a variant, e.g. `<dir>/mnist_fc128_relu_fc10_softmax.mpk`.
pub fn model_path(artifact_dir: &Path, variant: DatasetVariant, config: &ModelConfig) -> PathBuf {
    artifact_dir.join(format!("{}.{MODEL_EXTENSION}", variant.model_stem(config)))
}

/// Path of the sample bitmap of a variant, e.g. `<dir>/fashion_9.bmp`.
pub fn sample_path(artifact_dir: &Path, variant: DatasetVariant, label: u8) -> PathBuf {
    artifact_dir.join(format!("{}.bmp", variant.sample_stem(label)))
}

/// Writes `bytes` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let io_error = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    if path.exists() {
        log::info!("File exists, replacing {}", path.display());
    }

    let mut file = tempfile::NamedTempFile::new_in(parent).map_err(io_error)?;
    file.write_all(bytes).map_err(io_error)?;
    file.flush().map_err(io_error)?;
    file.persist(path).map_err(|err| io_error(err.error))?;

    Ok(())
}

/// Saves the parameters of a model as a named MessagePack record.
pub fn save_model<B: Backend>(model: Model<B>, path: &Path) -> Result<(), ArtifactError> {
    let bytes = ModelRecorder::default()
        .record(model.into_record(), ())
        .map_err(|source| ArtifactError::Record {
            path: path.to_path_buf(),
            source,
        })?;

    write_atomic(path, &bytes)?;
    log::info!("Saved model parameters to {}", path.display());

    Ok(())
}

/// Loads a parameter file saved by [save_model] and checks it against the configured network.
pub fn load_model<B: Backend>(
    path: &Path,
    config: &ModelConfig,
    device: &B::Device,
) -> Result<Model<B>, ArtifactError> {
    if !path.is_file() {
        return Err(ArtifactError::NotFound(path.to_path_buf()));
    }

    let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let record: ModelRecord<B> =
        Recorder::<B>::load(&ModelRecorder::default(), bytes, device).map_err(|source| {
            ArtifactError::Record {
                path: path.to_path_buf(),
                source,
            }
        })?;

    let model = Model::from_record(record);
    model
        .parameters()
        .verify(&config.architecture())
        .map_err(|source| ArtifactError::Parameters {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(model)
}

/// Encodes a sample as an uncompressed 8-bit grey-scale BMP.
pub fn encode_sample(item: &DigitItem) -> Result<Vec<u8>, ArtifactError> {
    let image = GrayImage::from_raw(28, 28, item.pixels.clone())
        .ok_or(ArtifactError::InvalidSample(item.pixels.len()))?;

    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Bmp)?;

    Ok(bytes)
}

/// Writes a sample bitmap named after its variant and true label, returning its path.
pub fn save_sample(
    item: &DigitItem,
    artifact_dir: &Path,
    variant: DatasetVariant,
) -> Result<PathBuf, ArtifactError> {
    let path = sample_path(artifact_dir, variant, item.label);

    write_atomic(&path, &encode_sample(item)?)?;
    log::info!("Saved sample image to {}", path.display());

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    #[test]
    fn should_name_files_after_variant_and_model() {
        let dir = Path::new("artifacts");

        assert_eq!(
            model_path(dir, DatasetVariant::Mnist, &ModelConfig::new()),
            dir.join("mnist_fc128_relu_fc10_softmax.mpk")
        );
        assert_eq!(
            sample_path(dir, DatasetVariant::Fashion, 9),
            dir.join("fashion_9.bmp")
        );
    }

    #[test]
    fn should_replace_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn should_load_saved_model() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ModelConfig::new();
        let model = config.init::<TestBackend>(&device);
        let path = model_path(dir.path(), DatasetVariant::Mnist, &config);
        let images =
            Tensor::<TestBackend, 2>::random([2, 784], Distribution::Default, &device);
        let expected = model.forward(images.clone()).into_data();

        save_model(model, &path).unwrap();
        let loaded = load_model::<TestBackend>(&path, &config, &device).unwrap();

        let actual = loaded.forward(images).into_data();
        assert_eq!(
            expected.to_vec::<f32>().unwrap(),
            actual.to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn should_report_missing_model() {
        let dir = tempfile::tempdir().unwrap();

        let result = load_model::<TestBackend>(
            &dir.path().join("absent.mpk"),
            &ModelConfig::new(),
            &Default::default(),
        );

        assert!(matches!(result, Err(ArtifactError::NotFound(_))));
    }

    #[test]
    fn should_reject_corrupt_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.mpk");
        std::fs::write(&path, b"not a record").unwrap();

        let result = load_model::<TestBackend>(&path, &ModelConfig::new(), &Default::default());

        assert!(matches!(result, Err(ArtifactError::Record { .. })));
    }

    #[test]
    fn should_write_sample_as_bitmap() {
        let dir = tempfile::tempdir().unwrap();
        let pixels: Vec<u8> = (0..784).map(|i| (i % 256) as u8).collect();
        let item = DigitItem::new(pixels.clone(), 4);

        let path = save_sample(&item, dir.path(), DatasetVariant::Mnist).unwrap();

        assert_eq!(path, dir.path().join("mnist_4.bmp"));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"BM");
        let image = image::load_from_memory(&bytes).unwrap().to_luma8();
        assert_eq!(image.dimensions(), (28, 28));
        assert_eq!(image.into_raw(), pixels);
    }
}
