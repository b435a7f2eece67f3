//! Classification and evaluation with a network rebuilt from an exported document.

use std::path::{Path, PathBuf};

use burn::{data::dataloader::DataLoaderBuilder, prelude::*};

use crate::{
    data::{argmax, DataError, DigitBatcher, DigitDataset, Split},
    document::ParameterDocument,
    model::{Model, ModelConfig, INPUT_SIZE},
    store::ParameterError,
    training::{evaluate, EvaluationSummary, TrainingConfig},
};

const WIDTH: u32 = 28;
const HEIGHT: u32 = 28;

/// Errors raised while loading a document or classifying an image.
#[derive(thiserror::Error, Debug)]
pub enum InferenceError {
    /// A file could not be read.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The document is not valid JSON or not a parameter document.
    #[error("invalid parameter document {path}: {source}")]
    Document {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The document does not describe the configured network.
    #[error(transparent)]
    Parameters(#[from] ParameterError),

    /// The image could not be decoded.
    #[error("cannot decode image: {0}")]
    Image(#[from] image::ImageError),

    /// The image is not 28x28.
    #[error("image is {width}x{height}, expected 28x28")]
    Dimensions {
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
    },

    /// Raw pixels do not form a 28x28 image.
    #[error("sample has {0} pixels, expected 784")]
    Pixels(usize),

    /// The network output could not be read back.
    #[error("cannot read network output: {0}")]
    Output(String),

    /// The test split could not be read.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Evaluation needs a batch size greater than 0.
    #[error("evaluation batch size must be greater than 0")]
    BatchSize,
}

/// Predicted class of an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Class with the highest probability, the first one on ties.
    pub label: usize,
    /// Softmax output, one probability per class.
    pub probabilities: Vec<f32>,
}

/// Reads an exported document.
pub fn load_document(path: &Path) -> Result<ParameterDocument, InferenceError> {
    let bytes = std::fs::read(path).map_err(|source| InferenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    ParameterDocument::from_json(&bytes).map_err(|source| InferenceError::Document {
        path: path.to_path_buf(),
        source,
    })
}

/// Rebuilds the network from an exported document, checking names, order and shapes.
pub fn load_network<B: Backend>(
    document: &Path,
    config: &ModelConfig,
    device: &B::Device,
) -> Result<Model<B>, InferenceError> {
    let store = load_document(document)?.into_store();
    let model = config.init_with::<B>(&store, device)?;

    log::info!("Loaded {} parameters from {}", store.len(), document.display());

    Ok(model)
}

/// Reads an image file as a 28x28 grey-scale sample. Colour images are converted to luma.
pub fn read_image(path: &Path) -> Result<Vec<u8>, InferenceError> {
    let image = image::open(path)?;
    if image.width() != WIDTH || image.height() != HEIGHT {
        return Err(InferenceError::Dimensions {
            width: image.width(),
            height: image.height(),
        });
    }

    Ok(image.to_luma8().into_raw())
}

/// Classifies one 28x28 image given as row-major bytes.
pub fn classify<B: Backend>(
    model: &Model<B>,
    pixels: &[u8],
    device: &B::Device,
) -> Result<Prediction, InferenceError> {
    if pixels.len() != INPUT_SIZE {
        return Err(InferenceError::Pixels(pixels.len()));
    }

    let pixels: Vec<f32> = pixels.iter().map(|pixel| *pixel as f32 / 255.0).collect();
    let input = Tensor::<B, 2>::from_data(TensorData::new(pixels, [1, INPUT_SIZE]), device);

    let probabilities = model
        .forward(input)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| InferenceError::Output(format!("{err:?}")))?;
    let label = argmax(&probabilities)
        .ok_or_else(|| InferenceError::Output("network produced no output".to_string()))?;

    Ok(Prediction {
        label,
        probabilities,
    })
}

/// Classifies an image file with the network stored in an exported document.
pub fn predict<B: Backend>(
    document: &Path,
    image: &Path,
    config: &ModelConfig,
    device: &B::Device,
) -> Result<Prediction, InferenceError> {
    let model = load_network::<B>(document, config, device)?;
    let pixels = read_image(image)?;

    let prediction = classify(&model, &pixels, device)?;
    let confidence = prediction
        .probabilities
        .get(prediction.label)
        .copied()
        .unwrap_or_default();
    log::info!(
        "{} => class {} ({:.2} %)",
        image.display(),
        prediction.label,
        100.0 * confidence
    );

    Ok(prediction)
}

/// Evaluates the network stored in an exported document on the test split of the configured
/// dataset, reporting the same loss and accuracy as an evaluation of the saved model.
pub fn evaluate_document<B: Backend>(
    document: &Path,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<EvaluationSummary, InferenceError> {
    if config.eval_batch_size == 0 {
        return Err(InferenceError::BatchSize);
    }

    let model = load_network::<B>(document, &config.model, device)?;
    let dataset = DigitDataset::load(
        Path::new(&config.data_dir),
        config.dataset,
        Split::Test,
        config.data_format,
    )?;
    let loader = DataLoaderBuilder::new(DigitBatcher::<B>::new(device.clone()))
        .batch_size(config.eval_batch_size)
        .build(dataset);

    let summary = evaluate(&model, loader.as_ref());
    log::info!(
        "{}: average loss {:.4} | predicted correct: {} / {} => {:.2} %",
        document.display(),
        summary.average_loss(),
        summary.correct,
        summary.samples,
        summary.accuracy()
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifact::encode_sample,
        data::{DataFormat, DigitItem},
        training::Mode,
        variant::DatasetVariant,
        TestBackend,
    };

    fn write_document(dir: &Path, model: &Model<TestBackend>) -> PathBuf {
        let path = dir.join("model_weights_biases.json");
        let document = ParameterDocument::from_store(&model.parameters()).unwrap();
        std::fs::write(&path, document.to_json_pretty().unwrap()).unwrap();
        path
    }

    #[test]
    fn should_predict_like_the_exported_model() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = ModelConfig::new();
        let model = config.init::<TestBackend>(&device);
        let document = write_document(dir.path(), &model);
        let pixels: Vec<u8> = (0..INPUT_SIZE).map(|i| (i * 7 % 256) as u8).collect();
        let image = dir.path().join("sample.bmp");
        let bitmap = encode_sample(&DigitItem::new(pixels.clone(), 0)).unwrap();
        std::fs::write(&image, bitmap).unwrap();

        let prediction = predict::<TestBackend>(&document, &image, &config, &device).unwrap();

        let expected = classify(&model, &pixels, &device).unwrap();
        assert_eq!(prediction.label, expected.label);
        for (lhs, rhs) in prediction.probabilities.iter().zip(&expected.probabilities) {
            assert!((lhs - rhs).abs() < 1e-6);
        }
        let sum: f32 = prediction.probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn should_reject_document_of_other_network() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = ModelConfig::new()
            .with_d_hidden(32)
            .init::<TestBackend>(&device);
        let document = write_document(dir.path(), &model);

        let result = load_network::<TestBackend>(&document, &ModelConfig::new(), &device);

        assert!(matches!(
            result,
            Err(InferenceError::Parameters(ParameterError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn should_reject_truncated_pixels() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);

        let result = classify(&model, &[0; 100], &device);

        assert!(matches!(result, Err(InferenceError::Pixels(100))));
    }

    #[test]
    fn should_evaluate_document_on_test_split() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let document = write_document(dir.path(), &model);
        let items = vec![
            DigitItem::new(vec![0; INPUT_SIZE], 3),
            DigitItem::new(vec![255; INPUT_SIZE], 8),
        ];
        let mut text = std::iter::once("label".to_string())
            .chain((0..INPUT_SIZE).map(|i| format!("pixel{i}")))
            .collect::<Vec<_>>()
            .join(",");
        for item in &items {
            let row: Vec<String> = std::iter::once(item.label)
                .chain(item.pixels.iter().copied())
                .map(|value| value.to_string())
                .collect();
            text.push('\n');
            text.push_str(&row.join(","));
        }
        std::fs::write(dir.path().join("mnist_test.csv"), text).unwrap();
        let config = TrainingConfig::new(
            DatasetVariant::Mnist,
            Mode::Evaluate,
            dir.path().to_string_lossy().into_owned(),
            dir.path().to_string_lossy().into_owned(),
        )
        .with_data_format(DataFormat::Csv);

        let summary = evaluate_document::<TestBackend>(&document, &config, &device).unwrap();

        let expected: usize = items
            .iter()
            .map(|item| classify(&model, &item.pixels, &device).unwrap())
            .zip(&items)
            .filter(|(prediction, item)| prediction.label == item.label as usize)
            .count();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.correct, expected);
        assert!(summary.average_loss() > 0.0);
    }

    #[test]
    fn should_reject_zero_evaluation_batch_size() {
        let config = TrainingConfig::new(
            DatasetVariant::Mnist,
            Mode::Evaluate,
            "data".to_string(),
            "artifacts".to_string(),
        )
        .with_eval_batch_size(0);

        let result = evaluate_document::<TestBackend>(
            Path::new("absent.json"),
            &config,
            &Default::default(),
        );

        assert!(matches!(result, Err(InferenceError::BatchSize)));
    }

    #[test]
    fn should_reject_image_of_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        image::GrayImage::new(30, 28).save(&path).unwrap();

        let result = read_image(&path);

        assert!(matches!(
            result,
            Err(InferenceError::Dimensions {
                width: 30,
                height: 28
            })
        ));
    }
}
