//! Training and evaluation runs.

use std::path::Path;

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    lr_scheduler::{step::StepLrSchedulerConfig, LrScheduler},
    module::AutodiffModule,
    nn::loss::{MseLoss, Reduction},
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::{
    artifact::{self, ArtifactError},
    data::{DataError, DataFormat, DigitBatch, DigitBatcher, DigitDataset, Split},
    model::{Model, ModelConfig},
    variant::DatasetVariant,
};

const CONFIG_FILE: &str = "config.json";

/// What a run does with the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Fit a fresh model, then evaluate it after every epoch.
    Train,
    /// Evaluate a previously saved model on the test split.
    Evaluate,
}

/// Everything a training or evaluation run depends on.
#[derive(Config)]
pub struct TrainingConfig {
    /// Dataset variant to read.
    pub dataset: DatasetVariant,
    /// Train or evaluate.
    pub mode: Mode,
    /// Directory the dataset files are read from.
    pub data_dir: String,
    /// Directory the artifacts are written to.
    pub artifact_dir: String,
    /// Network to fit.
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    /// Optimizer settings.
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    /// Learning rate of the first epoch.
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Number of passes over the training split.
    #[config(default = 10)]
    pub num_epochs: usize,
    /// Training batch size.
    #[config(default = 32)]
    pub batch_size: usize,
    /// Persist the parameters, the config and a sample bitmap once training is done.
    #[config(default = false)]
    pub save_model: bool,
    /// Evaluation batch size.
    #[config(default = 1000)]
    pub eval_batch_size: usize,
    /// Epochs between two learning rate decays.
    #[config(default = 5)]
    pub lr_step_size: usize,
    /// Learning rate decay factor.
    #[config(default = 0.8)]
    pub lr_gamma: f64,
    /// Seed of the backend and of the shuffling.
    #[config(default = 42)]
    pub seed: u64,
    /// Iterations between two training loss reports; zero disables them.
    #[config(default = 10)]
    pub log_interval: usize,
    /// On-disk layout of the dataset.
    #[config(default = "DataFormat::Idx")]
    pub data_format: DataFormat,
}

/// Errors raised by training and evaluation runs.
#[derive(thiserror::Error, Debug)]
pub enum TrainingError {
    /// A dataset could not be read.
    #[error(transparent)]
    Data(#[from] DataError),

    /// An artifact could not be read or written.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// The configuration cannot drive a run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration could not be serialized.
    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Accumulated held-out evaluation results.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvaluationSummary {
    /// Summed squared error over every evaluated sample.
    pub loss_sum: f64,
    /// Samples whose highest output matched their label.
    pub correct: usize,
    /// Evaluated samples.
    pub samples: usize,
}

impl EvaluationSummary {
    /// Adds the results of one batch.
    pub fn update(&mut self, loss_sum: f64, correct: usize, samples: usize) {
        self.loss_sum += loss_sum;
        self.correct += correct;
        self.samples += samples;
    }

    /// Loss per sample, zero when nothing was evaluated.
    pub fn average_loss(&self) -> f64 {
        match self.samples {
            0 => 0.0,
            samples => self.loss_sum / samples as f64,
        }
    }

    /// Top-1 accuracy in percent, zero when nothing was evaluated.
    pub fn accuracy(&self) -> f64 {
        match self.samples {
            0 => 0.0,
            samples => 100.0 * self.correct as f64 / samples as f64,
        }
    }
}

/// Results of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    /// One-based epoch number.
    pub epoch: usize,
    /// Learning rate used for the epoch.
    pub learning_rate: f64,
    /// Mean of the per-batch training losses, zero without batches.
    pub train_loss: f64,
    /// Held-out evaluation after the epoch.
    pub valid: EvaluationSummary,
}

/// A fitted model with its per-epoch history.
#[derive(Debug)]
pub struct TrainingOutcome<B: Backend> {
    /// The trained model, detached from autodiff.
    pub model: Model<B>,
    /// One summary per epoch.
    pub history: Vec<EpochSummary>,
}

/// Number of rows of `output` whose highest value sits at the row's label.
pub fn correct_predictions<B: Backend>(output: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    if batch_size == 0 {
        return 0;
    }

    let predictions = output.argmax(1).reshape([batch_size]);
    let correct = predictions.equal(labels).int().sum().into_scalar();

    correct.elem::<i64>() as usize
}

/// Runs the model forward on every batch of the loader.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    loader: &dyn DataLoader<DigitBatch<B>>,
) -> EvaluationSummary {
    let mut summary = EvaluationSummary::default();

    for batch in loader.iter() {
        let [samples] = batch.labels.dims();
        let output = model.forward(batch.images);
        let loss = MseLoss::new()
            .forward(output.clone(), batch.targets, Reduction::Sum)
            .into_scalar()
            .elem::<f64>();

        summary.update(loss, correct_predictions(output, batch.labels), samples);
    }

    summary
}

/// Fits a fresh model on `train`, evaluating it on `valid` after every epoch.
pub fn fit<B: AutodiffBackend>(
    config: &TrainingConfig,
    train: DigitDataset,
    valid: DigitDataset,
    device: &B::Device,
) -> Result<TrainingOutcome<B::InnerBackend>, TrainingError> {
    if config.batch_size == 0 || config.eval_batch_size == 0 {
        return Err(TrainingError::InvalidConfig(
            "batch sizes must be greater than 0".to_string(),
        ));
    }

    let mut scheduler = StepLrSchedulerConfig::new(config.learning_rate, config.lr_step_size)
        .with_gamma(config.lr_gamma)
        .init()
        .map_err(TrainingError::InvalidConfig)?;

    B::seed(config.seed);

    let mut model = config.model.init::<B>(device);
    let mut optim = config.optimizer.init::<B, Model<B>>();

    let num_items = train.len();
    let loader_train = DataLoaderBuilder::new(DigitBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .build(train);
    let loader_valid = DataLoaderBuilder::new(DigitBatcher::<B::InnerBackend>::new(device.clone()))
        .batch_size(config.eval_batch_size)
        .build(valid);

    let mut history = Vec::with_capacity(config.num_epochs);

    for epoch in 1..=config.num_epochs {
        let lr = scheduler.step();
        let mut seen = 0;
        let mut loss_total = 0.0;
        let mut iterations = 0;

        for (iteration, batch) in loader_train.iter().enumerate() {
            let [batch_size] = batch.labels.dims();
            let output = model.forward_classification(batch);
            let loss = output.loss.clone().into_scalar().elem::<f64>();

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);

            seen += batch_size;
            loss_total += loss;
            iterations += 1;

            if config.log_interval > 0 && iteration % config.log_interval == 0 {
                log::info!(
                    "[Train - Epoch {} - Iteration {}] [{}/{}] Loss {:.6}",
                    epoch,
                    iteration,
                    seen,
                    num_items,
                    loss
                );
            }
        }

        let summary = evaluate(&model.valid(), loader_valid.as_ref());
        log::info!(
            "[Valid - Epoch {}] Average loss {:.4} | Accuracy {}/{} ({:.2} %)",
            epoch,
            summary.average_loss(),
            summary.correct,
            summary.samples,
            summary.accuracy()
        );

        history.push(EpochSummary {
            epoch,
            learning_rate: lr,
            train_loss: match iterations {
                0 => 0.0,
                n => loss_total / n as f64,
            },
            valid: summary,
        });
    }

    Ok(TrainingOutcome {
        model: model.valid(),
        history,
    })
}

/// Loads the configured dataset, fits a model and saves the artifacts when asked to.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<TrainingOutcome<B::InnerBackend>, TrainingError> {
    let data_dir = Path::new(&config.data_dir);
    let dataset_train =
        DigitDataset::load(data_dir, config.dataset, Split::Train, config.data_format)?;
    let dataset_test =
        DigitDataset::load(data_dir, config.dataset, Split::Test, config.data_format)?;
    let sample = dataset_test.get(0);

    let outcome = fit::<B>(config, dataset_train, dataset_test, device)?;

    if config.save_model {
        let artifact_dir = Path::new(&config.artifact_dir);
        create_artifact_dir(artifact_dir)?;

        artifact::write_atomic(
            &artifact_dir.join(CONFIG_FILE),
            &serde_json::to_vec_pretty(config)?,
        )?;
        artifact::save_model(
            outcome.model.clone(),
            &artifact::model_path(artifact_dir, config.dataset, &config.model),
        )?;
        if let Some(sample) = sample {
            artifact::save_sample(&sample, artifact_dir, config.dataset)?;
        }
    }

    Ok(outcome)
}

/// Evaluates the saved model of the configured variant on its test split.
///
/// The network shape is read back from the `config.json` saved next to the model when there is
/// one, so a model trained with a non-default config is rebuilt correctly.
pub fn evaluate_saved<B: Backend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<EvaluationSummary, TrainingError> {
    if config.eval_batch_size == 0 {
        return Err(TrainingError::InvalidConfig(
            "batch sizes must be greater than 0".to_string(),
        ));
    }

    let artifact_dir = Path::new(&config.artifact_dir);
    let config_path = artifact_dir.join(CONFIG_FILE);

    let model_config = if config_path.is_file() {
        TrainingConfig::load(&config_path)
            .map_err(|err| TrainingError::InvalidConfig(format!("{err:?}")))?
            .model
    } else {
        config.model.clone()
    };

    let model = artifact::load_model::<B>(
        &artifact::model_path(artifact_dir, config.dataset, &model_config),
        &model_config,
        device,
    )?;

    let dataset = DigitDataset::load(
        Path::new(&config.data_dir),
        config.dataset,
        Split::Test,
        config.data_format,
    )?;
    if let Some(sample) = dataset.get(0) {
        create_artifact_dir(artifact_dir)?;
        artifact::save_sample(&sample, artifact_dir, config.dataset)?;
    }

    let loader = DataLoaderBuilder::new(DigitBatcher::<B>::new(device.clone()))
        .batch_size(config.eval_batch_size)
        .build(dataset);

    let summary = evaluate(&model, loader.as_ref());
    log::info!(
        "Predicted correct: {} / {} => {:.2} %",
        summary.correct,
        summary.samples,
        summary.accuracy()
    );

    Ok(summary)
}

/// Runs the mode selected by the configuration.
pub fn run<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<(), TrainingError> {
    log::info!("{:?} on {}", config.mode, config.dataset);

    match config.mode {
        Mode::Train => train::<B>(config, device).map(|_| ()),
        Mode::Evaluate => evaluate_saved::<B::InnerBackend>(config, device).map(|_| ()),
    }
}

fn create_artifact_dir(dir: &Path) -> Result<(), ArtifactError> {
    std::fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::DigitItem, TestAutodiffBackend, TestBackend};

    fn items(labels: &[u8]) -> Vec<DigitItem> {
        labels
            .iter()
            .map(|label| DigitItem::new(vec![*label * 25; 784], *label))
            .collect()
    }

    fn config() -> TrainingConfig {
        TrainingConfig::new(
            DatasetVariant::Mnist,
            Mode::Train,
            "data".to_string(),
            "artifacts".to_string(),
        )
        .with_num_epochs(2)
        .with_batch_size(2)
        .with_eval_batch_size(4)
    }

    #[test]
    fn should_count_all_correct_predictions() {
        let device = Default::default();
        let output = Tensor::<TestBackend, 2>::from_data(
            [[0.9, 0.1, 0.0], [0.2, 0.7, 0.1], [0.0, 0.3, 0.7]],
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_data([0, 1, 2], &device);

        let mut summary = EvaluationSummary::default();
        summary.update(0.0, correct_predictions(output, labels), 3);

        assert_eq!(summary.accuracy(), 100.0);
    }

    #[test]
    fn should_count_no_correct_predictions() {
        let device = Default::default();
        let output = Tensor::<TestBackend, 2>::from_data([[0.9, 0.1], [0.8, 0.2]], &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_data([1, 1], &device);

        let mut summary = EvaluationSummary::default();
        summary.update(0.0, correct_predictions(output, labels), 2);

        assert_eq!(summary.accuracy(), 0.0);
    }

    #[test]
    fn should_summarize_empty_evaluation_as_zero() {
        let summary = EvaluationSummary::default();

        assert_eq!(summary.average_loss(), 0.0);
        assert_eq!(summary.accuracy(), 0.0);
    }

    #[test]
    fn should_average_over_actual_sample_count() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let dataset = DigitDataset::new(items(&[0, 1, 2])).unwrap();
        let loader = DataLoaderBuilder::new(DigitBatcher::<TestBackend>::new(device))
            .batch_size(2)
            .build(dataset);

        let summary = evaluate(&model, loader.as_ref());

        assert_eq!(summary.samples, 3);
        assert!(summary.correct <= 3);
        // Squared error of a probability vector against a one-hot target is at most 2.
        assert!(summary.average_loss() > 0.0 && summary.average_loss() <= 2.0);
    }

    #[test]
    fn should_evaluate_empty_dataset() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let dataset = DigitDataset::new(Vec::new()).unwrap();
        let loader = DataLoaderBuilder::new(DigitBatcher::<TestBackend>::new(device))
            .batch_size(2)
            .build(dataset);

        assert_eq!(evaluate(&model, loader.as_ref()), EvaluationSummary::default());
    }

    #[test]
    fn should_fit_with_partial_batches() {
        let device = Default::default();
        let train = DigitDataset::new(items(&[0, 1, 2, 3, 4])).unwrap();
        let valid = DigitDataset::new(items(&[5, 6, 7])).unwrap();

        let outcome = fit::<TestAutodiffBackend>(&config(), train, valid, &device).unwrap();

        assert_eq!(outcome.history.len(), 2);
        for (index, summary) in outcome.history.iter().enumerate() {
            assert_eq!(summary.epoch, index + 1);
            assert_eq!(summary.valid.samples, 3);
            assert!(summary.train_loss > 0.0);
        }
    }

    #[test]
    fn should_decay_learning_rate_between_epochs() {
        let device = Default::default();
        let config = config()
            .with_num_epochs(3)
            .with_learning_rate(0.01)
            .with_lr_step_size(1)
            .with_lr_gamma(0.5);
        let train = DigitDataset::new(items(&[0, 1])).unwrap();
        let valid = DigitDataset::new(items(&[2])).unwrap();

        let outcome = fit::<TestAutodiffBackend>(&config, train, valid, &device).unwrap();

        let rates: Vec<_> = outcome.history.iter().map(|s| s.learning_rate).collect();
        assert_eq!(rates, vec![0.01, 0.005, 0.0025]);
    }

    #[test]
    fn should_reject_zero_batch_size() {
        let device = Default::default();
        let train = DigitDataset::new(items(&[0])).unwrap();
        let valid = DigitDataset::new(items(&[0])).unwrap();

        let result =
            fit::<TestAutodiffBackend>(&config().with_batch_size(0), train, valid, &device);

        assert!(matches!(result, Err(TrainingError::InvalidConfig(_))));
    }

    #[test]
    fn should_reject_zero_decay_step() {
        let device = Default::default();
        let train = DigitDataset::new(items(&[0])).unwrap();
        let valid = DigitDataset::new(items(&[0])).unwrap();

        let result =
            fit::<TestAutodiffBackend>(&config().with_lr_step_size(0), train, valid, &device);

        assert!(matches!(result, Err(TrainingError::InvalidConfig(_))));
    }

    #[test]
    fn should_validate_evaluation_before_writing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("artifacts");
        let config = TrainingConfig::new(
            DatasetVariant::Mnist,
            Mode::Evaluate,
            dir.path().to_string_lossy().into_owned(),
            artifact_dir.to_string_lossy().into_owned(),
        )
        .with_eval_batch_size(0);

        let result = evaluate_saved::<TestBackend>(&config, &Default::default());

        assert!(matches!(result, Err(TrainingError::InvalidConfig(_))));
        assert!(!artifact_dir.exists());
    }

    #[test]
    fn should_train_on_empty_dataset_without_batches() {
        let device = Default::default();
        let train = DigitDataset::new(Vec::new()).unwrap();
        let valid = DigitDataset::new(Vec::new()).unwrap();

        let outcome = fit::<TestAutodiffBackend>(&config(), train, valid, &device).unwrap();

        assert_eq!(outcome.history[0].train_loss, 0.0);
        assert_eq!(outcome.history[0].valid, EvaluationSummary::default());
    }
}
