//! Command line interface of the `digit-mlp` binary.

use std::{error::Error, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{
    data::DataFormat,
    export::{export, ExportConfig},
    inference::{evaluate_document, predict},
    model::ModelConfig,
    training::{self, Mode, TrainingConfig},
    variant::DatasetVariant,
    CpuAutodiffBackend, CpuBackend,
};

/// Train a digit classifier and export its parameters as nested JSON arrays.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity, repeat for more
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write the logs to this file
    #[clap(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Command to run
    #[clap(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a fresh model and evaluate it after every epoch
    Train(TrainArgs),
    /// Evaluate a saved model on the test split
    Evaluate(DatasetArgs),
    /// Export a saved parameter file as a JSON document
    Export(ExportArgs),
    /// Classify a 28x28 image with an exported document
    Predict(PredictArgs),
    /// Evaluate an exported document on the test split
    EvaluateDocument(EvaluateDocumentArgs),
}

/// Dataset and artifact locations shared by training and evaluation.
#[derive(Args, Debug, Clone)]
pub struct DatasetArgs {
    /// Dataset variant
    #[clap(short = 'd', long = "dataset", value_enum, default_value = "mnist")]
    pub dataset: DatasetVariant,

    /// Directory holding the dataset files
    #[clap(long = "data-dir", default_value = "data")]
    pub data_dir: String,

    /// Directory the model, its config and the sample image are written to
    #[clap(long = "artifact-dir", default_value = ".")]
    pub artifact_dir: String,

    /// On-disk layout of the dataset
    #[clap(long = "format", value_enum, default_value = "idx")]
    pub format: DataFormat,
}

/// Arguments of the `train` command.
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Dataset and artifact locations
    #[clap(flatten)]
    pub dataset: DatasetArgs,

    /// Learning rate of the first epoch
    #[clap(long = "learning-rate", default_value_t = 1.0e-3)]
    pub learning_rate: f64,

    /// Number of epochs
    #[clap(short = 'e', long = "epochs", default_value_t = 10)]
    pub epochs: usize,

    /// Training batch size
    #[clap(short = 'b', long = "batch-size", default_value_t = 32)]
    pub batch_size: usize,

    /// Save the parameters, the config and a sample image once done
    #[clap(short = 's', long = "save-model")]
    pub save_model: bool,

    /// Seed of the initialization and of the shuffling
    #[clap(long = "seed", default_value_t = 42)]
    pub seed: u64,
}

/// Arguments of the `export` command.
#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Parameter file written by `train --save-model`
    pub source: String,

    /// Document to write, defaults to `<source without extension>_weights_biases.json`
    #[clap(short = 'o', long = "output")]
    pub output: Option<String>,
}

/// Arguments of the `predict` command.
#[derive(Args, Debug, Clone)]
pub struct PredictArgs {
    /// Document written by `export`
    pub document: PathBuf,

    /// 28x28 image to classify
    pub image: PathBuf,
}

/// Arguments of the `evaluate-document` command.
#[derive(Args, Debug, Clone)]
pub struct EvaluateDocumentArgs {
    /// Document written by `export`
    pub document: PathBuf,

    /// Dataset to evaluate on
    #[clap(flatten)]
    pub dataset: DatasetArgs,
}

impl DatasetArgs {
    fn config(&self, mode: Mode) -> TrainingConfig {
        TrainingConfig::new(
            self.dataset,
            mode,
            self.data_dir.clone(),
            self.artifact_dir.clone(),
        )
        .with_data_format(self.format)
    }
}

impl TrainArgs {
    /// The training configuration these arguments describe.
    pub fn config(&self) -> TrainingConfig {
        self.dataset
            .config(Mode::Train)
            .with_learning_rate(self.learning_rate)
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_save_model(self.save_model)
            .with_seed(self.seed)
    }
}

/// Executes a parsed command line.
pub fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let device = Default::default();

    match cli.command {
        Commands::Train(args) => {
            training::run::<CpuAutodiffBackend>(&args.config(), &device)?;
        }
        Commands::Evaluate(args) => {
            training::run::<CpuAutodiffBackend>(&args.config(Mode::Evaluate), &device)?;
        }
        Commands::Export(args) => {
            let report = export(&ExportConfig::new(args.source).with_destination(args.output))?;
            println!("{}", report.destination.display());
        }
        Commands::Predict(args) => {
            let prediction =
                predict::<CpuBackend>(&args.document, &args.image, &ModelConfig::new(), &device)?;
            println!("{}", prediction.label);
        }
        Commands::EvaluateDocument(args) => {
            let config = args.dataset.config(Mode::Evaluate);
            let summary = evaluate_document::<CpuBackend>(&args.document, &config, &device)?;
            println!("{:.2}", summary.accuracy());
        }
    }

    Ok(())
}
