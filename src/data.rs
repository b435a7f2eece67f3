//! MNIST-style datasets read from IDX or CSV files, and their batching.

use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use serde::{Deserialize, Serialize};

use crate::{
    model::{INPUT_SIZE, NUM_CLASSES},
    variant::DatasetVariant,
};

const WIDTH: usize = 28;
const HEIGHT: usize = 28;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Errors raised while reading a dataset from disk.
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    /// The file could not be read.
    #[error("failed to read '{path}': {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file content does not follow the expected layout.
    #[error("malformed dataset file '{path}': {reason}")]
    Malformed {
        /// File path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The CSV file could not be parsed.
    #[error("failed to parse '{path}': {source}")]
    Csv {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: csv::Error,
    },

    /// Image and label files describe a different number of samples.
    #[error("{images} images but {labels} labels")]
    CountMismatch {
        /// Number of images.
        images: usize,
        /// Number of labels.
        labels: usize,
    },

    /// An image does not hold `28 * 28` pixels.
    #[error("image of sample {index} has {pixels} pixels, expected 784")]
    InvalidImage {
        /// Sample index.
        index: usize,
        /// Number of pixels found.
        pixels: usize,
    },

    /// A label lies outside `0..NUM_CLASSES`.
    #[error("label {label} of sample {index} is not a valid class")]
    InvalidLabel {
        /// Sample index.
        index: usize,
        /// Offending label.
        label: u8,
    },
}

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Training samples.
    Train,
    /// Held-out evaluation samples.
    Test,
}

/// On-disk layout of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// `<data_dir>/<variant>/{train,t10k}-{images-idx3,labels-idx1}-ubyte`.
    #[default]
    Idx,
    /// `<data_dir>/<variant>_{train,test}.csv`, one `label,pixel0,...,pixel783` row per sample
    /// after a header row.
    Csv,
}

/// A single grey-scale image with its class.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct DigitItem {
    /// Row-major pixel intensities, `28 * 28` bytes.
    pub pixels: Vec<u8>,
    /// Class in `0..10`.
    pub label: u8,
}

/// In-memory dataset of [digit items](DigitItem).
pub struct DigitDataset {
    dataset: InMemDataset<DigitItem>,
}

impl Dataset<DigitItem> for DigitDataset {
    fn get(&self, index: usize) -> Option<DigitItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl DigitDataset {
    /// Creates a dataset from items, rejecting labels outside `0..10` and images that are not
    /// `28 * 28` pixels.
    pub fn new(items: Vec<DigitItem>) -> Result<Self, DataError> {
        for (index, item) in items.iter().enumerate() {
            if item.label as usize >= NUM_CLASSES {
                return Err(DataError::InvalidLabel {
                    index,
                    label: item.label,
                });
            }
            if item.pixels.len() != INPUT_SIZE {
                return Err(DataError::InvalidImage {
                    index,
                    pixels: item.pixels.len(),
                });
            }
        }

        Ok(Self {
            dataset: InMemDataset::new(items),
        })
    }

    /// Loads a split of a dataset variant stored below `root`.
    pub fn load(
        root: &Path,
        variant: DatasetVariant,
        split: Split,
        format: DataFormat,
    ) -> Result<Self, DataError> {
        let dataset = match format {
            DataFormat::Idx => {
                let dir = variant.data_dir(root);
                let (images, labels) = match split {
                    Split::Train => (TRAIN_IMAGES, TRAIN_LABELS),
                    Split::Test => (TEST_IMAGES, TEST_LABELS),
                };
                Self::from_idx(&dir.join(images), &dir.join(labels))?
            }
            DataFormat::Csv => {
                let split = match split {
                    Split::Train => "train",
                    Split::Test => "test",
                };
                Self::from_csv(&root.join(format!("{}_{split}.csv", variant.name())))?
            }
        };

        log::info!("Loaded {} {:?} samples of {variant}", dataset.len(), split);

        Ok(dataset)
    }

    /// Reads an IDX image file and its IDX label file.
    pub fn from_idx(images_path: &Path, labels_path: &Path) -> Result<Self, DataError> {
        let images = read_file(images_path)?;
        let labels = read_file(labels_path)?;

        let images = parse_idx_images(&images).map_err(|reason| DataError::Malformed {
            path: images_path.to_path_buf(),
            reason,
        })?;
        let labels = parse_idx_labels(&labels).map_err(|reason| DataError::Malformed {
            path: labels_path.to_path_buf(),
            reason,
        })?;

        if images.len() != labels.len() {
            return Err(DataError::CountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }

        let items = images
            .into_iter()
            .zip(labels)
            .map(|(pixels, label)| DigitItem::new(pixels, label))
            .collect();

        Self::new(items)
    }

    /// Reads a CSV file with a header row followed by `label,pixel0,...,pixel783` rows.
    pub fn from_csv(path: &Path) -> Result<Self, DataError> {
        let csv_error = |source| DataError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let malformed = |reason: String| DataError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(csv_error)?;

        let header = reader.headers().map_err(csv_error)?;
        let labelled = header
            .get(0)
            .is_some_and(|field| field.trim().parse::<u8>().is_err());
        if header.len() != INPUT_SIZE + 1 || !labelled {
            return Err(malformed(format!(
                "expected a `label,pixel0,...,pixel{}` header row",
                INPUT_SIZE - 1
            )));
        }

        let mut items = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            if record.len() != INPUT_SIZE + 1 {
                return Err(malformed(format!(
                    "row {index} has {} columns, expected {}",
                    record.len(),
                    INPUT_SIZE + 1
                )));
            }

            let mut values = record.iter().map(|field| field.trim().parse::<u8>());
            let label = match values.next() {
                Some(Ok(label)) => label,
                _ => return Err(malformed(format!("row {index} has an invalid label"))),
            };
            let pixels = values
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|err| malformed(format!("row {index}: {err}")))?;

            items.push(DigitItem::new(pixels, label));
        }

        Self::new(items)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, DataError> {
    std::fs::read(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, String> {
    bytes
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| format!("truncated header at byte {offset}"))
}

/// Parses an IDX3 `u8` image file into `28 * 28` byte images.
pub fn parse_idx_images(bytes: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let magic = read_u32(bytes, 0)?;
    if magic != IMAGES_MAGIC {
        return Err(format!("unexpected magic number {magic:#010x}"));
    }

    let size = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    if (rows, cols) != (HEIGHT, WIDTH) {
        return Err(format!("images are {rows}x{cols}, expected {HEIGHT}x{WIDTH}"));
    }

    let data = &bytes[16..];
    if data.len() != size * INPUT_SIZE {
        return Err(format!(
            "header declares {size} images but {} bytes of pixels follow",
            data.len()
        ));
    }

    Ok(data.chunks(INPUT_SIZE).map(|chunk| chunk.to_vec()).collect())
}

/// Parses an IDX1 `u8` label file.
pub fn parse_idx_labels(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let magic = read_u32(bytes, 0)?;
    if magic != LABELS_MAGIC {
        return Err(format!("unexpected magic number {magic:#010x}"));
    }

    let size = read_u32(bytes, 4)? as usize;
    let data = &bytes[8..];
    if data.len() != size {
        return Err(format!(
            "header declares {size} labels but {} follow",
            data.len()
        ));
    }

    Ok(data.to_vec())
}

/// Encodes a class as a unit vector with a single `1.0` at the class index.
///
/// # Panics
///
/// Panics if `label >= NUM_CLASSES`.
pub fn one_hot(label: usize) -> [f32; NUM_CLASSES] {
    let mut encoded = [0.0; NUM_CLASSES];
    encoded[label] = 1.0;
    encoded
}

/// Index of the largest value, the first one on ties. `None` for an empty slice.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (index, &value)| match best {
            Some((_, max)) if max >= value => best,
            _ => Some((index, value)),
        })
        .map(|(index, _)| index)
}

/// Turns digit items into tensors on a device.
#[derive(new, Clone, Debug)]
pub struct DigitBatcher<B: Backend> {
    device: B::Device,
}

/// A batch of images with their one-hot targets and integer labels.
#[derive(Clone, Debug)]
pub struct DigitBatch<B: Backend> {
    /// Pixel intensities scaled to `[0, 1]`, `[batch_size, 784]`.
    pub images: Tensor<B, 2>,
    /// One-hot targets, `[batch_size, 10]`.
    pub targets: Tensor<B, 2>,
    /// Integer labels, `[batch_size]`.
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<DigitItem, DigitBatch<B>> for DigitBatcher<B> {
    fn batch(&self, items: Vec<DigitItem>) -> DigitBatch<B> {
        let batch_size = items.len();

        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|item| item.pixels.iter().map(|pixel| *pixel as f32 / 255.0))
            .collect();
        let targets: Vec<f32> = items
            .iter()
            .flat_map(|item| one_hot(item.label as usize))
            .collect();
        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();

        let images = Tensor::from_data(
            TensorData::new(pixels, [batch_size, INPUT_SIZE]),
            &self.device,
        );
        let targets = Tensor::from_data(
            TensorData::new(targets, [batch_size, NUM_CLASSES]),
            &self.device,
        );
        let labels = Tensor::from_data(TensorData::new(labels, [batch_size]), &self.device);

        DigitBatch {
            images,
            targets,
            labels,
        }
    }
}
