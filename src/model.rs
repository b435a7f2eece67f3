//! The `784 -> 128 -> 10` network and its parameter layout.

use burn::{
    module::Param,
    nn::{
        loss::{MseLoss, Reduction},
        Linear, LinearConfig, Relu,
    },
    prelude::*,
    tensor::activation::softmax,
};

use crate::{
    data::DigitBatch,
    store::{Architecture, LayerShape, ParameterError, ParameterStore},
};

/// Width of a flattened 28x28 image.
pub const INPUT_SIZE: usize = 28 * 28;

/// Number of classes of both dataset variants.
pub const NUM_CLASSES: usize = 10;

/// Configuration of the two-layer classifier.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Input width.
    #[config(default = 784)]
    pub d_input: usize,
    /// Hidden layer width.
    #[config(default = 128)]
    pub d_hidden: usize,
    /// Number of output classes.
    #[config(default = 10)]
    pub num_classes: usize,
}

/// Fully-connected classifier: `softmax(W2 · relu(W1 · x + b1) + b2)`.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    layer1: Linear<B>,
    activation: Relu,
    layer2: Linear<B>,
}

/// Output of a forward pass against labelled targets.
#[derive(Debug)]
pub struct ClassificationOutput<B: Backend> {
    /// Mean squared error between `output` and the one-hot targets.
    pub loss: Tensor<B, 1>,
    /// Softmax output, `[batch_size, num_classes]`.
    pub output: Tensor<B, 2>,
    /// Integer labels, `[batch_size]`.
    pub labels: Tensor<B, 1, Int>,
}

impl ModelConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        Model {
            layer1: LinearConfig::new(self.d_input, self.d_hidden).init(device),
            activation: Relu::new(),
            layer2: LinearConfig::new(self.d_hidden, self.num_classes).init(device),
        }
    }

    /// The layers a parameter store of this model must describe.
    pub fn architecture(&self) -> Architecture {
        Architecture::new(vec![
            LayerShape::new("layer1".to_string(), self.d_input, self.d_hidden),
            LayerShape::new("layer2".to_string(), self.d_hidden, self.num_classes),
        ])
    }

    /// Architecture tag used in artifact names, e.g. `fc128_relu_fc10_softmax`.
    pub fn name(&self) -> String {
        format!("fc{}_relu_fc{}_softmax", self.d_hidden, self.num_classes)
    }

    /// Rebuilds a model from a parameter store using output-major weights.
    pub fn init_with<B: Backend>(
        &self,
        store: &ParameterStore,
        device: &B::Device,
    ) -> Result<Model<B>, ParameterError> {
        store.verify(&self.architecture())?;

        let model = self.init::<B>(device);

        Ok(Model {
            layer1: load_linear(model.layer1, store, "layer1", device)?,
            activation: model.activation,
            layer2: load_linear(model.layer2, store, "layer2", device)?,
        })
    }
}

impl<B: Backend> Model<B> {
    /// Rebuilds a model from a record of any layer widths.
    ///
    /// Unlike [load_record](Module::load_record) this does not need a model of matching shape
    /// first; check the result with [ParameterStore::verify] before trusting it.
    pub fn from_record(record: ModelRecord<B>) -> Self {
        Self {
            layer1: Linear {
                weight: record.layer1.weight,
                bias: record.layer1.bias,
            },
            activation: Relu::new(),
            layer2: Linear {
                weight: record.layer2.weight,
                bias: record.layer2.bias,
            },
        }
    }

    /// Raw class scores for a `[batch_size, d_input]` input.
    pub fn forward_logits(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.layer1.forward(images);
        let x = self.activation.forward(x);
        self.layer2.forward(x)
    }

    /// Class probabilities for a `[batch_size, d_input]` input. Each row sums to one.
    pub fn forward(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.forward_logits(images), 1)
    }

    /// Class probabilities for images of any rank; every dimension after the first is
    /// flattened, so `[batch_size, 28, 28]` is accepted as well as `[batch_size, 784]`.
    pub fn forward_images<const D: usize>(&self, images: Tensor<B, D>) -> Tensor<B, 2> {
        self.forward(images.flatten(1, D - 1))
    }

    /// Forward pass scored against the batch's one-hot targets.
    pub fn forward_classification(&self, batch: DigitBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.images);
        let loss = MseLoss::new().forward(output.clone(), batch.targets, Reduction::Mean);

        ClassificationOutput {
            loss,
            output,
            labels: batch.labels,
        }
    }

    /// Extracts the parameters in declaration order.
    ///
    /// burn stores linear weights as `[d_input, d_output]`; they are transposed here so the store
    /// holds the `[d_output, d_input]` layout consumers computing `W · x + b` expect.
    pub fn parameters(&self) -> ParameterStore {
        let mut store = ParameterStore::new();

        for (name, layer) in [("layer1", &self.layer1), ("layer2", &self.layer2)] {
            store.insert(
                format!("{name}.weight"),
                layer.weight.val().transpose().into_data(),
            );
            if let Some(bias) = &layer.bias {
                store.insert(format!("{name}.bias"), bias.val().into_data());
            }
        }

        store
    }
}

fn load_linear<B: Backend>(
    mut linear: Linear<B>,
    store: &ParameterStore,
    name: &str,
    device: &B::Device,
) -> Result<Linear<B>, ParameterError> {
    let weight_name = format!("{name}.weight");
    let bias_name = format!("{name}.bias");

    let weight = store
        .get(&weight_name)
        .ok_or(ParameterError::Missing(weight_name))?;
    let bias = store
        .get(&bias_name)
        .ok_or(ParameterError::Missing(bias_name))?;

    let weight =
        Tensor::<B, 2>::from_data(weight.clone().convert::<B::FloatElem>(), device).transpose();
    let bias = Tensor::<B, 1>::from_data(bias.clone().convert::<B::FloatElem>(), device);

    linear.weight = Param::from_tensor(weight);
    linear.bias = Some(Param::from_tensor(bias));

    Ok(linear)
}
