//! Named parameters in declaration order.
//!
//! A [ParameterStore] is the bridge between a burn module and the exported document: weights are
//! kept output-major, `[d_output, d_input]`, whatever the module layout.

use burn::tensor::TensorData;

/// Errors raised when a parameter store does not match the declared network.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParameterError {
    /// A parameter required by the architecture is absent.
    #[error("missing parameter '{0}'")]
    Missing(String),

    /// The store holds a parameter the architecture does not declare.
    #[error("unexpected parameter '{0}'")]
    Unexpected(String),

    /// All parameters are present but not in declaration order.
    #[error("parameter '{found}' found at position {position}, expected '{expected}'")]
    OutOfOrder {
        /// Zero-based position in the store.
        position: usize,
        /// Name declared at that position.
        expected: String,
        /// Name found at that position.
        found: String,
    },

    /// A parameter has a different shape than declared.
    #[error("parameter '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Declared shape.
        expected: Vec<usize>,
        /// Shape found in the store.
        actual: Vec<usize>,
    },
}

/// Ordered mapping from parameter name to its values.
///
/// Iteration follows insertion order, which for stores extracted from a
/// [model](crate::model::Model) is layer declaration order: weight then bias, first layer first.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    entries: Vec<(String, TensorData)>,
}

impl ParameterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a parameter at the end of the store.
    ///
    /// If the name is already present its value is replaced in place, keeping its position, and
    /// the previous value is returned.
    pub fn insert(&mut self, name: impl Into<String>, data: TensorData) -> Option<TensorData> {
        let name = name.into();

        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, value)) => Some(core::mem::replace(value, data)),
            None => {
                self.entries.push((name, data));
                None
            }
        }
    }

    /// Returns the values of a parameter.
    pub fn get(&self, name: &str) -> Option<&TensorData> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, data)| data)
    }

    /// Parameter names in store order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Iterates over `(name, values)` pairs in store order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.entries.iter().map(|(name, data)| (name.as_str(), data))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no parameter.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that names, order and shapes match the given architecture exactly.
    pub fn verify(&self, architecture: &Architecture) -> Result<(), ParameterError> {
        let expected = architecture.parameters();

        for (position, (name, expected_shape)) in expected.iter().enumerate() {
            let Some((found, data)) = self.entries.get(position) else {
                return Err(ParameterError::Missing(name.clone()));
            };

            if found != name {
                if self.get(name).is_none() {
                    return Err(ParameterError::Missing(name.clone()));
                }
                if !expected.iter().any(|(declared, _)| declared == found) {
                    return Err(ParameterError::Unexpected(found.clone()));
                }
                return Err(ParameterError::OutOfOrder {
                    position,
                    expected: name.clone(),
                    found: found.clone(),
                });
            }

            if &data.shape != expected_shape {
                return Err(ParameterError::ShapeMismatch {
                    name: name.clone(),
                    expected: expected_shape.clone(),
                    actual: data.shape.clone(),
                });
            }
        }

        match self.entries.get(expected.len()) {
            Some((extra, _)) => Err(ParameterError::Unexpected(extra.clone())),
            None => Ok(()),
        }
    }
}

/// Shape of one fully-connected layer.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct LayerShape {
    /// Layer name, the prefix of its parameter names.
    pub name: String,
    /// Input width.
    pub d_input: usize,
    /// Output width.
    pub d_output: usize,
}

/// The ordered list of fully-connected layers a parameter store must describe.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    layers: Vec<LayerShape>,
}

impl Architecture {
    /// Declared parameters in store order with their shapes: `<layer>.weight` as
    /// `[d_output, d_input]` followed by `<layer>.bias` as `[d_output]`.
    pub fn parameters(&self) -> Vec<(String, Vec<usize>)> {
        self.layers
            .iter()
            .flat_map(|layer| {
                [
                    (
                        format!("{}.weight", layer.name),
                        vec![layer.d_output, layer.d_input],
                    ),
                    (format!("{}.bias", layer.name), vec![layer.d_output]),
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn architecture() -> Architecture {
        Architecture::new(vec![
            LayerShape::new("layer1".to_string(), 4, 3),
            LayerShape::new("layer2".to_string(), 3, 2),
        ])
    }

    fn zeros(shape: &[usize]) -> TensorData {
        TensorData::new(vec![0.0f32; shape.iter().product()], shape.to_vec())
    }

    fn valid_store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert("layer1.weight", zeros(&[3, 4]));
        store.insert("layer1.bias", zeros(&[3]));
        store.insert("layer2.weight", zeros(&[2, 3]));
        store.insert("layer2.bias", zeros(&[2]));
        store
    }

    #[test]
    fn should_list_parameters_output_major() {
        let parameters = architecture().parameters();

        assert_eq!(
            parameters,
            vec![
                ("layer1.weight".to_string(), vec![3, 4]),
                ("layer1.bias".to_string(), vec![3]),
                ("layer2.weight".to_string(), vec![2, 3]),
                ("layer2.bias".to_string(), vec![2]),
            ]
        );
    }

    #[test]
    fn should_keep_insertion_order_on_replace() {
        let mut store = valid_store();

        let previous = store.insert("layer1.bias", zeros(&[3]));

        assert!(previous.is_some());
        assert_eq!(
            store.names().collect::<Vec<_>>(),
            vec!["layer1.weight", "layer1.bias", "layer2.weight", "layer2.bias"]
        );
    }

    #[test]
    fn should_accept_matching_store() {
        assert_eq!(valid_store().verify(&architecture()), Ok(()));
    }

    #[test]
    fn should_reject_transposed_weight() {
        let mut store = valid_store();
        store.insert("layer1.weight", zeros(&[4, 3]));

        assert_eq!(
            store.verify(&architecture()),
            Err(ParameterError::ShapeMismatch {
                name: "layer1.weight".to_string(),
                expected: vec![3, 4],
                actual: vec![4, 3],
            })
        );
    }

    #[test]
    fn should_reject_missing_parameter() {
        let mut store = ParameterStore::new();
        store.insert("layer1.weight", zeros(&[3, 4]));
        store.insert("layer1.bias", zeros(&[3]));
        store.insert("layer2.weight", zeros(&[2, 3]));

        assert_eq!(
            store.verify(&architecture()),
            Err(ParameterError::Missing("layer2.bias".to_string()))
        );
    }

    #[test]
    fn should_reject_extra_parameter() {
        let mut store = valid_store();
        store.insert("layer3.weight", zeros(&[1, 2]));

        assert_eq!(
            store.verify(&architecture()),
            Err(ParameterError::Unexpected("layer3.weight".to_string()))
        );
    }

    #[test]
    fn should_reject_reordered_parameters() {
        let mut store = ParameterStore::new();
        store.insert("layer1.bias", zeros(&[3]));
        store.insert("layer1.weight", zeros(&[3, 4]));
        store.insert("layer2.weight", zeros(&[2, 3]));
        store.insert("layer2.bias", zeros(&[2]));

        assert_eq!(
            store.verify(&architecture()),
            Err(ParameterError::OutOfOrder {
                position: 0,
                expected: "layer1.weight".to_string(),
                found: "layer1.bias".to_string(),
            })
        );
    }
}
