//! The exported parameter document.
//!
//! A document is a JSON object mapping every parameter name to a nested list whose nesting
//! mirrors the parameter's shape: a `[O, I]` weight becomes `O` lists of `I` numbers, a `[O]`
//! bias a flat list of `O` numbers. Keys appear in store order.
//!
//! ```json
//! {
//!     "layer1.weight": [[0.011, -0.027], [0.004, 0.019]],
//!     "layer1.bias": [0.0, -0.001]
//! }
//! ```

use core::fmt;

use burn::tensor::{DType, TensorData};
use serde::{
    de::{self, MapAccess, Visitor},
    ser::{SerializeMap, SerializeSeq},
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::ser::PrettyFormatter;

use crate::store::ParameterStore;

const INDENT: &[u8] = b"    ";

/// Errors raised while flattening a parameter into a document entry.
#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    /// The element type has no numeric JSON representation.
    #[error("parameter '{name}' has unsupported element type {dtype:?}")]
    UnsupportedElement {
        /// Parameter name.
        name: String,
        /// Element type found.
        dtype: DType,
    },

    /// NaN and infinities cannot be written as JSON numbers.
    #[error("parameter '{name}' holds a non-finite value at flat index {index}")]
    NonFinite {
        /// Parameter name.
        name: String,
        /// Row-major index of the first non-finite value.
        index: usize,
    },

    /// The values could not be read with the element type they declare.
    #[error("parameter '{name}' could not be read: {reason}")]
    Data {
        /// Parameter name.
        name: String,
        /// Underlying error.
        reason: String,
    },
}

/// Flat row-major values, kept in their source precision.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValues {
    /// Single precision floats.
    F32(Vec<f32>),
    /// Double precision floats.
    F64(Vec<f64>),
    /// Integers of any width.
    Int(Vec<i64>),
}

impl FlatValues {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::F64(values) => values.len(),
            Self::Int(values) => values.len(),
        }
    }

    /// Whether there is no value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An array as a shape plus its flat row-major values.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatArray {
    shape: Vec<usize>,
    values: FlatValues,
}

impl FlatArray {
    /// Flattens tensor data, widening half precision floats to `f32` and integers to `i64`.
    pub fn from_data(name: &str, data: &TensorData) -> Result<Self, TransformError> {
        let read_error = |err| TransformError::Data {
            name: name.to_string(),
            reason: format!("{err:?}"),
        };

        let values = match data.dtype {
            DType::F32 => FlatValues::F32(data.to_vec::<f32>().map_err(read_error)?),
            DType::F64 => FlatValues::F64(data.to_vec::<f64>().map_err(read_error)?),
            DType::F16 | DType::BF16 => {
                FlatValues::F32(data.clone().convert::<f32>().to_vec().map_err(read_error)?)
            }
            DType::I64 | DType::I32 | DType::I8 | DType::U8 => {
                FlatValues::Int(data.clone().convert::<i64>().to_vec().map_err(read_error)?)
            }
            dtype => {
                return Err(TransformError::UnsupportedElement {
                    name: name.to_string(),
                    dtype,
                })
            }
        };

        let first_non_finite = match &values {
            FlatValues::F32(values) => values.iter().position(|value| !value.is_finite()),
            FlatValues::F64(values) => values.iter().position(|value| !value.is_finite()),
            FlatValues::Int(_) => None,
        };
        if let Some(index) = first_non_finite {
            return Err(TransformError::NonFinite {
                name: name.to_string(),
                index,
            });
        }

        Ok(Self {
            shape: data.shape.clone(),
            values,
        })
    }

    /// The array shape, empty for a scalar.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The flat row-major values.
    pub fn values(&self) -> &FlatValues {
        &self.values
    }

    /// Converts back to tensor data of the same element precision.
    pub fn to_data(&self) -> TensorData {
        match &self.values {
            FlatValues::F32(values) => TensorData::new(values.clone(), self.shape.clone()),
            FlatValues::F64(values) => TensorData::new(values.clone(), self.shape.clone()),
            FlatValues::Int(values) => TensorData::new(values.clone(), self.shape.clone()),
        }
    }
}

/// Serializes `values` as nested sequences following `shape`.
///
/// The outermost dimension is split into `shape[0]` contiguous chunks of
/// `product(shape[1..])` values and each chunk recurses on the remaining shape. A rank 0 shape
/// serializes its single value as a bare number.
struct Nested<'a, E> {
    shape: &'a [usize],
    values: &'a [E],
}

impl<E: Serialize> Serialize for Nested<'_, E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some((&len, rest)) = self.shape.split_first() else {
            return match self.values.first() {
                Some(value) => value.serialize(serializer),
                None => Err(serde::ser::Error::custom("scalar without a value")),
            };
        };

        let stride: usize = rest.iter().product();
        let mut seq = serializer.serialize_seq(Some(len))?;
        for index in 0..len {
            let start = index * stride;
            seq.serialize_element(&Nested {
                shape: rest,
                values: &self.values[start..start + stride],
            })?;
        }
        seq.end()
    }
}

impl Serialize for FlatArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let shape = self.shape.as_slice();

        match &self.values {
            FlatValues::F32(values) => Nested {
                shape,
                values: values.as_slice(),
            }
            .serialize(serializer),
            FlatValues::F64(values) => Nested {
                shape,
                values: values.as_slice(),
            }
            .serialize(serializer),
            FlatValues::Int(values) => Nested {
                shape,
                values: values.as_slice(),
            }
            .serialize(serializer),
        }
    }
}

/// A nested list as read from JSON, before its shape is known.
#[derive(Deserialize)]
#[serde(untagged)]
enum NestedValue {
    Number(f64),
    List(Vec<NestedValue>),
}

impl NestedValue {
    fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::new();
        let mut node = self;

        while let NestedValue::List(items) = node {
            shape.push(items.len());
            match items.first() {
                Some(first) => node = first,
                None => break,
            }
        }

        shape
    }

    fn collect(&self, shape: &[usize], values: &mut Vec<f64>) -> Result<(), String> {
        match (self, shape.split_first()) {
            (NestedValue::Number(value), None) => {
                values.push(*value);
                Ok(())
            }
            (NestedValue::List(items), Some((&len, rest))) if items.len() == len => items
                .iter()
                .try_for_each(|item| item.collect(rest, values)),
            _ => Err(format!("ragged nested list, expected shape {shape:?}")),
        }
    }

    fn into_flat(self) -> Result<FlatArray, String> {
        let shape = self.shape();
        let mut values = Vec::with_capacity(shape.iter().product());
        self.collect(&shape, &mut values)?;

        Ok(FlatArray {
            shape,
            values: FlatValues::F64(values),
        })
    }
}

/// One named parameter of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEntry {
    /// Parameter name, e.g. `layer1.weight`.
    pub name: String,
    /// Parameter values.
    pub array: FlatArray,
}

/// Ordered parameter document.
///
/// Serializes to a JSON object in entry order; deserializing keeps the key order of the source
/// text and rejects ragged lists and duplicate keys. Numbers read back are `f64`, which
/// represents every `f32` written by [to_json_pretty](ParameterDocument::to_json_pretty) exactly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterDocument {
    entries: Vec<DocumentEntry>,
}

impl ParameterDocument {
    /// Flattens every parameter of the store, in store order.
    pub fn from_store(store: &ParameterStore) -> Result<Self, TransformError> {
        let entries = store
            .iter()
            .map(|(name, data)| {
                Ok(DocumentEntry {
                    name: name.to_string(),
                    array: FlatArray::from_data(name, data)?,
                })
            })
            .collect::<Result<Vec<_>, TransformError>>()?;

        Ok(Self { entries })
    }

    /// Rebuilds a parameter store, in document order.
    pub fn into_store(self) -> ParameterStore {
        let mut store = ParameterStore::new();
        for entry in self.entries {
            store.insert(entry.name, entry.array.to_data());
        }
        store
    }

    /// The entries in document order.
    pub fn entries(&self) -> &[DocumentEntry] {
        &self.entries
    }

    /// Returns an entry by name.
    pub fn get(&self, name: &str) -> Option<&DocumentEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Parameter names in document order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Renders the document as JSON indented with four spaces.
    pub fn to_json_pretty(&self) -> serde_json::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let formatter = PrettyFormatter::with_indent(INDENT);
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer)?;
        buffer.push(b'\n');

        Ok(buffer)
    }

    /// Parses a JSON document.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl Serialize for ParameterDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.name, &entry.array)?;
        }
        map.end()
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = ParameterDocument;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map from parameter name to nested numeric lists")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries: Vec<DocumentEntry> = Vec::with_capacity(map.size_hint().unwrap_or(0));

        while let Some((name, value)) = map.next_entry::<String, NestedValue>()? {
            if entries.iter().any(|entry| entry.name == name) {
                return Err(de::Error::custom(format!("duplicate parameter '{name}'")));
            }
            let array = value
                .into_flat()
                .map_err(|reason| de::Error::custom(format!("parameter '{name}': {reason}")))?;
            entries.push(DocumentEntry { name, array });
        }

        Ok(ParameterDocument { entries })
    }
}

impl<'de> Deserialize<'de> for ParameterDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(DocumentVisitor)
    }
}
