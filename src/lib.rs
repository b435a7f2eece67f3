#![warn(missing_docs)]

//! Trains a 784 → 128 → 10 digit classifier with burn and exports its learned parameters as an
//! ordered JSON document of nested arrays.
//!
//! The pipeline has two independent halves:
//!
//! - [training] fits the [model](model::Model) on an MNIST-style dataset and persists the
//!   parameters as a burn record;
//! - [export] reloads such a record on the CPU and writes every parameter, in declaration order,
//!   as a nested list matching its shape (weights are output-major `[O, I]`).
//!
//! [inference] closes the loop by rebuilding the network from an exported document.

#[macro_use]
extern crate derive_new;

pub mod artifact;
pub mod cli;
pub mod data;
pub mod document;
pub mod export;
pub mod inference;
pub mod logging;
pub mod model;
pub mod store;
pub mod training;
pub mod variant;

/// The backend every command runs on: burn's CPU `ndarray` backend.
pub type CpuBackend = burn::backend::NdArray<f32>;

/// [CpuBackend] with automatic differentiation, used for training.
pub type CpuAutodiffBackend = burn::backend::Autodiff<CpuBackend>;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
