//! Global model representation: an ordered list of numeric tensors.

use ndarray::{ArrayD, IxDyn};
use std::{fs, io, path::Path};
use thiserror::Error;

/// A single weight tensor of arbitrary dimension.
pub type Tensor = ArrayD<f64>;

/// The model weights, as an ordered list of tensors.
pub type Model = Vec<Tensor>;

/// The shape of every tensor of a model, in order.
pub type ModelShape = Vec<Vec<usize>>;

#[derive(Debug, Error)]
/// An error related to loading a model.
pub enum ModelError {
    #[error("failed to read the model file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse the model: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model shape {found:?} does not match the expected shape {expected:?}")]
    ShapeMismatch { expected: ModelShape, found: ModelShape },
}

/// Create a model of the given shape, with every weight set to zero.
pub fn zeros(shape: &[Vec<usize>]) -> Model {
    shape
        .iter()
        .map(|dim| Tensor::zeros(IxDyn(dim)))
        .collect()
}

/// Return the shape of the given model.
pub fn shape_of(model: &[Tensor]) -> ModelShape {
    model.iter().map(|tensor| tensor.shape().to_vec()).collect()
}

/// Check whether two models have the same number of tensors and whether these tensors have
/// pairwise identical shapes.
pub fn same_shape(a: &[Tensor], b: &[Tensor]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(t_a, t_b)| t_a.shape() == t_b.shape())
}

/// Load a model serialized as JSON and check that it has the expected shape.
pub fn load_json(path: impl AsRef<Path>, expected: &[Vec<usize>]) -> Result<Model, ModelError> {
    let bytes = fs::read(path)?;
    let model: Model = serde_json::from_slice(&bytes)?;
    let found = shape_of(&model);
    if found != expected {
        return Err(ModelError::ShapeMismatch {
            expected: expected.to_vec(),
            found,
        });
    }
    Ok(model)
}
