use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Shape contract violated for `{name}`: expected {expected}, got {got:?}")]
    ShapeContract {
        name: String,
        expected: String,
        got: Vec<usize>,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid axis {axis} for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("Cannot reshape tensor of {numel} elements into shape {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<usize> },

    #[error("Index {index} out of bounds for axis {axis} with size {size}")]
    IndexOutOfBounds {
        index: usize,
        axis: usize,
        size: usize,
    },
}
