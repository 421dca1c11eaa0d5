//! # wirevae-core
//!
//! Minimal tensor containers and the parameter/module traits shared by the
//! wireframe autoencoder. CPU-only, no autograd: just what the encoder,
//! decoder and loss need to check shapes and move `f32` buffers around.

pub mod shape;
pub mod tensor;
pub mod error;
pub mod module;

pub use shape::{Dim, Shape};
pub use tensor::{IndexTensor, Tensor};
pub use error::CoreError;
pub use module::{prefixed, prefixed_mut, Module, Parameterized};

pub type Result<T> = std::result::Result<T, CoreError>;
