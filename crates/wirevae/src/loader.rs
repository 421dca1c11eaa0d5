//! Weight and configuration persistence.
//!
//! Weights live in SafeTensors files keyed by the dotted parameter names of
//! [`Parameterized::named_parameters`] (`encoder.cross_attn.layers.0.attn.to_q.weight`,
//! `quant_proj.bias`, ...). F32, F16 and BF16 tensors are accepted on load;
//! saving always writes F32. Configurations are JSON.

use std::collections::HashMap;
use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;
use tracing::info;

use wirevae_core::Parameterized;

use crate::config::WireframeVaeConfig;

/// Errors during weight or config persistence.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Shape mismatch for {key}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Unsupported dtype {dtype} for tensor {key}")]
    UnsupportedDType { key: String, dtype: String },
}

impl From<safetensors::SafeTensorError> for LoadError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        LoadError::SafeTensors(e.to_string())
    }
}

fn to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>, LoadError> {
    let bytes = view.data();
    let data = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(LoadError::UnsupportedDType {
                key: name.to_string(),
                dtype: format!("{other:?}"),
            })
        }
    };
    Ok(data)
}

/// Load SafeTensors file and return raw tensor data keyed by name.
///
/// Returns a map of tensor_name → (shape, f32 data).
pub fn load_safetensors(path: &Path) -> Result<HashMap<String, (Vec<usize>, Vec<f32>)>, LoadError> {
    let bytes = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)?;

    let mut result = HashMap::new();
    for (name, view) in tensors.tensors() {
        let data = to_f32(&name, &view)?;
        result.insert(name, (view.shape().to_vec(), data));
    }
    Ok(result)
}

/// Copy every parameter of `model` from the file at `path`.
///
/// All model keys must be present with matching shapes; extra keys in the file
/// are ignored, so a full checkpoint can populate either half-model.
pub fn load_state_dict<M: Parameterized + ?Sized>(model: &mut M, path: &Path) -> Result<(), LoadError> {
    let mut tensors = load_safetensors(path)?;
    let file_tensors = tensors.len();

    let mut loaded = 0usize;
    for (name, param) in model.named_parameters_mut() {
        let (shape, data) = tensors
            .remove(&name)
            .ok_or_else(|| LoadError::MissingKey(name.clone()))?;
        if shape != param.dims() {
            return Err(LoadError::ShapeMismatch {
                key: name,
                expected: param.dims().to_vec(),
                got: shape,
            });
        }
        param.data_mut().copy_from_slice(&data);
        loaded += 1;
    }

    info!(
        path = %path.display(),
        loaded,
        ignored = file_tensors - loaded,
        "loaded state dict"
    );
    Ok(())
}

/// Write every parameter of `model` to `path` as F32 SafeTensors.
pub fn save_state_dict<M: Parameterized + ?Sized>(model: &M, path: &Path) -> Result<(), LoadError> {
    let params = model.named_parameters();
    let mut views = Vec::with_capacity(params.len());
    for (name, tensor) in &params {
        let bytes: &[u8] = bytemuck::cast_slice(tensor.data());
        views.push((name.clone(), TensorView::new(Dtype::F32, tensor.dims().to_vec(), bytes)?));
    }
    safetensors::serialize_to_file(views, &None, path)?;
    info!(path = %path.display(), tensors = params.len(), "saved state dict");
    Ok(())
}

/// Read a JSON model configuration; missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<WireframeVaeConfig, LoadError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Write a model configuration as pretty JSON.
pub fn save_config(config: &WireframeVaeConfig, path: &Path) -> Result<(), LoadError> {
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}
