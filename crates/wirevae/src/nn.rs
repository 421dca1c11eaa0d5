//! Dense building blocks shared by the encoder, decoder and heads.
//!
//! All layers operate on flat row-major `f32` buffers of shape `(n, dim)`;
//! the [`Module`] impls wrap the flat kernels for tensor inputs.

use rand::Rng;

use wirevae_core::{prefixed, prefixed_mut, CoreError, Module, Parameterized, Tensor};

/// GELU activation (approximate).
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.7978845608 * (x + 0.044715 * x * x * x)).tanh())
}

fn rows_of(input: &Tensor, width: usize) -> Result<usize, CoreError> {
    let last = input.dims().last().copied().unwrap_or(0);
    if input.ndim() == 0 || last != width {
        return Err(CoreError::ShapeMismatch {
            expected: vec![width],
            got: input.dims().to_vec(),
        });
    }
    Ok(input.numel() / width.max(1))
}

fn with_last_dim(input: &Tensor, width: usize) -> Vec<usize> {
    let mut dims = input.dims().to_vec();
    if let Some(last) = dims.last_mut() {
        *last = width;
    }
    dims
}

/// Linear projection layer (weight + bias).
pub struct Linear {
    /// Weight: (out_dim, in_dim)
    pub weight: Tensor,
    pub bias: Tensor,
    pub in_dim: usize,
    pub out_dim: usize,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        let std = (2.0 / (in_dim + out_dim).max(1) as f32).sqrt();
        Self {
            weight: Tensor::rand_uniform(&[out_dim, in_dim], -std, std),
            bias: Tensor::zeros(&[out_dim]),
            in_dim,
            out_dim,
        }
    }

    /// Forward: (n, in_dim) → (n, out_dim)
    pub fn forward_flat(&self, x: &[f32], n: usize) -> Vec<f32> {
        let w = self.weight.data();
        let bias = self.bias.data();
        let mut out = vec![0.0f32; n * self.out_dim];
        for i in 0..n {
            let row = &x[i * self.in_dim..(i + 1) * self.in_dim];
            for o in 0..self.out_dim {
                let w_row = &w[o * self.in_dim..(o + 1) * self.in_dim];
                let mut acc = bias[o];
                for k in 0..self.in_dim {
                    acc += row[k] * w_row[k];
                }
                out[i * self.out_dim + o] = acc;
            }
        }
        out
    }
}

impl Parameterized for Linear {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".into(), &self.weight), ("bias".into(), &self.bias)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("weight".into(), &mut self.weight), ("bias".into(), &mut self.bias)]
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> wirevae_core::Result<Tensor> {
        let n = rows_of(input, self.in_dim)?;
        let out = self.forward_flat(input.data(), n);
        Tensor::from_vec(out, &with_last_dim(input, self.out_dim))
    }
}

/// LayerNorm over the last axis.
pub struct LayerNorm {
    pub weight: Tensor,
    pub bias: Tensor,
    pub d: usize,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(d: usize) -> Self {
        Self {
            weight: Tensor::ones(&[d]),
            bias: Tensor::zeros(&[d]),
            d,
            eps: 1e-5,
        }
    }

    /// Normalize input of shape (n_rows, d).
    pub fn forward_flat(&self, x: &[f32], n_rows: usize) -> Vec<f32> {
        let d = self.d;
        let w = self.weight.data();
        let b = self.bias.data();
        let mut out = vec![0.0f32; n_rows * d];
        for row in 0..n_rows {
            let start = row * d;
            let slice = &x[start..start + d];
            let mean: f32 = slice.iter().sum::<f32>() / d as f32;
            let var: f32 = slice.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / d as f32;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for j in 0..d {
                out[start + j] = (slice[j] - mean) * inv_std * w[j] + b[j];
            }
        }
        out
    }
}

impl Parameterized for LayerNorm {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".into(), &self.weight), ("bias".into(), &self.bias)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("weight".into(), &mut self.weight), ("bias".into(), &mut self.bias)]
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> wirevae_core::Result<Tensor> {
        let n = rows_of(input, self.d)?;
        Tensor::from_vec(self.forward_flat(input.data(), n), input.dims())
    }
}

/// Lookup table for integer indices.
pub struct Embedding {
    /// Table: (num_embeddings, dim)
    pub weight: Tensor,
    pub num_embeddings: usize,
    pub dim: usize,
}

impl Embedding {
    pub fn new(num_embeddings: usize, dim: usize) -> Self {
        Self {
            weight: Tensor::randn(&[num_embeddings, dim]),
            num_embeddings,
            dim,
        }
    }

    /// Look up each index; returns flat (indices.len(), dim).
    ///
    /// Indices outside the table get zero vectors; debug builds assert.
    pub fn lookup(&self, indices: impl Iterator<Item = i64>) -> Vec<f32> {
        let table = self.weight.data();
        let mut out = Vec::new();
        for idx in indices {
            let start = out.len();
            out.resize(start + self.dim, 0.0);
            if idx >= 0 && (idx as usize) < self.num_embeddings {
                let src = idx as usize * self.dim;
                out[start..start + self.dim].copy_from_slice(&table[src..src + self.dim]);
            } else {
                debug_assert!(
                    false,
                    "embedding index {} outside table of {}",
                    idx, self.num_embeddings
                );
            }
        }
        out
    }
}

impl Parameterized for Embedding {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".into(), &self.weight)]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![("weight".into(), &mut self.weight)]
    }
}

/// Inverted dropout; identity outside training mode.
#[derive(Clone, Debug)]
pub struct Dropout {
    pub p: f32,
    training: bool,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p, training: false }
    }

    pub fn apply(&self, x: &mut [f32]) {
        if !self.training || self.p <= 0.0 {
            return;
        }
        let mut rng = rand::thread_rng();
        let scale = 1.0 / (1.0 - self.p);
        for v in x.iter_mut() {
            if rng.gen::<f32>() < self.p {
                *v = 0.0;
            } else {
                *v *= scale;
            }
        }
    }

    pub fn set_training(&mut self, mode: bool) {
        self.training = mode;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

/// Feed-forward network: Linear → GELU → Linear.
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
    pub d_model: usize,
    pub d_ff: usize,
}

impl FeedForward {
    pub fn new(d_model: usize, d_ff: usize) -> Self {
        Self {
            fc1: Linear::new(d_model, d_ff),
            fc2: Linear::new(d_ff, d_model),
            d_model,
            d_ff,
        }
    }

    /// Forward: (n, d_model) → (n, d_model)
    pub fn forward_flat(&self, x: &[f32], n: usize) -> Vec<f32> {
        let mut hidden = self.fc1.forward_flat(x, n);
        hidden.iter_mut().for_each(|v| *v = gelu(*v));
        self.fc2.forward_flat(&hidden, n)
    }
}

impl Parameterized for FeedForward {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("fc1", self.fc1.named_parameters());
        params.extend(prefixed("fc2", self.fc2.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("fc1", self.fc1.named_parameters_mut());
        params.extend(prefixed_mut("fc2", self.fc2.named_parameters_mut()));
        params
    }
}

/// Prediction MLP: Linear → GELU → Dropout → Linear.
pub struct Mlp {
    pub fc1: Linear,
    pub dropout: Dropout,
    pub fc2: Linear,
}

impl Mlp {
    /// Hidden width is `in_dim * expansion_factor` (at least 1).
    pub fn new(in_dim: usize, out_dim: usize, expansion_factor: f32, dropout: f32) -> Self {
        let hidden = ((in_dim as f32 * expansion_factor) as usize).max(1);
        Self {
            fc1: Linear::new(in_dim, hidden),
            dropout: Dropout::new(dropout),
            fc2: Linear::new(hidden, out_dim),
        }
    }

    pub fn out_dim(&self) -> usize {
        self.fc2.out_dim
    }

    pub fn forward_flat(&self, x: &[f32], n: usize) -> Vec<f32> {
        let mut hidden = self.fc1.forward_flat(x, n);
        hidden.iter_mut().for_each(|v| *v = gelu(*v));
        self.dropout.apply(&mut hidden);
        self.fc2.forward_flat(&hidden, n)
    }
}

impl Parameterized for Mlp {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("fc1", self.fc1.named_parameters());
        params.extend(prefixed("fc2", self.fc2.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("fc1", self.fc1.named_parameters_mut());
        params.extend(prefixed_mut("fc2", self.fc2.named_parameters_mut()));
        params
    }

    fn train(&mut self, mode: bool) {
        self.dropout.set_training(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

impl Module for Mlp {
    fn forward(&self, input: &Tensor) -> wirevae_core::Result<Tensor> {
        let n = rows_of(input, self.fc1.in_dim)?;
        let out = self.forward_flat(input.data(), n);
        Tensor::from_vec(out, &with_last_dim(input, self.out_dim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_module_shape() {
        let lin = Linear::new(4, 3);
        let x = Tensor::ones(&[2, 5, 4]);
        let y = lin.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 5, 3]);
        assert!(lin.forward(&Tensor::ones(&[2, 5])).is_err());
    }

    #[test]
    fn test_linear_known_values() {
        let mut lin = Linear::new(2, 1);
        lin.weight.data_mut().copy_from_slice(&[2.0, -1.0]);
        lin.bias.data_mut()[0] = 0.5;
        let out = lin.forward_flat(&[1.0, 3.0], 1);
        assert!((out[0] - (2.0 - 3.0 + 0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_layer_norm_centers_rows() {
        let ln = LayerNorm::new(4);
        let output = ln.forward_flat(&[1.0, 2.0, 3.0, 4.0], 1);
        let mean: f32 = output.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5, "mean should be ~0, got {}", mean);
    }

    #[test]
    fn test_embedding_lookup_copies_rows() {
        let emb = Embedding::new(3, 2);
        let out = emb.lookup([2i64, 0].into_iter());
        assert_eq!(&out[0..2], &emb.weight.data()[4..6]);
        assert_eq!(&out[2..4], &emb.weight.data()[0..2]);
    }

    #[test]
    fn test_dropout_is_identity_in_eval() {
        let mut mlp = Mlp::new(4, 2, 1.0, 0.5);
        let x = Tensor::ones(&[3, 4]);
        let a = mlp.forward(&x).unwrap();
        let b = mlp.forward(&x).unwrap();
        assert_eq!(a, b);
        mlp.train(true);
        assert!(mlp.is_training());
    }

    #[test]
    fn test_named_parameters_are_prefixed() {
        let ff = FeedForward::new(4, 8);
        let names: Vec<String> = ff.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["fc1.weight", "fc1.bias", "fc2.weight", "fc2.bias"]);
        assert_eq!(ff.param_count(), 4 * 8 + 8 + 8 * 4 + 4);
    }
}
