//! Fourier point embedding for segment endpoints.

use std::f32::consts::PI;

use wirevae_core::{prefixed, prefixed_mut, CoreError, Module, Parameterized, Tensor};

use crate::nn::Linear;

/// Number of sin/cos features per point (`hidden_dim / 6` frequencies per axis).
pub const POINT_FOURIER_DIM: usize = 48;

/// Embeds 3-D points as `Linear([sin(xB), cos(xB), x])`.
///
/// `B` is a fixed block-diagonal basis of octave frequencies `2^k * pi`,
/// one block per axis.
pub struct PointEmbed {
    /// Basis: (3, hidden_dim / 2); constant, not trainable.
    basis: Vec<f32>,
    pub mlp: Linear,
    pub hidden_dim: usize,
    pub dim: usize,
}

impl PointEmbed {
    pub fn new(hidden_dim: usize, dim: usize) -> Self {
        let freqs = hidden_dim / 6;
        let width = hidden_dim / 2;
        let mut basis = vec![0.0f32; 3 * width];
        for axis in 0..3 {
            for k in 0..freqs {
                basis[axis * width + axis * freqs + k] = 2f32.powi(k as i32) * PI;
            }
        }
        Self {
            basis,
            mlp: Linear::new(hidden_dim + 3, dim),
            hidden_dim,
            dim,
        }
    }

    /// Forward: (n, 3) → (n, dim)
    pub fn forward_flat(&self, points: &[f32], n: usize) -> Vec<f32> {
        let width = self.hidden_dim / 2;
        let feat = self.hidden_dim + 3;
        let mut features = vec![0.0f32; n * feat];
        for i in 0..n {
            let p = &points[i * 3..i * 3 + 3];
            let row = &mut features[i * feat..(i + 1) * feat];
            for e in 0..width {
                let proj = p[0] * self.basis[e] + p[1] * self.basis[width + e] + p[2] * self.basis[2 * width + e];
                row[e] = proj.sin();
                row[width + e] = proj.cos();
            }
            row[self.hidden_dim..].copy_from_slice(p);
        }
        self.mlp.forward_flat(&features, n)
    }
}

impl Parameterized for PointEmbed {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        prefixed("mlp", self.mlp.named_parameters())
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        prefixed_mut("mlp", self.mlp.named_parameters_mut())
    }
}

impl Module for PointEmbed {
    fn forward(&self, input: &Tensor) -> wirevae_core::Result<Tensor> {
        if input.dims().last() != Some(&3) {
            return Err(CoreError::ShapeMismatch {
                expected: vec![3],
                got: input.dims().to_vec(),
            });
        }
        let n = input.numel() / 3;
        let mut dims = input.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = self.dim;
        }
        Tensor::from_vec(self.forward_flat(input.data(), n), &dims)
    }
}
