//! Diagonal Gaussian posterior over the wireframe latent.

use rand::Rng;

use wirevae_core::{Dim, Tensor};

use crate::error::Result;

const LOGVAR_MIN: f32 = -30.0;
const LOGVAR_MAX: f32 = 20.0;

/// Independent normal per latent element, parameterized by `(mean, logvar)`.
///
/// Built from moments of shape (batch, 2 * channels, latents): the first
/// `channels` rows are the mean, the rest the log-variance.
#[derive(Clone, Debug)]
pub struct DiagonalGaussian {
    pub mean: Tensor,
    /// Clamped to `[-30, 20]`.
    pub logvar: Tensor,
    pub std: Tensor,
    pub var: Tensor,
}

impl DiagonalGaussian {
    /// Split moments: (batch, 2C, L) → mean, logvar each (batch, C, L)
    pub fn from_moments(moments: &Tensor) -> Result<Self> {
        moments.expect("moments", &[Dim::Any, Dim::Any, Dim::Any])?;
        let dims = moments.dims();
        let (batch, two_c, latents) = (dims[0], dims[1], dims[2]);
        if two_c == 0 || two_c % 2 != 0 || latents == 0 {
            return Err(wirevae_core::CoreError::ShapeContract {
                name: "moments".into(),
                expected: "(batch, 2 * channels, latents)".into(),
                got: dims.to_vec(),
            }
            .into());
        }
        let channels = two_c / 2;
        let half = channels * latents;

        let mut mean = Vec::with_capacity(batch * half);
        let mut logvar = Vec::with_capacity(batch * half);
        for item in moments.data().chunks_exact(2 * half) {
            mean.extend_from_slice(&item[..half]);
            logvar.extend(item[half..].iter().map(|v| v.clamp(LOGVAR_MIN, LOGVAR_MAX)));
        }

        let shape = [batch, channels, latents];
        let logvar = Tensor::from_vec(logvar, &shape)?;
        let std = logvar.map(|v| (0.5 * v).exp());
        let var = logvar.map(f32::exp);
        Ok(Self {
            mean: Tensor::from_vec(mean, &shape)?,
            logvar,
            std,
            var,
        })
    }

    /// Distribution mode; equal to the mean.
    pub fn mode(&self) -> Tensor {
        self.mean.clone()
    }

    /// Reparameterized draw: `mean + std * eps` with `eps ~ N(0, 1)` from `rng`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Tensor {
        let eps = Tensor::randn_with(self.mean.dims(), rng);
        let mut z = self.mean.clone();
        for ((v, s), e) in z.data_mut().iter_mut().zip(self.std.data()).zip(eps.data()) {
            *v += s * e;
        }
        z
    }

    /// KL(q || N(0, I)) per batch item: `0.5 * sum(mean^2 + var - 1 - logvar)`.
    pub fn kl(&self) -> Vec<f32> {
        let batch = self.mean.dims()[0];
        let per_item = self.mean.numel() / batch.max(1);
        (0..batch)
            .map(|b| {
                let range = b * per_item..(b + 1) * per_item;
                let sum: f32 = self.mean.data()[range.clone()]
                    .iter()
                    .zip(&self.var.data()[range.clone()])
                    .zip(&self.logvar.data()[range])
                    .map(|((m, v), lv)| m * m + v - 1.0 - lv)
                    .sum();
                0.5 * sum
            })
            .collect()
    }

    /// `[mean, std]` stacked on the channel axis: (batch, 2C, L).
    pub fn mean_and_std(&self) -> Result<Tensor> {
        Ok(Tensor::cat_channels(&[&self.mean, &self.std])?)
    }
}
