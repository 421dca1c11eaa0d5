//! KL-regularized wireframe autoencoder and its deployment variants.
//!
//! - [`AutoencoderKlWireframe`]: encode → posterior → decode → predict, with
//!   the training loss.
//! - [`AutoencoderKlWireframeFastEncode`]: encoder half only, emits latents.
//! - [`AutoencoderKlWireframeFastDecode`]: decoder half only, latents in,
//!   predictions out.

use rand::RngCore;
use tracing::{debug, warn};

use wirevae_core::{prefixed, prefixed_mut, Dim, IndexTensor, Module, Parameterized, Tensor};

use crate::config::{WireframeVaeConfig, SEGMENT_CHANNELS};
use crate::decoder::WireframeDecoder;
use crate::encoder::WireframeEncoder;
use crate::error::Result;
use crate::heads::{build_head, PredictionHead, Predictions};
use crate::loss::{LossComponents, WireframeLoss};
use crate::nn::Linear;
use crate::posterior::DiagonalGaussian;

/// Per-call switches of [`AutoencoderKlWireframe::forward`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Draw the latent from the posterior instead of taking its mode.
    pub sample_posterior: bool,
    /// Return the training loss instead of the predictions.
    pub return_loss: bool,
}

/// Result of [`AutoencoderKlWireframe::encode`].
#[derive(Clone, Debug)]
pub struct EncoderOutput {
    pub latent_dist: DiagonalGaussian,
}

/// Result of [`AutoencoderKlWireframe::decode`].
#[derive(Clone, Debug)]
pub struct DecoderOutput {
    /// Decoder tokens: (batch, 1 + max_curves_num, attn_dim)
    pub sample: Tensor,
    pub predictions: Option<Predictions>,
}

/// Result of [`AutoencoderKlWireframe::forward`].
#[derive(Clone, Debug)]
pub enum ForwardOutput {
    Predictions(Predictions),
    Loss { total: f32, components: LossComponents },
}

/// Encoder output (batch, L, 2C) → posterior over (batch, C, L).
fn posterior_from_encoding(quant_proj: &Linear, h: &Tensor) -> Result<DiagonalGaussian> {
    let moments = quant_proj.forward(h)?.transpose()?;
    DiagonalGaussian::from_moments(&moments)
}

/// Latents (batch, L, C) → decoder tokens (batch, 1 + max_curves_num, attn_dim).
fn decode_latents(post_quant_proj: &Linear, decoder: &WireframeDecoder, zs: &Tensor) -> Result<Tensor> {
    let cfg = &decoder.config;
    zs.expect(
        "zs",
        &[Dim::Any, Dim::Is(cfg.wireframe_latent_num), Dim::Is(cfg.latent_channels)],
    )?;
    let zs = post_quant_proj.forward(zs)?;
    decoder.forward(&zs)
}

/// Full wireframe VAE.
pub struct AutoencoderKlWireframe {
    pub config: WireframeVaeConfig,
    pub encoder: WireframeEncoder,
    pub decoder: WireframeDecoder,
    /// 2C → 2C on encoder output.
    pub quant_proj: Linear,
    /// C → C on latents before decoding.
    pub post_quant_proj: Linear,
    pub head: Box<dyn PredictionHead>,
    pub loss: WireframeLoss,
}

impl AutoencoderKlWireframe {
    pub fn new(config: WireframeVaeConfig) -> Result<Self> {
        config.validate()?;
        let c = config.latent_channels;
        let model = Self {
            encoder: WireframeEncoder::new(config.encoder_config()),
            decoder: WireframeDecoder::new(config.decoder_config()),
            quant_proj: Linear::new(2 * c, 2 * c),
            post_quant_proj: Linear::new(c, c),
            head: build_head(&config),
            loss: WireframeLoss::new(
                config.loss.clone(),
                config.max_curves_num,
                config.max_col_diff,
                config.max_row_diff,
            ),
            config,
        };
        debug!(
            params = model.param_count(),
            head = ?model.config.head,
            criterion = ?model.config.loss.criterion,
            "built wireframe autoencoder"
        );
        Ok(model)
    }

    /// Encode: xs (batch, n_segments, ≥18), flag_offsets (batch, n_segments, 3)
    /// → posterior over (batch, latent_channels, wireframe_latent_num).
    pub fn encode(&self, xs: &Tensor, flag_offsets: &IndexTensor) -> Result<EncoderOutput> {
        let h = self.encoder.forward(xs, flag_offsets)?;
        Ok(EncoderOutput {
            latent_dist: posterior_from_encoding(&self.quant_proj, &h)?,
        })
    }

    /// Decode: z (batch, latent_channels, wireframe_latent_num) → decoder tokens,
    /// plus head predictions when `with_predictions` is set.
    pub fn decode(&self, z: &Tensor, with_predictions: bool) -> Result<DecoderOutput> {
        z.expect(
            "z",
            &[Dim::Any, Dim::Is(self.config.latent_channels), Dim::Is(self.config.wireframe_latent_num)],
        )?;
        let sample = decode_latents(&self.post_quant_proj, &self.decoder, &z.transpose()?)?;
        let predictions = if with_predictions {
            Some(self.head.predict(&sample)?)
        } else {
            None
        };
        Ok(DecoderOutput { sample, predictions })
    }

    /// Full pass.
    ///
    /// - `xs`: (batch, n_segments, 30): coordinates, latent mean, latent spread
    /// - `flag_offsets`: (batch, n_segments, 3): flag, column offset, row offset
    /// - `rng`: source for posterior sampling; the thread RNG when `None`
    pub fn forward(
        &self,
        xs: &Tensor,
        flag_offsets: &IndexTensor,
        options: ForwardOptions,
        rng: Option<&mut dyn RngCore>,
    ) -> Result<ForwardOutput> {
        xs.expect(
            "xs",
            &[Dim::Any, Dim::AtMost(self.config.max_curves_num), Dim::Is(SEGMENT_CHANNELS)],
        )?;
        let posterior = self.encode(xs, flag_offsets)?.latent_dist;

        let z = if options.sample_posterior {
            match rng {
                Some(rng) => posterior.sample(rng),
                None => posterior.sample(&mut rand::thread_rng()),
            }
        } else {
            posterior.mode()
        };

        let sample = self.decode(&z, false)?.sample;
        let predictions = self.head.predict(&sample)?;
        if !options.return_loss {
            return Ok(ForwardOutput::Predictions(predictions));
        }

        let (total, components) =
            self.loss
                .compute(&predictions, xs, flag_offsets, &posterior, options.sample_posterior)?;
        if !total.is_finite() {
            warn!(total, ?components, "non-finite wireframe loss");
        }
        Ok(ForwardOutput::Loss { total, components })
    }

    /// Switch dropout in the prediction heads.
    pub fn set_training(&mut self, mode: bool) {
        self.train(mode);
    }
}

impl Parameterized for AutoencoderKlWireframe {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("encoder", self.encoder.named_parameters());
        params.extend(prefixed("decoder", self.decoder.named_parameters()));
        params.extend(prefixed("quant_proj", self.quant_proj.named_parameters()));
        params.extend(prefixed("post_quant_proj", self.post_quant_proj.named_parameters()));
        params.extend(self.head.named_parameters());
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("encoder", self.encoder.named_parameters_mut());
        params.extend(prefixed_mut("decoder", self.decoder.named_parameters_mut()));
        params.extend(prefixed_mut("quant_proj", self.quant_proj.named_parameters_mut()));
        params.extend(prefixed_mut("post_quant_proj", self.post_quant_proj.named_parameters_mut()));
        params.extend(self.head.named_parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        self.head.train(mode);
    }

    fn is_training(&self) -> bool {
        self.head.is_training()
    }
}

/// Encoder half: segments → posterior mode (optionally with its std).
pub struct AutoencoderKlWireframeFastEncode {
    pub config: WireframeVaeConfig,
    pub encoder: WireframeEncoder,
    pub quant_proj: Linear,
}

impl AutoencoderKlWireframeFastEncode {
    pub fn new(config: WireframeVaeConfig) -> Result<Self> {
        config.validate()?;
        let c = config.latent_channels;
        let model = Self {
            encoder: WireframeEncoder::new(config.encoder_config()),
            quant_proj: Linear::new(2 * c, 2 * c),
            config,
        };
        debug!(params = model.param_count(), "built wireframe fast encoder");
        Ok(model)
    }

    /// Forward: → (batch, C, L), or (batch, 2C, L) as `[mean, std]` when `return_std`.
    pub fn forward(&self, xs: &Tensor, flag_offsets: &IndexTensor, return_std: bool) -> Result<Tensor> {
        let h = self.encoder.forward(xs, flag_offsets)?;
        let posterior = posterior_from_encoding(&self.quant_proj, &h)?;
        if return_std {
            posterior.mean_and_std()
        } else {
            Ok(posterior.mode())
        }
    }
}

impl Parameterized for AutoencoderKlWireframeFastEncode {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("encoder", self.encoder.named_parameters());
        params.extend(prefixed("quant_proj", self.quant_proj.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("encoder", self.encoder.named_parameters_mut());
        params.extend(prefixed_mut("quant_proj", self.quant_proj.named_parameters_mut()));
        params
    }
}

/// Decoder half: latents → predictions. No loss.
pub struct AutoencoderKlWireframeFastDecode {
    pub config: WireframeVaeConfig,
    pub decoder: WireframeDecoder,
    pub post_quant_proj: Linear,
    pub head: Box<dyn PredictionHead>,
}

impl AutoencoderKlWireframeFastDecode {
    pub fn new(config: WireframeVaeConfig) -> Result<Self> {
        config.validate()?;
        let model = Self {
            decoder: WireframeDecoder::new(config.decoder_config()),
            post_quant_proj: Linear::new(config.latent_channels, config.latent_channels),
            head: build_head(&config),
            config,
        };
        debug!(params = model.param_count(), head = ?model.config.head, "built wireframe fast decoder");
        Ok(model)
    }

    /// Forward: zs (batch, wireframe_latent_num, latent_channels) → predictions.
    pub fn forward(&self, zs: &Tensor) -> Result<Predictions> {
        let dec = decode_latents(&self.post_quant_proj, &self.decoder, zs)?;
        self.head.predict(&dec)
    }
}

impl Parameterized for AutoencoderKlWireframeFastDecode {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("decoder", self.decoder.named_parameters());
        params.extend(prefixed("post_quant_proj", self.post_quant_proj.named_parameters()));
        params.extend(self.head.named_parameters());
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("decoder", self.decoder.named_parameters_mut());
        params.extend(prefixed_mut("post_quant_proj", self.post_quant_proj.named_parameters_mut()));
        params.extend(self.head.named_parameters_mut());
        params
    }

    fn train(&mut self, mode: bool) {
        self.head.train(mode);
    }

    fn is_training(&self) -> bool {
        self.head.is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadStrategy;
    use crate::error::VaeError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const B: usize = 2;
    const N: usize = 4;

    fn inputs() -> (Tensor, IndexTensor) {
        let mut rng = StdRng::seed_from_u64(0);
        let xs = Tensor::randn_with(&[B, N, 30], &mut rng);
        let flags = [[1, 1, 0, 0], [1, 1, 1, 0]];
        let mut fo = Vec::new();
        for item in flags {
            for f in item {
                fo.extend_from_slice(&[f, 1, 2]);
            }
        }
        (xs, IndexTensor::from_vec(fo, &[B, N, 3]).unwrap())
    }

    fn model() -> AutoencoderKlWireframe {
        AutoencoderKlWireframe::new(WireframeVaeConfig::tiny()).unwrap()
    }

    #[test]
    fn test_encode_shapes() {
        let m = model();
        let (xs, fo) = inputs();
        let post = m.encode(&xs, &fo).unwrap().latent_dist;
        assert_eq!(post.mean.dims(), &[B, 4, 8]);
        assert_eq!(post.logvar.dims(), &[B, 4, 8]);
    }

    #[test]
    fn test_decode_shapes() {
        let m = model();
        let out = m.decode(&Tensor::randn(&[B, 4, 8]), true).unwrap();
        assert_eq!(out.sample.dims(), &[B, 1 + N, 16]);
        let p = out.predictions.unwrap();
        assert_eq!(p.cls.dims(), &[B, N]);
        assert!(m.decode(&Tensor::randn(&[B, 4, 8]), false).unwrap().predictions.is_none());
    }

    #[test]
    fn test_decode_rejects_transposed_latent() {
        let m = model();
        assert!(m.decode(&Tensor::randn(&[B, 8, 4]), true).is_err());
    }

    #[test]
    fn test_forward_mode_is_deterministic() {
        let m = model();
        let (xs, fo) = inputs();
        let a = m.forward(&xs, &fo, ForwardOptions::default(), None).unwrap();
        let b = m.forward(&xs, &fo, ForwardOptions::default(), None).unwrap();
        match (a, b) {
            (ForwardOutput::Predictions(a), ForwardOutput::Predictions(b)) => assert_eq!(a, b),
            _ => panic!("expected predictions"),
        }
    }

    #[test]
    fn test_forward_sampling_reproducible_with_seed() {
        let m = model();
        let (xs, fo) = inputs();
        let opts = ForwardOptions {
            sample_posterior: true,
            return_loss: false,
        };
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            match m.forward(&xs, &fo, opts, Some(&mut rng)).unwrap() {
                ForwardOutput::Predictions(p) => p,
                _ => panic!("expected predictions"),
            }
        };
        assert_eq!(run(3), run(3));
        assert_ne!(run(3), run(4));
    }

    #[test]
    fn test_forward_loss_mode_has_zero_kl() {
        let m = model();
        let (xs, fo) = inputs();
        let opts = ForwardOptions {
            sample_posterior: false,
            return_loss: true,
        };
        match m.forward(&xs, &fo, opts, None).unwrap() {
            ForwardOutput::Loss { total, components } => {
                assert_eq!(components.kl_loss, 0.0);
                assert!(total.is_finite());
                assert!((total - m.loss.total(&components)).abs() < 1e-5);
            }
            _ => panic!("expected loss"),
        }
    }

    #[test]
    fn test_forward_rejects_short_channels() {
        let m = model();
        let (_, fo) = inputs();
        let xs = Tensor::zeros(&[B, N, 18]);
        assert!(m.forward(&xs, &fo, ForwardOptions::default(), None).is_err());
    }

    #[test]
    fn test_fast_encode_outputs() {
        let cfg = WireframeVaeConfig::tiny();
        let enc = AutoencoderKlWireframeFastEncode::new(cfg).unwrap();
        let (xs, fo) = inputs();
        let mu = enc.forward(&xs, &fo, false).unwrap();
        assert_eq!(mu.dims(), &[B, 4, 8]);
        let mu_std = enc.forward(&xs, &fo, true).unwrap();
        assert_eq!(mu_std.dims(), &[B, 8, 8]);
        assert_eq!(&mu_std.data()[..32], &mu.data()[..32]);
    }

    #[test]
    fn test_fast_decode_outputs() {
        let cfg = WireframeVaeConfig {
            head: HeadStrategy::Mlp,
            ..WireframeVaeConfig::tiny()
        };
        let dec = AutoencoderKlWireframeFastDecode::new(cfg).unwrap();
        let p = dec.forward(&Tensor::randn(&[B, 8, 4])).unwrap();
        assert_eq!(p.segments.dims(), &[B, N, 6]);
        assert_eq!(p.offsets.dims(), &[B, N, 3 + 5]);
    }

    #[test]
    fn test_variants_share_parameter_names() {
        let full = model();
        let names: Vec<String> = full.named_parameters().into_iter().map(|(n, _)| n).collect();
        let enc = AutoencoderKlWireframeFastEncode::new(WireframeVaeConfig::tiny()).unwrap();
        let dec = AutoencoderKlWireframeFastDecode::new(WireframeVaeConfig::tiny()).unwrap();
        for (n, _) in enc.named_parameters().into_iter().chain(dec.named_parameters()) {
            assert!(names.contains(&n), "missing {n}");
        }
        assert_eq!(full.param_count(), enc.param_count() + dec.param_count());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = WireframeVaeConfig {
            num_heads: 3,
            ..WireframeVaeConfig::tiny()
        };
        assert!(AutoencoderKlWireframe::new(cfg).is_err());

        let zero_heads = WireframeVaeConfig {
            num_heads: 0,
            ..WireframeVaeConfig::tiny()
        };
        assert!(matches!(
            AutoencoderKlWireframe::new(zero_heads.clone()),
            Err(VaeError::InvalidConfig(_))
        ));
        assert!(AutoencoderKlWireframeFastEncode::new(zero_heads.clone()).is_err());
        assert!(AutoencoderKlWireframeFastDecode::new(zero_heads).is_err());
    }

    #[test]
    fn test_set_training_reaches_heads() {
        let mut m = AutoencoderKlWireframe::new(WireframeVaeConfig {
            head: HeadStrategy::Mlp,
            ..WireframeVaeConfig::tiny()
        })
        .unwrap();
        assert!(!m.is_training());
        m.set_training(true);
        assert!(m.is_training());
    }
}
