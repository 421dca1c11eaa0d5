//! Prediction heads mapping decoder tokens to wireframe predictions.
//!
//! Token 0 of the decoder output drives segment-count classification; tokens
//! `1..=max_curves_num` drive the per-segment predictions.

use wirevae_core::{prefixed, prefixed_mut, Dim, Parameterized, Tensor};

use crate::config::{HeadStrategy, WireframeVaeConfig, CURVE_LATENT_CHANNELS, SEGMENT_COORDS};
use crate::error::Result;
use crate::nn::{Linear, Mlp};

/// Decoded wireframe predictions.
#[derive(Clone, Debug, PartialEq)]
pub struct Predictions {
    /// Segment-count logits: (batch, max_curves_num)
    pub cls: Tensor,
    /// Endpoint coordinates: (batch, max_curves_num, 6)
    pub segments: Tensor,
    /// Column then row offset logits: (batch, max_curves_num, max_col_diff + max_row_diff)
    pub offsets: Tensor,
    /// Curve latent means: (batch, max_curves_num, 12)
    pub curve_latent: Tensor,
}

/// Strategy turning decoder output into [`Predictions`].
pub trait PredictionHead: Parameterized + Send + Sync {
    /// Forward: (batch, 1 + max_curves_num, attn_dim) → predictions
    fn predict(&self, dec: &Tensor) -> Result<Predictions>;
}

/// Build the head selected by `config.head`.
pub fn build_head(config: &WireframeVaeConfig) -> Box<dyn PredictionHead> {
    match config.head {
        HeadStrategy::Linear => Box::new(LinearHead::new(config)),
        HeadStrategy::Mlp => Box::new(MlpHead::new(config)),
    }
}

/// Split decoder output into the classification token and the feature tokens.
fn split_tokens(dec: &Tensor, attn_dim: usize, max_curves_num: usize) -> Result<(usize, Vec<f32>, Vec<f32>)> {
    dec.expect("dec", &[Dim::Any, Dim::Is(1 + max_curves_num), Dim::Is(attn_dim)])?;
    let batch = dec.dims()[0];
    let per_item = (1 + max_curves_num) * attn_dim;
    let mut cls_tokens = Vec::with_capacity(batch * attn_dim);
    let mut feature_tokens = Vec::with_capacity(batch * max_curves_num * attn_dim);
    for item in dec.data().chunks_exact(per_item) {
        cls_tokens.extend_from_slice(&item[..attn_dim]);
        feature_tokens.extend_from_slice(&item[attn_dim..]);
    }
    Ok((batch, cls_tokens, feature_tokens))
}

/// Single linear projection per output, with the per-segment features sliced
/// as `[coords | col offsets | row offsets | curve latent]`.
pub struct LinearHead {
    pub predict_cls: Linear,
    pub predict_features: Linear,
    attn_dim: usize,
    max_curves_num: usize,
    max_col_diff: usize,
    max_row_diff: usize,
}

impl LinearHead {
    pub fn new(config: &WireframeVaeConfig) -> Self {
        Self {
            predict_cls: Linear::new(config.attn_dim, config.max_curves_num),
            predict_features: Linear::new(config.attn_dim, config.feature_width()),
            attn_dim: config.attn_dim,
            max_curves_num: config.max_curves_num,
            max_col_diff: config.max_col_diff,
            max_row_diff: config.max_row_diff,
        }
    }
}

impl PredictionHead for LinearHead {
    fn predict(&self, dec: &Tensor) -> Result<Predictions> {
        let (batch, cls_tokens, feature_tokens) = split_tokens(dec, self.attn_dim, self.max_curves_num)?;
        let rows = batch * self.max_curves_num;

        let cls = self.predict_cls.forward_flat(&cls_tokens, batch);
        let features = self.predict_features.forward_flat(&feature_tokens, rows);
        let features = Tensor::from_vec(
            features,
            &[batch, self.max_curves_num, self.predict_features.out_dim],
        )?;

        let offsets_width = self.max_col_diff + self.max_row_diff;
        assert_eq!(
            SEGMENT_COORDS + offsets_width + CURVE_LATENT_CHANNELS,
            self.predict_features.out_dim,
            "feature slices must cover the projection width"
        );

        Ok(Predictions {
            cls: Tensor::from_vec(cls, &[batch, self.max_curves_num])?,
            segments: features.narrow_last(0, SEGMENT_COORDS)?,
            offsets: features.narrow_last(SEGMENT_COORDS, offsets_width)?,
            curve_latent: features.narrow_last(SEGMENT_COORDS + offsets_width, CURVE_LATENT_CHANNELS)?,
        })
    }
}

impl Parameterized for LinearHead {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("predict_cls", self.predict_cls.named_parameters());
        params.extend(prefixed("predict_features", self.predict_features.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("predict_cls", self.predict_cls.named_parameters_mut());
        params.extend(prefixed_mut("predict_features", self.predict_features.named_parameters_mut()));
        params
    }
}

/// Four independent MLPs; dropout on the classification and offset heads.
pub struct MlpHead {
    pub predict_cls: Mlp,
    pub predict_segments: Mlp,
    pub predict_diffs: Mlp,
    pub predict_curve_latent: Mlp,
    attn_dim: usize,
    max_curves_num: usize,
}

impl MlpHead {
    pub fn new(config: &WireframeVaeConfig) -> Self {
        let dim = config.attn_dim;
        let expansion = config.mlp_expansion_factor;
        let dropout = config.mlp_dropout;
        Self {
            predict_cls: Mlp::new(dim, config.max_curves_num, expansion, dropout),
            predict_segments: Mlp::new(dim, SEGMENT_COORDS, expansion, 0.0),
            predict_diffs: Mlp::new(dim, config.max_col_diff + config.max_row_diff, expansion, dropout),
            predict_curve_latent: Mlp::new(dim, CURVE_LATENT_CHANNELS, expansion, 0.0),
            attn_dim: dim,
            max_curves_num: config.max_curves_num,
        }
    }
}

impl PredictionHead for MlpHead {
    fn predict(&self, dec: &Tensor) -> Result<Predictions> {
        let (batch, cls_tokens, feature_tokens) = split_tokens(dec, self.attn_dim, self.max_curves_num)?;
        let n = self.max_curves_num;
        let rows = batch * n;

        let cls = self.predict_cls.forward_flat(&cls_tokens, batch);
        let segments = self.predict_segments.forward_flat(&feature_tokens, rows);
        let offsets = self.predict_diffs.forward_flat(&feature_tokens, rows);
        let curve_latent = self.predict_curve_latent.forward_flat(&feature_tokens, rows);

        Ok(Predictions {
            cls: Tensor::from_vec(cls, &[batch, n])?,
            segments: Tensor::from_vec(segments, &[batch, n, SEGMENT_COORDS])?,
            offsets: Tensor::from_vec(offsets, &[batch, n, self.predict_diffs.out_dim()])?,
            curve_latent: Tensor::from_vec(curve_latent, &[batch, n, CURVE_LATENT_CHANNELS])?,
        })
    }
}

impl Parameterized for MlpHead {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("predict_cls", self.predict_cls.named_parameters());
        params.extend(prefixed("predict_segments", self.predict_segments.named_parameters()));
        params.extend(prefixed("predict_diffs", self.predict_diffs.named_parameters()));
        params.extend(prefixed("predict_curve_latent", self.predict_curve_latent.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("predict_cls", self.predict_cls.named_parameters_mut());
        params.extend(prefixed_mut("predict_segments", self.predict_segments.named_parameters_mut()));
        params.extend(prefixed_mut("predict_diffs", self.predict_diffs.named_parameters_mut()));
        params.extend(prefixed_mut(
            "predict_curve_latent",
            self.predict_curve_latent.named_parameters_mut(),
        ));
        params
    }

    fn train(&mut self, mode: bool) {
        self.predict_cls.train(mode);
        self.predict_segments.train(mode);
        self.predict_diffs.train(mode);
        self.predict_curve_latent.train(mode);
    }

    fn is_training(&self) -> bool {
        self.predict_cls.is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec_output(cfg: &WireframeVaeConfig, batch: usize) -> Tensor {
        Tensor::randn(&[batch, 1 + cfg.max_curves_num, cfg.attn_dim])
    }

    fn assert_prediction_shapes(p: &Predictions, cfg: &WireframeVaeConfig, batch: usize) {
        let n = cfg.max_curves_num;
        assert_eq!(p.cls.dims(), &[batch, n]);
        assert_eq!(p.segments.dims(), &[batch, n, 6]);
        assert_eq!(p.offsets.dims(), &[batch, n, cfg.max_col_diff + cfg.max_row_diff]);
        assert_eq!(p.curve_latent.dims(), &[batch, n, 12]);
    }

    #[test]
    fn test_linear_head_shapes() {
        let cfg = WireframeVaeConfig::tiny();
        let head = LinearHead::new(&cfg);
        let p = head.predict(&dec_output(&cfg, 2)).unwrap();
        assert_prediction_shapes(&p, &cfg, 2);
    }

    #[test]
    fn test_mlp_head_shapes_match_linear() {
        let cfg = WireframeVaeConfig {
            head: HeadStrategy::Mlp,
            ..WireframeVaeConfig::tiny()
        };
        let head = build_head(&cfg);
        let p = head.predict(&dec_output(&cfg, 3)).unwrap();
        assert_prediction_shapes(&p, &cfg, 3);
    }

    #[test]
    fn test_linear_head_slices_feature_projection() {
        let cfg = WireframeVaeConfig::tiny();
        let head = LinearHead::new(&cfg);
        let dec = dec_output(&cfg, 1);
        let p = head.predict(&dec).unwrap();

        // Recompute the projection for the first feature token.
        let token = &dec.data()[cfg.attn_dim..2 * cfg.attn_dim];
        let full = head.predict_features.forward_flat(token, 1);
        assert_eq!(&p.segments.data()[..6], &full[..6]);
        let w = cfg.max_col_diff + cfg.max_row_diff;
        assert_eq!(&p.offsets.data()[..w], &full[6..6 + w]);
        assert_eq!(&p.curve_latent.data()[..12], &full[6 + w..]);
    }

    #[test]
    fn test_mlp_head_train_mode_propagates() {
        let cfg = WireframeVaeConfig {
            head: HeadStrategy::Mlp,
            ..WireframeVaeConfig::tiny()
        };
        let mut head = MlpHead::new(&cfg);
        assert!(!head.is_training());
        head.train(true);
        assert!(head.is_training());
        assert!(head.predict_diffs.is_training());
    }

    #[test]
    fn test_head_parameter_names() {
        let cfg = WireframeVaeConfig::tiny();
        let names: Vec<String> = LinearHead::new(&cfg)
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert!(names.contains(&"predict_cls.weight".to_string()));
        assert!(names.contains(&"predict_features.bias".to_string()));
    }

    #[test]
    fn test_head_rejects_wrong_token_count() {
        let cfg = WireframeVaeConfig::tiny();
        let head = LinearHead::new(&cfg);
        let dec = Tensor::zeros(&[1, cfg.max_curves_num, cfg.attn_dim]);
        assert!(head.predict(&dec).is_err());
    }
}
