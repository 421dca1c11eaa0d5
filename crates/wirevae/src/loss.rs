//! Training objective for the wireframe autoencoder.
//!
//! Five task losses (segment count, endpoint regression, column and row
//! offsets, curve latent regression) plus the KL term of the posterior.

use wirevae_core::{Dim, IndexTensor, Tensor};

use crate::config::{
    CriterionKind, LossConfig, CURVE_LATENT_CHANNELS, ENCODER_INPUT_CHANNELS, FLAG_OFFSET_CHANNELS,
    SEGMENT_CHANNELS, SEGMENT_COORDS,
};
use crate::encoder::segment_mask;
use crate::error::{Result, VaeError};
use crate::heads::Predictions;
use crate::posterior::DiagonalGaussian;

/// Classification criterion over logits of shape (n, classes).
///
/// `weights` are per-class; targets outside `0..classes` contribute nothing.
pub trait Criterion: Send + Sync {
    /// Per-position loss (no reduction).
    fn per_position(
        &self,
        logits: &[f32],
        classes: usize,
        targets: &[i64],
        weights: Option<&[f32]>,
        label_smoothing: f32,
    ) -> Vec<f32>;

    /// Mean reduction.
    fn mean(
        &self,
        logits: &[f32],
        classes: usize,
        targets: &[i64],
        weights: Option<&[f32]>,
        label_smoothing: f32,
    ) -> f32;
}

/// Label-smoothed, optionally class-weighted cross-entropy.
///
/// `loss_n = -sum_c w_c * log p_c * ((1 - eps) * [c = y_n] + eps / C)`;
/// the mean divides by `sum_n w_{y_n}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrossEntropy;

/// Focal loss on top of [`CrossEntropy`]: `(1 - exp(-ce))^gamma * ce`.
#[derive(Clone, Copy, Debug)]
pub struct FocalLoss {
    pub gamma: f32,
}

impl Default for FocalLoss {
    fn default() -> Self {
        Self { gamma: 2.0 }
    }
}

fn in_range(target: i64, classes: usize) -> Option<usize> {
    (target >= 0 && (target as usize) < classes).then_some(target as usize)
}

fn log_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
    row.iter().map(|&v| v - log_sum).collect()
}

impl Criterion for CrossEntropy {
    fn per_position(
        &self,
        logits: &[f32],
        classes: usize,
        targets: &[i64],
        weights: Option<&[f32]>,
        label_smoothing: f32,
    ) -> Vec<f32> {
        let eps = label_smoothing;
        let uniform = eps / classes as f32;
        logits
            .chunks_exact(classes)
            .zip(targets)
            .map(|(row, &target)| {
                let Some(y) = in_range(target, classes) else {
                    return 0.0;
                };
                let log_p = log_softmax(row);
                let mut loss = 0.0f32;
                for (c, lp) in log_p.iter().enumerate() {
                    let w = weights.map_or(1.0, |w| w[c]);
                    let q = if c == y { 1.0 - eps + uniform } else { uniform };
                    loss -= w * lp * q;
                }
                loss
            })
            .collect()
    }

    fn mean(
        &self,
        logits: &[f32],
        classes: usize,
        targets: &[i64],
        weights: Option<&[f32]>,
        label_smoothing: f32,
    ) -> f32 {
        let losses = self.per_position(logits, classes, targets, weights, label_smoothing);
        let denom: f32 = targets
            .iter()
            .filter_map(|&t| in_range(t, classes))
            .map(|y| weights.map_or(1.0, |w| w[y]))
            .sum();
        if denom == 0.0 {
            return 0.0;
        }
        losses.iter().sum::<f32>() / denom
    }
}

impl Criterion for FocalLoss {
    fn per_position(
        &self,
        logits: &[f32],
        classes: usize,
        targets: &[i64],
        weights: Option<&[f32]>,
        label_smoothing: f32,
    ) -> Vec<f32> {
        CrossEntropy
            .per_position(logits, classes, targets, weights, label_smoothing)
            .into_iter()
            .map(|ce| (1.0 - (-ce).exp()).powf(self.gamma) * ce)
            .collect()
    }

    fn mean(
        &self,
        logits: &[f32],
        classes: usize,
        targets: &[i64],
        weights: Option<&[f32]>,
        label_smoothing: f32,
    ) -> f32 {
        let losses = self.per_position(logits, classes, targets, weights, label_smoothing);
        if losses.is_empty() {
            return 0.0;
        }
        losses.iter().sum::<f32>() / losses.len() as f32
    }
}

impl CriterionKind {
    pub fn build(self) -> Box<dyn Criterion> {
        match self {
            CriterionKind::CrossEntropy => Box::new(CrossEntropy),
            CriterionKind::Focal { gamma } => Box::new(FocalLoss { gamma }),
        }
    }
}

/// Unweighted loss terms plus posterior diagnostics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LossComponents {
    pub cls_ce_loss: f32,
    pub segment_mse_loss: f32,
    pub col_diff_ce_loss: f32,
    pub row_diff_ce_loss: f32,
    pub curve_latent_loss: f32,
    pub kl_loss: f32,
    /// `mean(|posterior mean|)`
    pub mu: f32,
    /// `mean(posterior std)`
    pub std: f32,
}

/// Mean of `values` where `mask` holds; 0.0 over an empty selection.
pub fn masked_mean(values: &[f32], mask: &[bool]) -> f32 {
    let (sum, count) = values
        .iter()
        .zip(mask)
        .filter(|(_, m)| **m)
        .fold((0.0f32, 0usize), |(s, c), (&v, _)| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Segment-count class per item: `sum(flags) - 1`.
///
/// Items without any flagged segment have no class and are rejected.
pub fn classification_targets(flag_offsets: &IndexTensor) -> Result<Vec<i64>> {
    flag_offsets.expect("flag_offsets", &[Dim::Any, Dim::Any, Dim::Is(FLAG_OFFSET_CHANNELS)])?;
    let dims = flag_offsets.dims();
    let per_item = dims[1] * FLAG_OFFSET_CHANNELS;
    flag_offsets
        .data()
        .chunks_exact(per_item.max(1))
        .enumerate()
        .map(|(index, item)| {
            let count: i64 = item.chunks_exact(FLAG_OFFSET_CHANNELS).map(|row| row[0]).sum();
            if count <= 0 {
                Err(VaeError::EmptyWireframe { index })
            } else {
                Ok(count - 1)
            }
        })
        .collect()
}

/// Gather rows `0..n_seg` of each item from a (batch, n_max, width) buffer.
fn leading_positions(t: &Tensor, n_seg: usize) -> Vec<f32> {
    let dims = t.dims();
    let (n_max, width) = (dims[1], dims[2]);
    t.data()
        .chunks_exact(n_max * width)
        .flat_map(|item| item[..n_seg * width].iter().copied())
        .collect()
}

/// Masked mean squared error of the endpoint coordinates.
///
/// `pred`: (batch, n_max, 6); `xs`: (batch, n_seg, ≥6); mean over valid × 6.
pub fn segment_regression_loss(pred: &Tensor, xs: &Tensor, mask: &[bool]) -> f32 {
    let n_seg = xs.dims()[1];
    let channels = xs.dims()[2];
    let pred = leading_positions(pred, n_seg);
    let mut errors = Vec::with_capacity(pred.len());
    let mut elem_mask = Vec::with_capacity(pred.len());
    for (i, &valid) in mask.iter().enumerate() {
        let gt = &xs.data()[i * channels..i * channels + SEGMENT_COORDS];
        let p = &pred[i * SEGMENT_COORDS..(i + 1) * SEGMENT_COORDS];
        for (a, b) in p.iter().zip(gt) {
            errors.push((a - b) * (a - b));
            elem_mask.push(valid);
        }
    }
    masked_mean(&errors, &elem_mask)
}

/// Weighted curve latent regression.
///
/// Ground truth mean is `xs[..., 6..18]`, spread `xs[..., 18..30]`; each
/// element is weighted by `1.2 - 0.5 * ln(clamp(spread, 0, 1) + 1.7183)`.
pub fn curve_latent_loss(pred: &Tensor, xs: &Tensor, mask: &[bool]) -> f32 {
    let n_seg = xs.dims()[1];
    let channels = xs.dims()[2];
    let pred = leading_positions(pred, n_seg);
    let mut errors = Vec::with_capacity(pred.len());
    let mut elem_mask = Vec::with_capacity(pred.len());
    for (i, &valid) in mask.iter().enumerate() {
        let row = &xs.data()[i * channels..(i + 1) * channels];
        let mu = &row[SEGMENT_COORDS..ENCODER_INPUT_CHANNELS];
        let spread = &row[ENCODER_INPUT_CHANNELS..ENCODER_INPUT_CHANNELS + CURVE_LATENT_CHANNELS];
        let p = &pred[i * CURVE_LATENT_CHANNELS..(i + 1) * CURVE_LATENT_CHANNELS];
        for ((a, b), s) in p.iter().zip(mu).zip(spread) {
            let w = 1.2 - 0.5 * (s.clamp(0.0, 1.0) + 1.7183).ln();
            errors.push(w * (a - b) * (a - b));
            elem_mask.push(valid);
        }
    }
    masked_mean(&errors, &elem_mask)
}

/// Batch-mean KL to the standard normal; exactly zero for the mode pathway.
pub fn kl_divergence(posterior: &DiagonalGaussian, sampled: bool) -> f32 {
    if !sampled {
        return 0.0;
    }
    let per_item = posterior.kl();
    if per_item.is_empty() {
        return 0.0;
    }
    per_item.iter().sum::<f32>() / per_item.len() as f32
}

/// Composite wireframe loss with its fixed weight tables.
pub struct WireframeLoss {
    pub config: LossConfig,
    criterion: Box<dyn Criterion>,
    max_curves_num: usize,
    max_col_diff: usize,
    max_row_diff: usize,
    /// `exp(linspace(-1, 1, max_col_diff))`
    pub col_diff_class_weights: Vec<f32>,
    /// `exp(linspace(-1, 1, max_row_diff))`
    pub row_diff_class_weights: Vec<f32>,
    /// `1.2 - 0.2 * ln(linspace(0, 2, max_curves_num) + 1.7183)`
    pub col_position_weights: Vec<f32>,
}

impl WireframeLoss {
    pub fn new(config: LossConfig, max_curves_num: usize, max_col_diff: usize, max_row_diff: usize) -> Self {
        let class_weights = |n: usize| Tensor::linspace(-1.0, 1.0, n).map(f32::exp).into_vec();
        let col_position_weights = Tensor::linspace(0.0, 2.0, max_curves_num)
            .map(|t| 1.2 - 0.2 * (t + 1.7183).ln())
            .into_vec();
        Self {
            criterion: config.criterion.build(),
            config,
            max_curves_num,
            max_col_diff,
            max_row_diff,
            col_diff_class_weights: class_weights(max_col_diff),
            row_diff_class_weights: class_weights(max_row_diff),
            col_position_weights,
        }
    }

    /// Column and row offset losses, both masked means.
    ///
    /// The column loss is additionally scaled by the per-position weights.
    pub fn offset_losses(&self, offsets: &Tensor, flag_offsets: &IndexTensor, mask: &[bool]) -> (f32, f32) {
        let n_seg = flag_offsets.dims()[1];
        let width = self.max_col_diff + self.max_row_diff;
        let logits = leading_positions(offsets, n_seg);

        let mut col_logits = Vec::with_capacity(mask.len() * self.max_col_diff);
        let mut row_logits = Vec::with_capacity(mask.len() * self.max_row_diff);
        for row in logits.chunks_exact(width) {
            col_logits.extend_from_slice(&row[..self.max_col_diff]);
            row_logits.extend_from_slice(&row[self.max_col_diff..]);
        }
        let fo = flag_offsets.data();
        let col_targets: Vec<i64> = fo.chunks_exact(FLAG_OFFSET_CHANNELS).map(|r| r[1]).collect();
        let row_targets: Vec<i64> = fo.chunks_exact(FLAG_OFFSET_CHANNELS).map(|r| r[2]).collect();

        let eps = self.config.label_smoothing;
        let mut col = self.criterion.per_position(
            &col_logits,
            self.max_col_diff,
            &col_targets,
            Some(&self.col_diff_class_weights),
            eps,
        );
        for (i, v) in col.iter_mut().enumerate() {
            *v *= self.col_position_weights[i % n_seg];
        }
        let row = self.criterion.per_position(
            &row_logits,
            self.max_row_diff,
            &row_targets,
            Some(&self.row_diff_class_weights),
            eps,
        );
        (masked_mean(&col, mask), masked_mean(&row, mask))
    }

    /// Evaluate every term against the ground truth.
    ///
    /// - `preds`: head output over `max_curves_num` positions
    /// - `xs`: (batch, n_segments, 30) segment tensor
    /// - `flag_offsets`: (batch, n_segments, 3)
    /// - `sampled`: whether the latent was drawn from the posterior
    ///
    /// Returns the weighted total and the unweighted components.
    pub fn compute(
        &self,
        preds: &Predictions,
        xs: &Tensor,
        flag_offsets: &IndexTensor,
        posterior: &DiagonalGaussian,
        sampled: bool,
    ) -> Result<(f32, LossComponents)> {
        xs.expect(
            "xs",
            &[Dim::Any, Dim::AtMost(self.max_curves_num), Dim::Is(SEGMENT_CHANNELS)],
        )?;
        let batch = xs.dims()[0];
        let n_seg = xs.dims()[1];
        flag_offsets.expect("flag_offsets", &[Dim::Is(batch), Dim::Is(n_seg), Dim::Is(FLAG_OFFSET_CHANNELS)])?;
        let n_max = self.max_curves_num;
        preds.cls.expect("cls", &[Dim::Is(batch), Dim::Is(n_max)])?;
        preds
            .segments
            .expect("segments", &[Dim::Is(batch), Dim::Is(n_max), Dim::Is(SEGMENT_COORDS)])?;
        preds.offsets.expect(
            "offsets",
            &[Dim::Is(batch), Dim::Is(n_max), Dim::Is(self.max_col_diff + self.max_row_diff)],
        )?;
        preds.curve_latent.expect(
            "curve_latent",
            &[Dim::Is(batch), Dim::Is(n_max), Dim::Is(CURVE_LATENT_CHANNELS)],
        )?;

        let mask = segment_mask(flag_offsets);
        let targets = classification_targets(flag_offsets)?;

        let cls_ce_loss = self.criterion.mean(
            preds.cls.data(),
            n_max,
            &targets,
            None,
            self.config.label_smoothing,
        );
        let segment_mse_loss = segment_regression_loss(&preds.segments, xs, &mask);
        let (col_diff_ce_loss, row_diff_ce_loss) = self.offset_losses(&preds.offsets, flag_offsets, &mask);
        let curve_latent_loss = curve_latent_loss(&preds.curve_latent, xs, &mask);
        let kl_loss = kl_divergence(posterior, sampled);

        let components = LossComponents {
            cls_ce_loss,
            segment_mse_loss,
            col_diff_ce_loss,
            row_diff_ce_loss,
            curve_latent_loss,
            kl_loss,
            mu: posterior.mean.abs_mean(),
            std: posterior.std.mean(),
        };
        Ok((self.total(&components), components))
    }

    /// Weighted sum of the six loss terms.
    pub fn total(&self, c: &LossComponents) -> f32 {
        let w = &self.config;
        w.cls_loss_weight * c.cls_ce_loss
            + w.segment_loss_weight * c.segment_mse_loss
            + w.col_diff_loss_weight * c.col_diff_ce_loss
            + w.row_diff_loss_weight * c.row_diff_ce_loss
            + w.curve_latent_loss_weight * c.curve_latent_loss
            + w.kl_loss_weight * c.kl_loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N_MAX: usize = 4;
    const COL: usize = 3;
    const ROW: usize = 5;

    fn loss_fn() -> WireframeLoss {
        WireframeLoss::new(LossConfig::default(), N_MAX, COL, ROW)
    }

    fn flag_offsets(flags: &[[i64; N_MAX]]) -> IndexTensor {
        let mut data = Vec::new();
        for item in flags {
            for &f in item {
                data.extend_from_slice(&[f, 1, 2]);
            }
        }
        IndexTensor::from_vec(data, &[flags.len(), N_MAX, 3]).unwrap()
    }

    fn zero_predictions(batch: usize) -> Predictions {
        Predictions {
            cls: Tensor::zeros(&[batch, N_MAX]),
            segments: Tensor::zeros(&[batch, N_MAX, 6]),
            offsets: Tensor::zeros(&[batch, N_MAX, COL + ROW]),
            curve_latent: Tensor::zeros(&[batch, N_MAX, 12]),
        }
    }

    fn zero_posterior(batch: usize) -> DiagonalGaussian {
        DiagonalGaussian::from_moments(&Tensor::zeros(&[batch, 8, 8])).unwrap()
    }

    #[test]
    fn test_classification_targets() {
        let fo = flag_offsets(&[[1, 1, 0, 0], [1, 1, 1, 0]]);
        assert_eq!(classification_targets(&fo).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_empty_wireframe_rejected() {
        let fo = flag_offsets(&[[1, 0, 0, 0], [0, 0, 0, 0]]);
        assert_eq!(
            classification_targets(&fo),
            Err(VaeError::EmptyWireframe { index: 1 })
        );
    }

    #[test]
    fn test_weight_tables() {
        let loss = loss_fn();
        assert!((loss.col_diff_class_weights[0] - (-1f32).exp()).abs() < 1e-6);
        assert!((loss.col_diff_class_weights[COL - 1] - 1f32.exp()).abs() < 1e-5);
        assert_eq!(loss.row_diff_class_weights.len(), ROW);
        assert!((loss.col_position_weights[0] - (1.2 - 0.2 * 1.7183f32.ln())).abs() < 1e-6);
        assert!((loss.col_position_weights[N_MAX - 1] - (1.2 - 0.2 * 3.7183f32.ln())).abs() < 1e-6);
        assert!(loss.col_position_weights.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(loss.col_diff_class_weights.len(), COL);
        for w in loss
            .col_diff_class_weights
            .iter()
            .chain(&loss.row_diff_class_weights)
            .chain(&loss.col_position_weights)
        {
            assert!(*w > 0.0);
        }
    }

    #[test]
    fn test_weight_tables_are_deterministic() {
        let (a, b) = (loss_fn(), loss_fn());
        assert_eq!(a.col_diff_class_weights, b.col_diff_class_weights);
        assert_eq!(a.row_diff_class_weights, b.row_diff_class_weights);
        assert_eq!(a.col_position_weights, b.col_position_weights);
    }

    #[test]
    fn test_classification_targets_require_rank_three() {
        let fo = IndexTensor::from_vec(vec![1, 0, 0, 1, 0, 0], &[2, 3]).unwrap();
        assert!(matches!(classification_targets(&fo), Err(VaeError::Core(_))));
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = vec![0.0f32; 2 * 4];
        let ce = CrossEntropy.mean(&logits, 4, &[0, 3], None, 0.1);
        assert!((ce - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy_label_smoothing_penalizes_confidence() {
        let logits = [10.0f32, 0.0, 0.0];
        let hard = CrossEntropy.mean(&logits, 3, &[0], None, 0.0);
        let smooth = CrossEntropy.mean(&logits, 3, &[0], None, 0.1);
        assert!(smooth > hard);
    }

    #[test]
    fn test_weighted_mean_divides_by_target_weights() {
        let logits = vec![0.0f32; 2 * 2];
        let weights = [1.0f32, 3.0];
        let per = CrossEntropy.per_position(&logits, 2, &[0, 1], Some(&weights), 0.0);
        let mean = CrossEntropy.mean(&logits, 2, &[0, 1], Some(&weights), 0.0);
        assert!((mean - (per[0] + per[1]) / 4.0).abs() < 1e-6);
        assert!((mean - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_focal_down_weights_easy_examples() {
        let easy = [8.0f32, 0.0];
        let hard = [0.0f32, 0.0];
        let ce_easy = CrossEntropy.mean(&easy, 2, &[0], None, 0.0);
        let focal_easy = FocalLoss::default().mean(&easy, 2, &[0], None, 0.0);
        assert!(focal_easy < ce_easy * 1e-2);
        let focal_hard = FocalLoss::default().mean(&hard, 2, &[0], None, 0.0);
        let expected = 0.25 * 2f32.ln();
        assert!((focal_hard - expected).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_target_contributes_nothing() {
        let logits = vec![0.0f32; 2 * 3];
        let per = CrossEntropy.per_position(&logits, 3, &[1, 7], None, 0.0);
        assert_eq!(per[1], 0.0);
        let mean = CrossEntropy.mean(&logits, 3, &[1, 7], None, 0.0);
        assert!((mean - 3f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_segment_loss_denominator() {
        // 5 valid segments × 6 coords = 30 elements; a single unit error.
        let fo = flag_offsets(&[[1, 1, 0, 0], [1, 1, 1, 0]]);
        let mut xs = Tensor::zeros(&[2, N_MAX, 30]);
        xs.data_mut()[0] = 1.0;
        let loss = segment_regression_loss(&Tensor::zeros(&[2, N_MAX, 6]), &xs, &segment_mask(&fo));
        assert!((loss - 1.0 / 30.0).abs() < 1e-7);
    }

    #[test]
    fn test_masked_positions_do_not_contribute() {
        let fo = flag_offsets(&[[1, 1, 0, 0]]);
        let mask = segment_mask(&fo);
        let xs = Tensor::zeros(&[1, N_MAX, 30]);
        let mut pred = Tensor::zeros(&[1, N_MAX, 6]);
        // Position 3 is padding.
        pred.data_mut()[3 * 6..4 * 6].iter_mut().for_each(|v| *v = 100.0);
        assert_eq!(segment_regression_loss(&pred, &xs, &mask), 0.0);
    }

    #[test]
    fn test_curve_latent_weighting() {
        let fo = flag_offsets(&[[1, 0, 0, 0]]);
        let mask = segment_mask(&fo);
        let mut xs = Tensor::zeros(&[1, N_MAX, 30]);
        // Spread 5.0 is clamped to 1.0.
        for c in 18..30 {
            xs.data_mut()[c] = 5.0;
        }
        let pred = Tensor::full(&[1, N_MAX, 12], 1.0);
        let expected = 1.2 - 0.5 * 2.7183f32.ln();
        assert!((curve_latent_loss(&pred, &xs, &mask) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_kl_zeroed_for_mode() {
        let moments = Tensor::full(&[1, 8, 4], 0.5);
        let post = DiagonalGaussian::from_moments(&moments).unwrap();
        assert_eq!(kl_divergence(&post, false), 0.0);
        assert!(kl_divergence(&post, true) > 0.0);
    }

    #[test]
    fn test_compute_concrete_scenario() {
        let loss = loss_fn();
        let fo = flag_offsets(&[[1, 1, 0, 0], [1, 1, 1, 0]]);
        let mut xs = Tensor::zeros(&[2, N_MAX, 30]);
        xs.data_mut()[0] = 1.0;
        let (total, c) = loss
            .compute(&zero_predictions(2), &xs, &fo, &zero_posterior(2), false)
            .unwrap();
        assert!((c.segment_mse_loss - 1.0 / 30.0).abs() < 1e-7);
        assert!((c.cls_ce_loss - (N_MAX as f32).ln()).abs() < 1e-5);
        // Uniform logits: ln(C) * ((1 - eps) * w_y + eps / C * sum(w)), target class 2 has w = 1.
        let eps = LossConfig::default().label_smoothing;
        let w_sum: f32 = loss.row_diff_class_weights.iter().sum();
        let expected_row = (ROW as f32).ln() * ((1.0 - eps) + eps / ROW as f32 * w_sum);
        assert!((c.row_diff_ce_loss - expected_row).abs() < 1e-5);
        assert_eq!(c.kl_loss, 0.0);
        assert_eq!(c.mu, 0.0);
        assert!((c.std - 1.0).abs() < 1e-6);
        assert!((total - loss.total(&c)).abs() < 1e-6);
    }

    #[test]
    fn test_compute_rejects_empty_item() {
        let loss = loss_fn();
        let fo = flag_offsets(&[[0, 0, 0, 0]]);
        let xs = Tensor::zeros(&[1, N_MAX, 30]);
        let err = loss
            .compute(&zero_predictions(1), &xs, &fo, &zero_posterior(1), false)
            .unwrap_err();
        assert_eq!(err, VaeError::EmptyWireframe { index: 0 });
    }

    #[test]
    fn test_column_loss_carries_position_weights() {
        let mut loss = loss_fn();
        let fo = flag_offsets(&[[1, 1, 0, 0], [1, 1, 1, 0]]);
        let xs = Tensor::zeros(&[2, N_MAX, 30]);
        let (_, c) = loss
            .compute(&zero_predictions(2), &xs, &fo, &zero_posterior(2), false)
            .unwrap();

        // Every position has column target 1 under uniform logits.
        let eps = loss.config.label_smoothing;
        let ce = CrossEntropy.per_position(&[0.0; COL], COL, &[1], Some(&loss.col_diff_class_weights), eps)[0];
        let w = &loss.col_position_weights;
        let expected_col = ce * (2.0 * w[0] + 2.0 * w[1] + w[2]) / 5.0;
        assert!((c.col_diff_ce_loss - expected_col).abs() < 1e-5);

        // Flattening the position table moves the column loss only.
        loss.col_position_weights = vec![1.0; N_MAX];
        let (_, flat) = loss
            .compute(&zero_predictions(2), &xs, &fo, &zero_posterior(2), false)
            .unwrap();
        assert!((flat.col_diff_ce_loss - ce).abs() < 1e-5);
        assert!((flat.col_diff_ce_loss - c.col_diff_ce_loss).abs() > 1e-3);
        assert_eq!(flat.row_diff_ce_loss, c.row_diff_ce_loss);
    }

    #[test]
    fn test_compute_rejects_mismatched_predictions() {
        let loss = loss_fn();
        let fo = flag_offsets(&[[1, 1, 0, 0]]);
        let xs = Tensor::zeros(&[1, N_MAX, 30]);
        let post = zero_posterior(1);

        let wide_offsets = Predictions {
            offsets: Tensor::zeros(&[1, N_MAX, 38]),
            ..zero_predictions(1)
        };
        assert!(matches!(
            loss.compute(&wide_offsets, &xs, &fo, &post, false),
            Err(VaeError::Core(_))
        ));

        let short_segments = Predictions {
            segments: Tensor::zeros(&[1, 2, 6]),
            ..zero_predictions(1)
        };
        assert!(loss.compute(&short_segments, &xs, &fo, &post, false).is_err());

        let narrow_latent = Predictions {
            curve_latent: Tensor::zeros(&[1, N_MAX, 6]),
            ..zero_predictions(1)
        };
        assert!(loss.compute(&narrow_latent, &xs, &fo, &post, false).is_err());
    }

    #[test]
    fn test_total_applies_weights() {
        let loss = WireframeLoss::new(
            LossConfig {
                cls_loss_weight: 2.0,
                kl_loss_weight: 0.5,
                ..LossConfig::default()
            },
            N_MAX,
            COL,
            ROW,
        );
        let c = LossComponents {
            cls_ce_loss: 1.0,
            segment_mse_loss: 1.0,
            col_diff_ce_loss: 1.0,
            row_diff_ce_loss: 1.0,
            curve_latent_loss: 1.0,
            kl_loss: 4.0,
            ..LossComponents::default()
        };
        assert!((loss.total(&c) - 8.0).abs() < 1e-6);
    }
}
