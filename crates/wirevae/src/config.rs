//! Configuration structs for the wireframe autoencoder.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaeError};

/// Width of the segment coordinate block (two interleaved 3-vectors).
pub const SEGMENT_COORDS: usize = 6;
/// Width of the per-segment auxiliary latent code (mean half).
pub const CURVE_LATENT_CHANNELS: usize = 12;
/// Channels the encoder reads: coordinates + latent mean.
pub const ENCODER_INPUT_CHANNELS: usize = SEGMENT_COORDS + CURVE_LATENT_CHANNELS;
/// Channels of a full training segment tensor: coordinates + latent mean + latent spread.
pub const SEGMENT_CHANNELS: usize = SEGMENT_COORDS + 2 * CURVE_LATENT_CHANNELS;
/// Channels of the flag/offset tensor: validity flag, column offset, row offset.
pub const FLAG_OFFSET_CHANNELS: usize = 3;

/// Attention stack width settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub dim: usize,
    pub heads: usize,
    /// Feed-forward hidden width as a multiple of `dim`.
    pub ff_mult: usize,
}

impl AttentionConfig {
    pub fn head_dim(&self) -> usize {
        self.dim / self.heads
    }
}

/// Segment-set encoder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Latent channels per latent token (`2x` when `double_z`).
    pub latent_channels: usize,
    /// Per-axis point embedding width; each point embeds to `3 * coor_embed_dim`.
    pub coor_embed_dim: usize,
    pub max_col_diff: usize,
    pub max_row_diff: usize,
    pub col_diff_embed_dim: usize,
    pub row_diff_embed_dim: usize,
    pub max_curves_num: usize,
    pub curve_latent_embed_dim: usize,
    /// Number of cross-attention layers.
    pub depth: usize,
    pub attn: AttentionConfig,
    /// Emit mean and log-variance in one pass.
    pub double_z: bool,
    pub wireframe_latent_num: usize,
}

impl EncoderConfig {
    /// Width of the concatenated per-segment feature before `attn_project_in`.
    pub fn init_dim(&self) -> usize {
        self.coor_embed_dim * SEGMENT_COORDS
            + self.col_diff_embed_dim
            + self.row_diff_embed_dim
            + self.curve_latent_embed_dim
    }

    pub fn out_channels(&self) -> usize {
        if self.double_z {
            2 * self.latent_channels
        } else {
            self.latent_channels
        }
    }
}

/// Latent-sequence decoder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub latent_channels: usize,
    pub attn: AttentionConfig,
    pub self_depth: usize,
    pub cross_depth: usize,
    pub max_curves_num: usize,
    pub wireframe_latent_num: usize,
    pub use_latent_pos_emb: bool,
}

impl DecoderConfig {
    /// Output tokens: one classification token plus one per segment slot.
    pub fn num_queries(&self) -> usize {
        1 + self.max_curves_num
    }
}

/// Prediction head strategy, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadStrategy {
    /// One linear layer for the class token, one sliced linear layer for segment tokens.
    Linear,
    /// Four independent feed-forward heads.
    Mlp,
}

/// Classification criterion, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum CriterionKind {
    CrossEntropy,
    Focal { gamma: f32 },
}

/// Loss weights and classification settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub label_smoothing: f32,
    pub cls_loss_weight: f32,
    pub segment_loss_weight: f32,
    pub col_diff_loss_weight: f32,
    pub row_diff_loss_weight: f32,
    pub curve_latent_loss_weight: f32,
    pub kl_loss_weight: f32,
    pub criterion: CriterionKind,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            label_smoothing: 0.005,
            cls_loss_weight: 1.0,
            segment_loss_weight: 1.0,
            col_diff_loss_weight: 1.0,
            row_diff_loss_weight: 1.0,
            curve_latent_loss_weight: 1.0,
            kl_loss_weight: 2e-4,
            criterion: CriterionKind::CrossEntropy,
        }
    }
}

/// Top-level wireframe autoencoder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireframeVaeConfig {
    pub latent_channels: usize,
    pub max_col_diff: usize,
    pub max_row_diff: usize,
    pub attn_encoder_depth: usize,
    pub attn_decoder_self_depth: usize,
    pub attn_decoder_cross_depth: usize,
    pub attn_dim: usize,
    pub num_heads: usize,
    pub ff_mult: usize,
    pub max_curves_num: usize,
    pub wireframe_latent_num: usize,
    pub coor_embed_dim: usize,
    pub col_diff_embed_dim: usize,
    pub row_diff_embed_dim: usize,
    pub curve_latent_embed_dim: usize,
    pub head: HeadStrategy,
    /// Hidden width multiplier of the MLP heads.
    pub mlp_expansion_factor: f32,
    /// Dropout of the classification and offset MLP heads.
    pub mlp_dropout: f32,
    pub use_latent_pos_emb: bool,
    pub loss: LossConfig,
}

impl Default for WireframeVaeConfig {
    fn default() -> Self {
        Self {
            latent_channels: 8,
            max_col_diff: 6,
            max_row_diff: 32,
            attn_encoder_depth: 4,
            attn_decoder_self_depth: 6,
            attn_decoder_cross_depth: 2,
            attn_dim: 512,
            num_heads: 8,
            ff_mult: 4,
            max_curves_num: 128,
            wireframe_latent_num: 64,
            coor_embed_dim: 128,
            col_diff_embed_dim: 16,
            row_diff_embed_dim: 32,
            curve_latent_embed_dim: 256,
            head: HeadStrategy::Linear,
            mlp_expansion_factor: 1.0,
            mlp_dropout: 0.1,
            use_latent_pos_emb: false,
            loss: LossConfig::default(),
        }
    }
}

impl WireframeVaeConfig {
    /// Tiny preset for unit tests.
    pub fn tiny() -> Self {
        Self {
            latent_channels: 4,
            max_col_diff: 3,
            max_row_diff: 5,
            attn_encoder_depth: 1,
            attn_decoder_self_depth: 1,
            attn_decoder_cross_depth: 1,
            attn_dim: 16,
            num_heads: 2,
            ff_mult: 2,
            max_curves_num: 4,
            wireframe_latent_num: 8,
            coor_embed_dim: 4,
            col_diff_embed_dim: 4,
            row_diff_embed_dim: 4,
            curve_latent_embed_dim: 8,
            ..Self::default()
        }
    }

    pub fn attention(&self) -> AttentionConfig {
        AttentionConfig {
            dim: self.attn_dim,
            heads: self.num_heads,
            ff_mult: self.ff_mult,
        }
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            latent_channels: self.latent_channels,
            coor_embed_dim: self.coor_embed_dim,
            max_col_diff: self.max_col_diff,
            max_row_diff: self.max_row_diff,
            col_diff_embed_dim: self.col_diff_embed_dim,
            row_diff_embed_dim: self.row_diff_embed_dim,
            max_curves_num: self.max_curves_num,
            curve_latent_embed_dim: self.curve_latent_embed_dim,
            depth: self.attn_encoder_depth,
            attn: self.attention(),
            double_z: true,
            wireframe_latent_num: self.wireframe_latent_num,
        }
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            latent_channels: self.latent_channels,
            attn: self.attention(),
            self_depth: self.attn_decoder_self_depth,
            cross_depth: self.attn_decoder_cross_depth,
            max_curves_num: self.max_curves_num,
            wireframe_latent_num: self.wireframe_latent_num,
            use_latent_pos_emb: self.use_latent_pos_emb,
        }
    }

    /// Width of the sliced linear feature head: coords + offset logits + latent.
    pub fn feature_width(&self) -> usize {
        SEGMENT_COORDS + self.max_col_diff + self.max_row_diff + CURVE_LATENT_CHANNELS
    }

    /// Reject configurations the model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("latent_channels", self.latent_channels),
            ("max_col_diff", self.max_col_diff),
            ("max_row_diff", self.max_row_diff),
            ("attn_dim", self.attn_dim),
            ("num_heads", self.num_heads),
            ("ff_mult", self.ff_mult),
            ("max_curves_num", self.max_curves_num),
            ("wireframe_latent_num", self.wireframe_latent_num),
            ("coor_embed_dim", self.coor_embed_dim),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(VaeError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.attn_dim % self.num_heads != 0 {
            return Err(VaeError::InvalidConfig(format!(
                "attn_dim ({}) must be divisible by num_heads ({})",
                self.attn_dim, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.loss.label_smoothing) {
            return Err(VaeError::InvalidConfig(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.loss.label_smoothing
            )));
        }
        if !(0.0..1.0).contains(&self.mlp_dropout) {
            return Err(VaeError::InvalidConfig(format!(
                "mlp_dropout must be in [0, 1), got {}",
                self.mlp_dropout
            )));
        }
        Ok(())
    }
}
