//! Segment-set encoder: per-segment embeddings pooled into a fixed number of
//! latent tokens by cross-attention against a learnable query bank.

use tracing::{debug, warn};

use wirevae_core::{prefixed, prefixed_mut, Dim, IndexTensor, Parameterized, Tensor};

use crate::attention::CrossAttender;
use crate::config::{EncoderConfig, CURVE_LATENT_CHANNELS, ENCODER_INPUT_CHANNELS, FLAG_OFFSET_CHANNELS, SEGMENT_COORDS};
use crate::embed::{PointEmbed, POINT_FOURIER_DIM};
use crate::error::Result;
use crate::nn::{Embedding, Linear};

/// Validity of each segment slot: flag channel > 0.5.
///
/// `flag_offsets` is (batch, n_segments, 3); returns (batch * n_segments).
pub fn segment_mask(flag_offsets: &IndexTensor) -> Vec<bool> {
    flag_offsets
        .data()
        .chunks_exact(FLAG_OFFSET_CHANNELS)
        .map(|row| row[0] as f32 > 0.5)
        .collect()
}

/// Wireframe encoder.
///
/// Segments → (point, offset, latent) embeddings → `attn_project_in` + positional
/// bias → cross-attention pooling → `project_out`.
pub struct WireframeEncoder {
    pub config: EncoderConfig,
    pub point_embed: PointEmbed,
    pub col_diff_embed: Embedding,
    pub row_diff_embed: Embedding,
    /// Curve latent embedding: 12 → curve_latent_embed_dim.
    pub latent_embed: Linear,
    /// Learnable query bank: (wireframe_latent_num, attn_dim)
    pub enc_learnable_queries: Tensor,
    /// Per-slot positional bias: (max_curves_num, attn_dim)
    pub pos_emb: Tensor,
    pub attn_project_in: Linear,
    pub cross_attn: CrossAttender,
    pub project_out: Linear,
}

impl WireframeEncoder {
    /// `config` must come from a validated [`WireframeVaeConfig`](crate::config::WireframeVaeConfig).
    pub(crate) fn new(config: EncoderConfig) -> Self {
        let dim = config.attn.dim;
        let point_embed = PointEmbed::new(POINT_FOURIER_DIM, config.coor_embed_dim * 3);
        let col_diff_embed = Embedding::new(config.max_col_diff, config.col_diff_embed_dim);
        let row_diff_embed = Embedding::new(config.max_row_diff, config.row_diff_embed_dim);
        let latent_embed = Linear::new(CURVE_LATENT_CHANNELS, config.curve_latent_embed_dim);
        let enc_learnable_queries = Tensor::randn(&[config.wireframe_latent_num, dim]);
        let pos_emb = Tensor::randn(&[config.max_curves_num, dim]);
        let attn_project_in = Linear::new(config.init_dim(), dim);
        let cross_attn = CrossAttender::new(&config.attn, config.depth);
        let project_out = Linear::new(dim, config.out_channels());

        Self {
            config,
            point_embed,
            col_diff_embed,
            row_diff_embed,
            latent_embed,
            enc_learnable_queries,
            pos_emb,
            attn_project_in,
            cross_attn,
            project_out,
        }
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `xs`: (batch, n_segments, ≥18) — 6 coordinates then 12 latent channels;
    ///   extra trailing channels are ignored
    /// - `flag_offsets`: (batch, n_segments, 3) — flag, column offset, row offset
    ///
    /// # Returns
    /// (batch, wireframe_latent_num, out_channels)
    pub fn forward(&self, xs: &Tensor, flag_offsets: &IndexTensor) -> Result<Tensor> {
        let cfg = &self.config;
        xs.expect(
            "xs",
            &[Dim::Any, Dim::AtMost(cfg.max_curves_num), Dim::AtLeast(ENCODER_INPUT_CHANNELS)],
        )?;
        let batch = xs.dims()[0];
        let n_seg = xs.dims()[1];
        let channels = xs.dims()[2];
        flag_offsets.expect("flag_offsets", &[Dim::Is(batch), Dim::Is(n_seg), Dim::Is(FLAG_OFFSET_CHANNELS)])?;

        let dim = cfg.attn.dim;
        let n = batch * n_seg;
        let data = xs.data();
        let fo = flag_offsets.data();

        // 1) Point embeddings: each segment is two 3-D endpoints.
        let mut points = Vec::with_capacity(n * SEGMENT_COORDS);
        let mut latents = Vec::with_capacity(n * CURVE_LATENT_CHANNELS);
        for i in 0..n {
            let row = &data[i * channels..(i + 1) * channels];
            points.extend_from_slice(&row[..SEGMENT_COORDS]);
            latents.extend_from_slice(&row[SEGMENT_COORDS..ENCODER_INPUT_CHANNELS]);
        }
        let coor_embed = self.point_embed.forward_flat(&points, 2 * n);
        let coor_width = 2 * self.point_embed.dim;

        // 2) Offset embeddings.
        let col_embed = self
            .col_diff_embed
            .lookup((0..n).map(|i| fo[i * FLAG_OFFSET_CHANNELS + 1]));
        let row_embed = self
            .row_diff_embed
            .lookup((0..n).map(|i| fo[i * FLAG_OFFSET_CHANNELS + 2]));

        // 3) Curve latent embedding.
        let latent_embed = self.latent_embed.forward_flat(&latents, n);

        // 4) Concatenate and project to the attention width.
        let parts: [(&[f32], usize); 4] = [
            (coor_embed.as_slice(), coor_width),
            (col_embed.as_slice(), cfg.col_diff_embed_dim),
            (row_embed.as_slice(), cfg.row_diff_embed_dim),
            (latent_embed.as_slice(), cfg.curve_latent_embed_dim),
        ];
        let init_dim = cfg.init_dim();
        let mut wire_embed = Vec::with_capacity(n * init_dim);
        for i in 0..n {
            for (buf, w) in parts.iter() {
                wire_embed.extend_from_slice(&buf[i * w..(i + 1) * w]);
            }
        }
        let mut wire_embed = self.attn_project_in.forward_flat(&wire_embed, n);

        let pos = self.pos_emb.data();
        for b in 0..batch {
            for s in 0..n_seg {
                let dst = (b * n_seg + s) * dim;
                for d in 0..dim {
                    wire_embed[dst + d] += pos[s * dim + d];
                }
            }
        }

        // 5) Broadcast the learnable query bank.
        let n_lat = cfg.wireframe_latent_num;
        let queries = self.enc_learnable_queries.data();
        let mut query_embed = Vec::with_capacity(batch * n_lat * dim);
        for _ in 0..batch {
            query_embed.extend_from_slice(queries);
        }

        // 6) Cross-attention, padded segments excluded from the context.
        let mask = segment_mask(flag_offsets);
        let valid = mask.iter().filter(|&&v| v).count();
        debug!(batch, segments = n_seg, valid, "encoding wireframes");
        for b in 0..batch {
            if !mask[b * n_seg..(b + 1) * n_seg].iter().any(|&v| v) {
                warn!(index = b, "wireframe has no valid segments; latent tokens carry no segment information");
            }
        }
        let pooled = self
            .cross_attn
            .forward(&query_embed, &wire_embed, batch, n_lat, n_seg, Some(&mask));

        // 7) Project out.
        let out = self.project_out.forward_flat(&pooled, batch * n_lat);
        Ok(Tensor::from_vec(out, &[batch, n_lat, cfg.out_channels()])?)
    }
}

impl Parameterized for WireframeEncoder {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("point_embed", self.point_embed.named_parameters());
        params.extend(prefixed("col_diff_embed", self.col_diff_embed.named_parameters()));
        params.extend(prefixed("row_diff_embed", self.row_diff_embed.named_parameters()));
        params.extend(prefixed("latent_embed", self.latent_embed.named_parameters()));
        params.push(("enc_learnable_queries".into(), &self.enc_learnable_queries));
        params.push(("pos_emb".into(), &self.pos_emb));
        params.extend(prefixed("attn_project_in", self.attn_project_in.named_parameters()));
        params.extend(prefixed("cross_attn", self.cross_attn.named_parameters()));
        params.extend(prefixed("project_out", self.project_out.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("point_embed", self.point_embed.named_parameters_mut());
        params.extend(prefixed_mut("col_diff_embed", self.col_diff_embed.named_parameters_mut()));
        params.extend(prefixed_mut("row_diff_embed", self.row_diff_embed.named_parameters_mut()));
        params.extend(prefixed_mut("latent_embed", self.latent_embed.named_parameters_mut()));
        params.push(("enc_learnable_queries".into(), &mut self.enc_learnable_queries));
        params.push(("pos_emb".into(), &mut self.pos_emb));
        params.extend(prefixed_mut("attn_project_in", self.attn_project_in.named_parameters_mut()));
        params.extend(prefixed_mut("cross_attn", self.cross_attn.named_parameters_mut()));
        params.extend(prefixed_mut("project_out", self.project_out.named_parameters_mut()));
        params
    }
}
