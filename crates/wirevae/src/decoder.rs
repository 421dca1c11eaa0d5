//! Latent-sequence decoder: self-attention over the latent tokens, then
//! cross-attention from `1 + max_curves_num` learnable queries.

use tracing::debug;

use wirevae_core::{prefixed, prefixed_mut, Dim, Parameterized, Tensor};

use crate::attention::{CrossAttender, SelfAttender};
use crate::config::DecoderConfig;
use crate::error::Result;
use crate::nn::Linear;

/// Wireframe decoder.
///
/// Output slot 0 is the classification token; slots `1..=max_curves_num` are
/// per-segment feature tokens.
pub struct WireframeDecoder {
    pub config: DecoderConfig,
    pub proj_in: Linear,
    /// Optional per-slot latent positional bias: (wireframe_latent_num, attn_dim)
    pub pos_emb: Option<Tensor>,
    /// Learnable query bank: (1 + max_curves_num, attn_dim)
    pub dec_learnable_query: Tensor,
    pub self_attn: SelfAttender,
    pub cross_attn: CrossAttender,
    pub proj_out: Linear,
}

impl WireframeDecoder {
    /// `config` must come from a validated [`WireframeVaeConfig`](crate::config::WireframeVaeConfig).
    pub(crate) fn new(config: DecoderConfig) -> Self {
        let dim = config.attn.dim;
        let proj_in = Linear::new(config.latent_channels, dim);
        let pos_emb = config
            .use_latent_pos_emb
            .then(|| Tensor::randn(&[config.wireframe_latent_num, dim]));
        let dec_learnable_query = Tensor::randn(&[config.num_queries(), dim]);
        let self_attn = SelfAttender::new(&config.attn, config.self_depth);
        let cross_attn = CrossAttender::new(&config.attn, config.cross_depth);
        let proj_out = Linear::new(dim, dim);

        Self {
            config,
            proj_in,
            pos_emb,
            dec_learnable_query,
            self_attn,
            cross_attn,
            proj_out,
        }
    }

    /// Forward: (batch, wireframe_latent_num, latent_channels) → (batch, 1 + max_curves_num, attn_dim)
    pub fn forward(&self, zs: &Tensor) -> Result<Tensor> {
        let cfg = &self.config;
        zs.expect(
            "zs",
            &[Dim::Any, Dim::Is(cfg.wireframe_latent_num), Dim::Is(cfg.latent_channels)],
        )?;
        let batch = zs.dims()[0];
        let n_lat = cfg.wireframe_latent_num;
        let dim = cfg.attn.dim;
        debug!(batch, latents = n_lat, "decoding wireframe latents");

        let mut latent = self.proj_in.forward_flat(zs.data(), batch * n_lat);
        if let Some(pos) = &self.pos_emb {
            let pos = pos.data();
            for b in 0..batch {
                let block = &mut latent[b * n_lat * dim..(b + 1) * n_lat * dim];
                for (v, p) in block.iter_mut().zip(pos) {
                    *v += p;
                }
            }
        }

        let latent = self.self_attn.forward(&latent, batch, n_lat);

        let n_q = cfg.num_queries();
        let mut queries = Vec::with_capacity(batch * n_q * dim);
        for _ in 0..batch {
            queries.extend_from_slice(self.dec_learnable_query.data());
        }
        let queries = self.cross_attn.forward(&queries, &latent, batch, n_q, n_lat, None);

        let out = self.proj_out.forward_flat(&queries, batch * n_q);
        Ok(Tensor::from_vec(out, &[batch, n_q, dim])?)
    }
}

impl Parameterized for WireframeDecoder {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("proj_in", self.proj_in.named_parameters());
        if let Some(pos) = &self.pos_emb {
            params.push(("pos_emb".into(), pos));
        }
        params.push(("dec_learnable_query".into(), &self.dec_learnable_query));
        params.extend(prefixed("self_attn", self.self_attn.named_parameters()));
        params.extend(prefixed("cross_attn", self.cross_attn.named_parameters()));
        params.extend(prefixed("proj_out", self.proj_out.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("proj_in", self.proj_in.named_parameters_mut());
        if let Some(pos) = &mut self.pos_emb {
            params.push(("pos_emb".into(), pos));
        }
        params.push(("dec_learnable_query".into(), &mut self.dec_learnable_query));
        params.extend(prefixed_mut("self_attn", self.self_attn.named_parameters_mut()));
        params.extend(prefixed_mut("cross_attn", self.cross_attn.named_parameters_mut()));
        params.extend(prefixed_mut("proj_out", self.proj_out.named_parameters_mut()));
        params
    }
}
