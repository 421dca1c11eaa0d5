//! Pre-norm transformer stacks: self-attention and cross-attention.
//!
//! Each layer is `x + Attn(LN(x))` followed by `x + FFN(LN(x))`; a stack
//! ends with a final LayerNorm. Cross-attention layers read keys and values
//! from an external context and accept an optional per-position context mask.

use wirevae_core::{prefixed, prefixed_mut, Parameterized, Tensor};

use crate::config::AttentionConfig;
use crate::nn::{FeedForward, LayerNorm, Linear};

/// Multi-head scaled dot-product attention with separate query and key/value inputs.
pub struct Attention {
    pub to_q: Linear,
    /// Fused key/value projection: (2 * dim, dim)
    pub to_kv: Linear,
    pub to_out: Linear,
    pub dim: usize,
    pub n_heads: usize,
    pub head_dim: usize,
}

impl Attention {
    pub fn new(dim: usize, n_heads: usize) -> Self {
        Self {
            to_q: Linear::new(dim, dim),
            to_kv: Linear::new(dim, 2 * dim),
            to_out: Linear::new(dim, dim),
            dim,
            n_heads,
            head_dim: dim / n_heads,
        }
    }

    /// Forward.
    ///
    /// - `x`: queries, (batch, n_q, dim)
    /// - `context`: keys/values, (batch, n_k, dim)
    /// - `mask`: optional (batch, n_k), `true` = may be attended
    ///
    /// A query row whose context is fully masked receives a zero update.
    pub fn forward(
        &self,
        x: &[f32],
        context: &[f32],
        batch: usize,
        n_q: usize,
        n_k: usize,
        mask: Option<&[bool]>,
    ) -> Vec<f32> {
        let dm = self.dim;
        let hd = self.head_dim;
        let scale = 1.0 / (hd as f32).sqrt();

        let q = self.to_q.forward_flat(x, batch * n_q);
        let kv = self.to_kv.forward_flat(context, batch * n_k);

        let mut attn_out = vec![0.0f32; batch * n_q * dm];
        let mut scores = vec![0.0f32; n_k];

        for b in 0..batch {
            let valid = |ki: usize| mask.map_or(true, |m| m[b * n_k + ki]);
            if !(0..n_k).any(valid) {
                continue;
            }
            for h in 0..self.n_heads {
                for qi in 0..n_q {
                    let q_off = (b * n_q + qi) * dm + h * hd;
                    let mut max_val = f32::NEG_INFINITY;
                    for ki in 0..n_k {
                        if !valid(ki) {
                            scores[ki] = f32::NEG_INFINITY;
                            continue;
                        }
                        let k_off = (b * n_k + ki) * 2 * dm + h * hd;
                        let mut dot = 0.0f32;
                        for d in 0..hd {
                            dot += q[q_off + d] * kv[k_off + d];
                        }
                        scores[ki] = dot * scale;
                        max_val = max_val.max(scores[ki]);
                    }

                    let mut sum = 0.0f32;
                    for s in scores.iter_mut() {
                        *s = if s.is_finite() { (*s - max_val).exp() } else { 0.0 };
                        sum += *s;
                    }

                    for ki in 0..n_k {
                        let p = scores[ki] / sum;
                        if p == 0.0 {
                            continue;
                        }
                        let v_off = (b * n_k + ki) * 2 * dm + dm + h * hd;
                        for d in 0..hd {
                            attn_out[q_off + d] += p * kv[v_off + d];
                        }
                    }
                }
            }
        }

        let mut out = self.to_out.forward_flat(&attn_out, batch * n_q);
        // Fully masked items keep a zero update instead of the output bias.
        if let Some(m) = mask {
            for b in 0..batch {
                if !m[b * n_k..(b + 1) * n_k].iter().any(|&v| v) {
                    out[b * n_q * dm..(b + 1) * n_q * dm].fill(0.0);
                }
            }
        }
        out
    }
}

impl Parameterized for Attention {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("to_q", self.to_q.named_parameters());
        params.extend(prefixed("to_kv", self.to_kv.named_parameters()));
        params.extend(prefixed("to_out", self.to_out.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("to_q", self.to_q.named_parameters_mut());
        params.extend(prefixed_mut("to_kv", self.to_kv.named_parameters_mut()));
        params.extend(prefixed_mut("to_out", self.to_out.named_parameters_mut()));
        params
    }
}

/// One pre-norm block: LayerNorm → attention → residual → LayerNorm → FFN → residual.
pub struct AttentionLayer {
    pub norm1: LayerNorm,
    pub attn: Attention,
    pub norm2: LayerNorm,
    pub ffn: FeedForward,
}

impl AttentionLayer {
    pub fn new(config: &AttentionConfig) -> Self {
        Self {
            norm1: LayerNorm::new(config.dim),
            attn: Attention::new(config.dim, config.heads),
            norm2: LayerNorm::new(config.dim),
            ffn: FeedForward::new(config.dim, config.dim * config.ff_mult),
        }
    }

    /// `context = None` attends over the normalized input itself.
    fn forward(
        &self,
        x: &[f32],
        batch: usize,
        n_q: usize,
        context: Option<(&[f32], usize, Option<&[bool]>)>,
    ) -> Vec<f32> {
        let n = batch * n_q;
        let normed1 = self.norm1.forward_flat(x, n);
        let attn_out = match context {
            Some((ctx, n_k, mask)) => self.attn.forward(&normed1, ctx, batch, n_q, n_k, mask),
            None => self.attn.forward(&normed1, &normed1, batch, n_q, n_q, None),
        };
        let mut residual: Vec<f32> = x.iter().zip(attn_out.iter()).map(|(a, b)| a + b).collect();

        let normed2 = self.norm2.forward_flat(&residual, n);
        let ffn_out = self.ffn.forward_flat(&normed2, n);
        for (r, f) in residual.iter_mut().zip(ffn_out.iter()) {
            *r += f;
        }
        residual
    }
}

impl Parameterized for AttentionLayer {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = prefixed("norm1", self.norm1.named_parameters());
        params.extend(prefixed("attn", self.attn.named_parameters()));
        params.extend(prefixed("norm2", self.norm2.named_parameters()));
        params.extend(prefixed("ffn", self.ffn.named_parameters()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = prefixed_mut("norm1", self.norm1.named_parameters_mut());
        params.extend(prefixed_mut("attn", self.attn.named_parameters_mut()));
        params.extend(prefixed_mut("norm2", self.norm2.named_parameters_mut()));
        params.extend(prefixed_mut("ffn", self.ffn.named_parameters_mut()));
        params
    }
}

fn stack_parameters<'a>(layers: &'a [AttentionLayer], final_norm: &'a LayerNorm) -> Vec<(String, &'a Tensor)> {
    let mut params = Vec::new();
    for (i, layer) in layers.iter().enumerate() {
        params.extend(prefixed(&format!("layers.{i}"), layer.named_parameters()));
    }
    params.extend(prefixed("final_norm", final_norm.named_parameters()));
    params
}

fn stack_parameters_mut<'a>(
    layers: &'a mut [AttentionLayer],
    final_norm: &'a mut LayerNorm,
) -> Vec<(String, &'a mut Tensor)> {
    let mut params = Vec::new();
    for (i, layer) in layers.iter_mut().enumerate() {
        params.extend(prefixed_mut(&format!("layers.{i}"), layer.named_parameters_mut()));
    }
    params.extend(prefixed_mut("final_norm", final_norm.named_parameters_mut()));
    params
}

/// Stack of self-attention layers.
pub struct SelfAttender {
    pub layers: Vec<AttentionLayer>,
    pub final_norm: LayerNorm,
}

impl SelfAttender {
    pub fn new(config: &AttentionConfig, depth: usize) -> Self {
        Self {
            layers: (0..depth).map(|_| AttentionLayer::new(config)).collect(),
            final_norm: LayerNorm::new(config.dim),
        }
    }

    /// Forward: (batch, seq_len, dim) → same shape.
    pub fn forward(&self, x: &[f32], batch: usize, seq_len: usize) -> Vec<f32> {
        let mut hidden = x.to_vec();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, batch, seq_len, None);
        }
        self.final_norm.forward_flat(&hidden, batch * seq_len)
    }
}

impl Parameterized for SelfAttender {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        stack_parameters(&self.layers, &self.final_norm)
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        stack_parameters_mut(&mut self.layers, &mut self.final_norm)
    }
}

/// Stack of cross-attention layers (no self-attention between queries).
pub struct CrossAttender {
    pub layers: Vec<AttentionLayer>,
    pub final_norm: LayerNorm,
}

impl CrossAttender {
    pub fn new(config: &AttentionConfig, depth: usize) -> Self {
        Self {
            layers: (0..depth).map(|_| AttentionLayer::new(config)).collect(),
            final_norm: LayerNorm::new(config.dim),
        }
    }

    /// Forward: queries (batch, n_q, dim) against context (batch, n_k, dim).
    pub fn forward(
        &self,
        x: &[f32],
        context: &[f32],
        batch: usize,
        n_q: usize,
        n_k: usize,
        context_mask: Option<&[bool]>,
    ) -> Vec<f32> {
        let mut hidden = x.to_vec();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, batch, n_q, Some((context, n_k, context_mask)));
        }
        self.final_norm.forward_flat(&hidden, batch * n_q)
    }
}

impl Parameterized for CrossAttender {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        stack_parameters(&self.layers, &self.final_norm)
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        stack_parameters_mut(&mut self.layers, &mut self.final_norm)
    }
}
