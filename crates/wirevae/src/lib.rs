//! # wirevae
//!
//! KL-regularized variational autoencoder for 3-D wireframes.
//!
//! A wireframe is a padded set of line segments; each segment carries two
//! endpoints, a 12-dim curve latent (mean and spread) and a discrete
//! column/row offset pair. The model compresses the set into a fixed-length
//! latent sequence and reconstructs it.
//!
//! ## Architecture
//!
//! - **Encoder**: Fourier point, offset and latent embeddings pooled into
//!   `wireframe_latent_num` tokens by cross-attention
//! - **Posterior**: diagonal Gaussian over `(latent_channels, wireframe_latent_num)`
//! - **Decoder**: self-attention over the latents, then cross-attention from
//!   `1 + max_curves_num` learnable queries
//! - **Heads**: linear or MLP predictions for count, coordinates, offsets
//!   and curve latents
//! - **Loss**: five task terms plus KL
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wirevae::{AutoencoderKlWireframe, ForwardOptions, ForwardOutput, IndexTensor, Tensor, WireframeVaeConfig};
//!
//! let config = WireframeVaeConfig::tiny();
//! let model = AutoencoderKlWireframe::new(config.clone()).unwrap();
//!
//! let n = config.max_curves_num;
//! let xs = Tensor::randn(&[1, n, 30]);
//! let flag_offsets = IndexTensor::from_vec(vec![1, 0, 0].repeat(n), &[1, n, 3]).unwrap();
//! let options = ForwardOptions { sample_posterior: true, return_loss: true };
//! if let ForwardOutput::Loss { total, components } = model.forward(&xs, &flag_offsets, options, None).unwrap() {
//!     println!("loss {total} (kl {})", components.kl_loss);
//! }
//! ```

pub mod attention;
pub mod config;
pub mod decoder;
pub mod embed;
pub mod encoder;
pub mod error;
pub mod heads;
pub mod loader;
pub mod loss;
pub mod nn;
pub mod posterior;
pub mod vae;

pub use config::{
    AttentionConfig, CriterionKind, DecoderConfig, EncoderConfig, HeadStrategy, LossConfig, WireframeVaeConfig,
};
pub use decoder::WireframeDecoder;
pub use encoder::{segment_mask, WireframeEncoder};
pub use error::{Result, VaeError};
pub use heads::{LinearHead, MlpHead, PredictionHead, Predictions};
pub use loader::{load_config, load_safetensors, load_state_dict, save_config, save_state_dict, LoadError};
pub use loss::{Criterion, CrossEntropy, FocalLoss, LossComponents, WireframeLoss};
pub use posterior::DiagonalGaussian;
pub use vae::{
    AutoencoderKlWireframe, AutoencoderKlWireframeFastDecode, AutoencoderKlWireframeFastEncode, DecoderOutput,
    EncoderOutput, ForwardOptions, ForwardOutput,
};
pub use wirevae_core::{Dim, IndexTensor, Module, Parameterized, Shape, Tensor};
