use std::collections::HashMap;

use crate::{Result, Tensor};

/// Anything that owns named, trainable tensors.
pub trait Parameterized {
    /// Named parameters, using dotted paths (for state_dict).
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable named parameters (for weight loading).
    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)>;

    /// Set training/eval mode.
    fn train(&mut self, _mode: bool) {}

    /// Whether the module is in training mode.
    fn is_training(&self) -> bool {
        false
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    /// Total number of scalar parameters.
    fn param_count(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }

    /// Export state dictionary.
    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.clone()))
            .collect()
    }
}

/// A layer with a single tensor input, applied over the last axis.
pub trait Module: Parameterized + Send + Sync {
    fn forward(&self, input: &Tensor) -> Result<Tensor>;
}

/// Namespace a child's parameters under `prefix`.
pub fn prefixed<'a>(prefix: &str, params: Vec<(String, &'a Tensor)>) -> Vec<(String, &'a Tensor)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}

/// Mutable counterpart of [`prefixed`].
pub fn prefixed_mut<'a>(
    prefix: &str,
    params: Vec<(String, &'a mut Tensor)>,
) -> Vec<(String, &'a mut Tensor)> {
    params
        .into_iter()
        .map(|(name, t)| (format!("{prefix}.{name}"), t))
        .collect()
}
