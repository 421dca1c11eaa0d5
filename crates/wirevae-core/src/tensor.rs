use std::fmt;

use rand::Rng;

use crate::error::CoreError;
use crate::shape::{Dim, Shape};
use crate::Result;

/// A dense, row-major `f32` array.
///
/// Layers read and write the flat buffer directly; the shape exists so that
/// public entry points can enforce their contracts before any work is done.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    ///
    /// Panics if the element count does not match; use [`Tensor::from_vec`]
    /// for a fallible version.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self {
            data: data.to_vec(),
            shape: s,
        }
    }

    /// Take ownership of `data` as a tensor of the given shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(CoreError::InvalidReshape {
                numel: data.len(),
                shape: shape.to_vec(),
            });
        }
        Ok(Self { data, shape: s })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        Self {
            data: vec![value; s.numel()],
            shape: s,
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            data: vec![value],
            shape: Shape::scalar(),
        }
    }

    /// `steps` evenly spaced values over `[start, end]`, both ends included.
    pub fn linspace(start: f32, end: f32, steps: usize) -> Self {
        let data: Vec<f32> = match steps {
            0 => Vec::new(),
            1 => vec![start],
            _ => {
                let step = (end - start) / (steps - 1) as f32;
                (0..steps).map(|i| start + step * i as f32).collect()
            }
        };
        Self {
            data,
            shape: Shape::new(&[steps]),
        }
    }

    /// Standard normal samples drawn from `rng` (Box-Muller).
    pub fn randn_with<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        let s = Shape::new(shape);
        let data: Vec<f32> = (0..s.numel())
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0f32 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self { data, shape: s }
    }

    /// Standard normal samples from the thread-local RNG.
    pub fn randn(shape: &[usize]) -> Self {
        Self::randn_with(shape, &mut rand::thread_rng())
    }

    /// Uniform samples in `[low, high)` from the thread-local RNG.
    pub fn rand_uniform(shape: &[usize], low: f32, high: f32) -> Self {
        let s = Shape::new(shape);
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..s.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self { data, shape: s }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.shape.dim(axis)
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Enforce a shape contract, see [`Shape::expect`].
    pub fn expect(&self, name: &str, contract: &[Dim]) -> Result<()> {
        self.shape.expect(name, contract)
    }

    // =========================================================================
    // Data access
    // =========================================================================

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Option<f32> {
        if index.len() != self.ndim() {
            return None;
        }
        let mut flat = 0usize;
        for (&i, &d) in index.iter().zip(self.dims()) {
            if i >= d {
                return None;
            }
            flat = flat * d + i;
        }
        self.data.get(flat).copied()
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    pub fn abs_mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|v| v.abs()).sum::<f32>() / self.data.len() as f32
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape.clone(),
        }
    }

    // =========================================================================
    // Shape operations (materializing)
    // =========================================================================

    pub fn reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        let resolved = Shape::new(new_shape);
        if resolved.numel() != self.numel() {
            return Err(CoreError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.to_vec(),
            });
        }
        Ok(Tensor {
            data: self.data.clone(),
            shape: resolved,
        })
    }

    /// Swap the last two axes: `(..., m, n) -> (..., n, m)`.
    pub fn transpose(&self) -> Result<Tensor> {
        let new_shape = self.shape.transpose().ok_or(CoreError::InvalidAxis {
            axis: 1,
            ndim: self.ndim(),
        })?;
        let nd = self.ndim();
        let m = self.dims()[nd - 2];
        let n = self.dims()[nd - 1];
        let outer = self.numel() / (m * n).max(1);
        let mut data = vec![0.0f32; self.numel()];
        for o in 0..outer {
            let base = o * m * n;
            for i in 0..m {
                for j in 0..n {
                    data[base + j * m + i] = self.data[base + i * n + j];
                }
            }
        }
        Ok(Tensor {
            data,
            shape: new_shape,
        })
    }

    /// Slice `len` channels starting at `start` along the last axis.
    pub fn narrow_last(&self, start: usize, len: usize) -> Result<Tensor> {
        let nd = self.ndim();
        if nd == 0 {
            return Err(CoreError::InvalidAxis { axis: 0, ndim: 0 });
        }
        let last = self.dims()[nd - 1];
        if start + len > last {
            return Err(CoreError::IndexOutOfBounds {
                index: start + len,
                axis: nd - 1,
                size: last,
            });
        }
        let rows = if last == 0 { 0 } else { self.numel() / last };
        let mut data = Vec::with_capacity(rows * len);
        for r in 0..rows {
            data.extend_from_slice(&self.data[r * last + start..r * last + start + len]);
        }
        let mut dims = self.dims().to_vec();
        dims[nd - 1] = len;
        Ok(Tensor {
            data,
            shape: Shape::from(dims),
        })
    }

    /// Concatenate tensors along the last axis; leading axes must agree.
    pub fn cat_last(parts: &[&Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or(CoreError::InvalidAxis { axis: 0, ndim: 0 })?;
        let nd = first.ndim();
        let lead = &first.dims()[..nd.saturating_sub(1)];
        for p in parts {
            if p.ndim() != nd || &p.dims()[..nd - 1] != lead {
                return Err(CoreError::ShapeMismatch {
                    expected: first.dims().to_vec(),
                    got: p.dims().to_vec(),
                });
            }
        }
        let rows: usize = lead.iter().product();
        let width: usize = parts.iter().map(|p| p.dims()[nd - 1]).sum();
        let mut data = Vec::with_capacity(rows * width);
        for r in 0..rows {
            for p in parts {
                let w = p.dims()[nd - 1];
                data.extend_from_slice(&p.data[r * w..(r + 1) * w]);
            }
        }
        let mut dims = lead.to_vec();
        dims.push(width);
        Ok(Tensor {
            data,
            shape: Shape::from(dims),
        })
    }

    /// Concatenate tensors along axis 1 (channel axis of `(B, C, L)` data).
    pub fn cat_channels(parts: &[&Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or(CoreError::InvalidAxis { axis: 1, ndim: 0 })?;
        if first.ndim() < 2 {
            return Err(CoreError::InvalidAxis {
                axis: 1,
                ndim: first.ndim(),
            });
        }
        let batch = first.dims()[0];
        let inner: usize = first.dims()[2..].iter().product();
        for p in parts {
            if p.ndim() != first.ndim() || p.dims()[0] != batch || p.dims()[2..] != first.dims()[2..] {
                return Err(CoreError::ShapeMismatch {
                    expected: first.dims().to_vec(),
                    got: p.dims().to_vec(),
                });
            }
        }
        let channels: usize = parts.iter().map(|p| p.dims()[1]).sum();
        let mut data = Vec::with_capacity(batch * channels * inner);
        for b in 0..batch {
            for p in parts {
                let block = p.dims()[1] * inner;
                data.extend_from_slice(&p.data[b * block..(b + 1) * block]);
            }
        }
        let mut dims = first.dims().to_vec();
        dims[1] = channels;
        Ok(Tensor {
            data,
            shape: Shape::from(dims),
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={}, dtype=f32)", self.shape)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.numel() <= 20 {
            write!(f, "tensor({:?}, shape={})", self.data, self.shape)
        } else {
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                self.data[0],
                self.data[1],
                self.data[self.numel() - 1],
                self.shape
            )
        }
    }
}

/// A dense, row-major integer array (flags and offset indices).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexTensor {
    data: Vec<i64>,
    shape: Shape,
}

impl IndexTensor {
    pub fn from_vec(data: Vec<i64>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(CoreError::InvalidReshape {
                numel: data.len(),
                shape: shape.to_vec(),
            });
        }
        Ok(Self { data, shape: s })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        Self {
            data: vec![0; s.numel()],
            shape: s,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn expect(&self, name: &str, contract: &[Dim]) -> Result<()> {
        self.shape.expect(name, contract)
    }

    pub fn data(&self) -> &[i64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [i64] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_transpose_last_two() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 2, 3]);
        let tt = t.transpose().unwrap();
        assert_eq!(tt.dims(), &[1, 3, 2]);
        assert_eq!(tt.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(tt.transpose().unwrap(), t);
    }

    #[test]
    fn test_narrow_and_cat_last() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let a = t.narrow_last(0, 1).unwrap();
        let b = t.narrow_last(1, 2).unwrap();
        assert_eq!(a.data(), &[1.0, 4.0]);
        assert_eq!(b.data(), &[2.0, 3.0, 5.0, 6.0]);
        assert_eq!(Tensor::cat_last(&[&a, &b]).unwrap(), t);
        assert!(t.narrow_last(2, 2).is_err());
    }

    #[test]
    fn test_cat_channels() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 1, 2]);
        let b = Tensor::from_f32(&[5.0, 6.0, 7.0, 8.0], &[2, 1, 2]);
        let c = Tensor::cat_channels(&[&a, &b]).unwrap();
        assert_eq!(c.dims(), &[2, 2, 2]);
        assert_eq!(c.data(), &[1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0]);
    }

    #[test]
    fn test_linspace_endpoints() {
        let t = Tensor::linspace(-1.0, 1.0, 5);
        assert_eq!(t.data(), &[-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(Tensor::linspace(-1.0, 1.0, 1).data(), &[-1.0]);
    }

    #[test]
    fn test_randn_with_seed_is_reproducible() {
        let a = Tensor::randn_with(&[64], &mut StdRng::seed_from_u64(7));
        let b = Tensor::randn_with(&[64], &mut StdRng::seed_from_u64(7));
        let c = Tensor::randn_with(&[64], &mut StdRng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_vec_rejects_bad_length() {
        assert!(Tensor::from_vec(vec![0.0; 5], &[2, 3]).is_err());
        assert!(IndexTensor::from_vec(vec![0; 6], &[2, 3]).is_ok());
    }

    #[test]
    fn test_get() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        assert_eq!(t.get(&[1, 0]), Some(3.0));
        assert_eq!(t.get(&[2, 0]), None);
    }
}
