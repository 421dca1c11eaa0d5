use smallvec::SmallVec;
use std::fmt;

use crate::error::CoreError;
use crate::Result;

/// One axis of a declared shape contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dim {
    /// Any size, including zero.
    Any,
    /// Exactly this size.
    Is(usize),
    /// At least one and at most this size.
    AtMost(usize),
    /// At least this size.
    AtLeast(usize),
}

impl Dim {
    fn accepts(&self, size: usize) -> bool {
        match *self {
            Dim::Any => true,
            Dim::Is(n) => size == n,
            Dim::AtMost(n) => size >= 1 && size <= n,
            Dim::AtLeast(n) => size >= n,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Any => write!(f, "*"),
            Dim::Is(n) => write!(f, "{n}"),
            Dim::AtMost(n) => write!(f, "1..={n}"),
            Dim::AtLeast(n) => write!(f, ">={n}"),
        }
    }
}

/// Tensor shape with stack-allocated storage for ≤4 dimensions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn numel(&self) -> usize {
        if self.dims.is_empty() {
            1
        } else {
            self.dims.iter().product()
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.dims.get(axis).copied().ok_or(CoreError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Check this shape against a declared contract such as `[B, N, 30]`.
    ///
    /// `name` identifies the argument in the error message.
    pub fn expect(&self, name: &str, contract: &[Dim]) -> Result<()> {
        let ok = self.ndim() == contract.len()
            && contract.iter().zip(self.dims.iter()).all(|(c, &d)| c.accepts(d));
        if ok {
            return Ok(());
        }
        let expected = contract
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(CoreError::ShapeContract {
            name: name.to_string(),
            expected: format!("[{expected}]"),
            got: self.dims.to_vec(),
        })
    }

    /// Shape with the last two axes swapped.
    pub fn transpose(&self) -> Option<Shape> {
        if self.ndim() < 2 {
            return None;
        }
        let mut dims = self.dims.clone();
        let n = dims.len();
        dims.swap(n - 2, n - 1);
        Some(Shape { dims })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4);
