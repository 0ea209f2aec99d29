use serde::{Deserialize, Serialize};

/// N-dimensional shape descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of elements. A rank-0 shape holds one element; any zero
    /// extent makes the shape empty.
    pub fn numel(&self) -> usize {
        self.dims.iter().product::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// Compute contiguous row-major strides.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let n = self.dims.len();
        if n == 0 {
            return Vec::new();
        }
        let mut strides = vec![0usize; n];
        strides[n - 1] = 1;
        for i in (0..n - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Advance a row-major multi-index in place. Returns `false` once the
    /// index wraps past the last element.
    pub fn advance(&self, idx: &mut [usize]) -> bool {
        debug_assert_eq!(idx.len(), self.ndim());
        for d in (0..self.dims.len()).rev() {
            idx[d] += 1;
            if idx[d] < self.dims[d] {
                return true;
            }
            idx[d] = 0;
        }
        false
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = usize;
    fn index(&self, i: usize) -> &usize {
        &self.dims[i]
    }
}

impl core::fmt::Display for Shape {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}
