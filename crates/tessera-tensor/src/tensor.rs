use core::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Element, Numeric, Shape};

/// N-dimensional array with contiguous row-major CPU storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Element")]
pub struct Tensor<T: Element> {
    data: Vec<T>,
    shape: Shape,
    strides: Vec<usize>,
}

impl<T: Element> Tensor<T> {
    /// Create a tensor from flat data and shape.
    pub fn new(data: Vec<T>, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        assert_eq!(
            data.len(),
            shape.numel(),
            "tensor: data length does not match shape {shape}"
        );
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor from flat data and a dims slice.
    pub fn from_vec(data: Vec<T>, dims: &[usize]) -> Self {
        Self::new(data, Shape::from_slice(dims))
    }

    /// Create a tensor filled with the default value (zero / false).
    pub fn zeros(shape: Shape) -> Self {
        let n = shape.numel();
        Self::new(vec![T::default(); n], shape)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: Shape, value: T) -> Self {
        let n = shape.numel();
        Self::new(vec![value; n], shape)
    }

    /// Create a tensor from a closure over the multi-index.
    pub fn from_fn(shape: Shape, f: impl Fn(&[usize]) -> T) -> Self {
        let n = shape.numel();
        let mut data = Vec::with_capacity(n);
        if n > 0 {
            let mut idx = vec![0usize; shape.ndim()];
            loop {
                data.push(f(&idx));
                if !shape.advance(&mut idx) {
                    break;
                }
            }
        }
        Self::new(data, shape)
    }

    /// Scalar tensor.
    pub fn scalar(val: T) -> Self {
        Self::new(vec![val], Shape::scalar())
    }

    /// 1-D tensor from slice.
    pub fn from_slice(s: &[T]) -> Self {
        Self::new(s.to_vec(), Shape::from_slice(&[s.len()]))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }
    pub fn data(&self) -> &[T] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Flat index from multi-index.
    fn flat_index(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.ndim());
        idx.iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Get element by multi-index.
    pub fn get(&self, idx: &[usize]) -> T {
        self.data[self.flat_index(idx)]
    }

    /// Set element by multi-index.
    pub fn set(&mut self, idx: &[usize], val: T) {
        let fi = self.flat_index(idx);
        self.data[fi] = val;
    }

    /// The single value of a rank-0 (or one-element) tensor.
    pub fn item(&self) -> Option<T> {
        match self.data.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    /// Apply an element-wise conversion.
    pub fn map<U: Element>(&self, f: impl Fn(T) -> U) -> Tensor<U> {
        let data: Vec<U> = self.data.iter().map(|&v| f(v)).collect();
        Tensor::new(data, self.shape.clone())
    }

    // --- Regions ---

    /// Copy out the rectangular sub-block selected by one half-open range
    /// per dimension.
    pub fn region(&self, ranges: &[Range<usize>]) -> Self {
        assert_eq!(ranges.len(), self.ndim(), "region: rank mismatch");
        for (d, r) in ranges.iter().enumerate() {
            assert!(
                r.start <= r.end && r.end <= self.shape[d],
                "region: range {r:?} out of bounds for axis {d} of {}",
                self.shape
            );
        }
        let dims: Vec<usize> = ranges.iter().map(|r| r.end - r.start).collect();
        Self::from_fn(Shape::new(dims), |idx| {
            let src: Vec<usize> = idx
                .iter()
                .zip(ranges)
                .map(|(i, r)| i + r.start)
                .collect();
            self.get(&src)
        })
    }

    /// Write `src` into this tensor with its origin at `offset`.
    pub fn write_region(&mut self, offset: &[usize], src: &Self) {
        assert_eq!(offset.len(), self.ndim(), "write_region: rank mismatch");
        assert_eq!(src.ndim(), self.ndim(), "write_region: rank mismatch");
        for d in 0..self.ndim() {
            assert!(
                offset[d] + src.shape[d] <= self.shape[d],
                "write_region: block does not fit along axis {d}"
            );
        }
        if src.numel() == 0 {
            return;
        }
        let mut idx = vec![0usize; src.ndim()];
        let mut dst = vec![0usize; src.ndim()];
        loop {
            for d in 0..idx.len() {
                dst[d] = idx[d] + offset[d];
            }
            self.set(&dst, src.get(&idx));
            if !src.shape.advance(&mut idx) {
                break;
            }
        }
    }
}

impl<T: Numeric> Tensor<T> {
    /// Sum all elements.
    pub fn sum(&self) -> T {
        self.data.iter().copied().fold(T::ZERO, |a, b| a + b)
    }

    /// Inner product of two 1-D tensors.
    pub fn dot(&self, other: &Self) -> T {
        assert_eq!(self.ndim(), 1);
        assert_eq!(other.ndim(), 1);
        assert_eq!(self.numel(), other.numel(), "dot: length mismatch");
        let mut acc = T::ZERO;
        for (&a, &b) in self.data.iter().zip(other.data.iter()) {
            acc += a * b;
        }
        acc
    }

    /// `[m, k] @ [k]` → `[m]`.
    pub fn matvec(&self, v: &Self) -> Self {
        assert_eq!(self.ndim(), 2);
        assert_eq!(v.ndim(), 1);
        let (m, k) = (self.shape[0], self.shape[1]);
        assert_eq!(v.numel(), k, "matvec: inner dimension mismatch");
        let data = (0..m)
            .map(|i| {
                let row = &self.data[i * k..(i + 1) * k];
                let mut acc = T::ZERO;
                for (&a, &b) in row.iter().zip(v.data.iter()) {
                    acc += a * b;
                }
                acc
            })
            .collect();
        Self::new(data, Shape::from_slice(&[m]))
    }

    /// `[k] @ [k, n]` → `[n]`.
    pub fn vecmat(&self, m: &Self) -> Self {
        assert_eq!(self.ndim(), 1);
        assert_eq!(m.ndim(), 2);
        let (k, n) = (m.shape[0], m.shape[1]);
        assert_eq!(self.numel(), k, "vecmat: inner dimension mismatch");
        let mut out = vec![T::ZERO; n];
        for (i, &a) in self.data.iter().enumerate() {
            let row = &m.data[i * n..(i + 1) * n];
            for (o, &b) in out.iter_mut().zip(row) {
                *o += a * b;
            }
        }
        Self::new(out, Shape::from_slice(&[n]))
    }

    /// Matrix multiply for 2-D tensors.
    pub fn matmul(&self, other: &Self) -> Self {
        assert_eq!(self.ndim(), 2);
        assert_eq!(other.ndim(), 2);
        let (m, k) = (self.shape[0], self.shape[1]);
        let n = other.shape[1];
        assert_eq!(other.shape[0], k, "matmul: inner dimension mismatch");

        let mut out = vec![T::ZERO; m * n];
        for i in 0..m {
            for p in 0..k {
                let a = self.data[i * k + p];
                let row = &other.data[p * n..(p + 1) * n];
                for (o, &b) in out[i * n..(i + 1) * n].iter_mut().zip(row) {
                    *o += a * b;
                }
            }
        }
        Self::new(out, Shape::from_slice(&[m, n]))
    }

    /// Valid 1-D correlation: `out[i] = sum_j self[i + j] * kernel[j]`.
    pub fn conv1d(&self, kernel: &Self) -> Self {
        assert_eq!(self.ndim(), 1);
        assert_eq!(kernel.ndim(), 1);
        let n = self.numel();
        let k = kernel.numel();
        let out_len = if k == 0 || n < k { 0 } else { n - k + 1 };
        let data = (0..out_len)
            .map(|i| {
                let mut acc = T::ZERO;
                for (j, &w) in kernel.data.iter().enumerate() {
                    acc += self.data[i + j] * w;
                }
                acc
            })
            .collect();
        Self::new(data, Shape::from_slice(&[out_len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_basics() {
        let t = Tensor::<f64>::zeros(Shape::from_slice(&[2, 3]));
        assert_eq!(t.numel(), 6);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.get(&[0, 0]), 0.0);
    }

    #[test]
    fn tensor_from_fn() {
        let t = Tensor::<i64>::from_fn(Shape::from_slice(&[2, 3]), |idx| (idx[0] * 3 + idx[1]) as i64);
        assert_eq!(t.get(&[0, 0]), 0);
        assert_eq!(t.get(&[0, 2]), 2);
        assert_eq!(t.get(&[1, 1]), 4);
    }

    #[test]
    fn empty_from_fn() {
        let t = Tensor::<i64>::from_fn(Shape::from_slice(&[0, 3]), |_| 1);
        assert_eq!(t.numel(), 0);
        assert!(t.data().is_empty());
    }

    #[test]
    fn region_and_write_back() {
        let t = Tensor::<i64>::from_fn(Shape::from_slice(&[3, 4]), |idx| (idx[0] * 4 + idx[1]) as i64);
        let r = t.region(&[1..3, 1..3]);
        assert_eq!(r.dims(), &[2, 2]);
        assert_eq!(r.data(), &[5, 6, 9, 10]);

        let mut z = Tensor::<i64>::zeros(Shape::from_slice(&[3, 4]));
        z.write_region(&[1, 1], &r);
        assert_eq!(z.get(&[1, 1]), 5);
        assert_eq!(z.get(&[2, 2]), 10);
        assert_eq!(z.get(&[0, 0]), 0);
    }

    #[test]
    fn empty_region_is_noop() {
        let t = Tensor::from_slice(&[1i64, 2, 3]);
        let r = t.region(&[2..2]);
        assert_eq!(r.numel(), 0);
        let mut z = t.clone();
        z.write_region(&[3], &r);
        assert_eq!(z, t);
    }

    #[test]
    fn tensor_matmul() {
        // [[1, 2], [3, 4]] @ [[5, 6], [7, 8]] = [[19, 22], [43, 50]]
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]);
        let c = a.matmul(&b);
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn tensor_dot_and_matvec() {
        let a = Tensor::from_slice(&[1i64, 2, 3, 4]);
        let b = Tensor::from_slice(&[5i64, 6, 7, 8]);
        assert_eq!(a.dot(&b), 70);

        let m = Tensor::from_vec(vec![1i64, 2, 3, 4, 5, 6], &[2, 3]);
        let v = Tensor::from_slice(&[1i64, 0, 2]);
        assert_eq!(m.matvec(&v).data(), &[7, 16]);

        let w = Tensor::from_slice(&[1i64, 2]);
        assert_eq!(w.vecmat(&m).data(), &[9, 12, 15]);
    }

    #[test]
    fn tensor_conv1d() {
        let x = Tensor::from_slice(&[1i64, 2, 3, 4, 5]);
        let k = Tensor::from_slice(&[1i64, 0, -1]);
        assert_eq!(x.conv1d(&k).data(), &[-2, -2, -2]);

        let short = Tensor::from_slice(&[1i64]);
        assert_eq!(short.conv1d(&k).numel(), 0);
    }
}
