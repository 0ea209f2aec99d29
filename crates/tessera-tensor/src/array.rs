use serde::{Deserialize, Serialize};

use crate::{Element, ElementType, Shape, Tensor};

/// A dense array of one of the supported element types.
///
/// Operators dispatch on the variant with `match` (or [`with_tensor!`]) and
/// then run generic code over the concrete `Tensor<T>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Array {
    Bool(Tensor<bool>),
    U8(Tensor<u8>),
    I64(Tensor<i64>),
    F64(Tensor<f64>),
}

/// Run `$body` with `$t` bound to the tensor inside an [`Array`], whatever
/// its element type.
#[macro_export]
macro_rules! with_tensor {
    ($array:expr, $t:ident => $body:expr) => {
        match $array {
            $crate::Array::Bool($t) => $body,
            $crate::Array::U8($t) => $body,
            $crate::Array::I64($t) => $body,
            $crate::Array::F64($t) => $body,
        }
    };
}

impl Array {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Bool(_) => ElementType::Bool,
            Self::U8(_) => ElementType::U8,
            Self::I64(_) => ElementType::I64,
            Self::F64(_) => ElementType::F64,
        }
    }

    /// An array of `element` type filled with zero (or `false`).
    pub fn zeros(element: ElementType, dims: &[usize]) -> Self {
        let shape = Shape::from_slice(dims);
        match element {
            ElementType::Bool => Self::Bool(Tensor::zeros(shape)),
            ElementType::U8 => Self::U8(Tensor::zeros(shape)),
            ElementType::I64 => Self::I64(Tensor::zeros(shape)),
            ElementType::F64 => Self::F64(Tensor::zeros(shape)),
        }
    }

    pub fn shape(&self) -> &Shape {
        with_tensor!(self, t => t.shape())
    }

    pub fn dims(&self) -> &[usize] {
        self.shape().dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape().ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape().numel()
    }

    /// Borrow the tensor if the element type is `T`.
    pub fn as_tensor<T: Element>(&self) -> Option<&Tensor<T>> {
        T::from_array(self)
    }

    /// Convert to an `i64` tensor (bool and uint8 widen, float truncates).
    pub fn to_i64(&self) -> Tensor<i64> {
        with_tensor!(self, t => t.map(Element::to_i64))
    }

    /// Convert to an `f64` tensor.
    pub fn to_f64(&self) -> Tensor<f64> {
        with_tensor!(self, t => t.map(Element::to_f64))
    }
}

impl<T: Element> From<Tensor<T>> for Array {
    fn from(tensor: Tensor<T>) -> Self {
        T::into_array(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_dispatch() {
        let a: Array = Tensor::from_slice(&[true, false, true]).into();
        assert_eq!(a.element_type(), ElementType::Bool);
        assert_eq!(a.dims(), &[3]);
        assert_eq!(a.to_i64().data(), &[1, 0, 1]);
        assert!(a.as_tensor::<f64>().is_none());
        assert!(a.as_tensor::<bool>().is_some());

        let empty = Array::zeros(ElementType::U8, &[0, 3]);
        assert_eq!(empty.element_type(), ElementType::U8);
        assert_eq!(empty.numel(), 0);
    }

    #[test]
    fn array_promotion() {
        let a: Array = Tensor::from_slice(&[1u8, 255]).into();
        assert_eq!(a.to_f64().data(), &[1.0, 255.0]);
        assert_eq!(ElementType::U8.to_string(), "uint8");
    }
}
