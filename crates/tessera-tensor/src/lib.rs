//! Dense N-dimensional arrays for the tessera runtime.
//!
//! `Tensor<T>` is the storage type; `Array` is the closed sum over the
//! element types the language supports (bool, uint8, int64, float64).

mod array;
mod element;
mod shape;
mod tensor;

pub use array::Array;
pub use element::{Element, ElementType, Numeric};
pub use shape::Shape;
pub use tensor::Tensor;
