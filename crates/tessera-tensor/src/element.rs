use core::fmt;
use core::ops::{Add, AddAssign, Mul};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Array, Tensor};

/// Tag for the closed set of element types an [`Array`] can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Bool,
    U8,
    I64,
    F64,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::U8 => "uint8",
            Self::I64 => "int64",
            Self::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Trait for element types that can be stored in a [`Tensor`].
///
/// Implemented for `bool`, `u8`, `i64` and `f64`. Each type knows how to wrap
/// a tensor of itself into the matching [`Array`] variant and how to borrow
/// it back out, so generic code can move between the two without matching.
pub trait Element:
    Copy
    + Clone
    + fmt::Debug
    + PartialEq
    + PartialOrd
    + Default
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    const TYPE: ElementType;

    fn to_f64(self) -> f64;
    fn to_i64(self) -> i64;

    /// Whether the value is unordered (only ever true for a float NaN).
    fn is_nan(self) -> bool {
        false
    }

    fn into_array(tensor: Tensor<Self>) -> Array;
    fn from_array(array: &Array) -> Option<&Tensor<Self>>;
}

/// Element types with ring arithmetic, used by contractions and windowed ops.
pub trait Numeric: Element + Add<Output = Self> + Mul<Output = Self> + AddAssign {
    const ZERO: Self;
}

macro_rules! impl_element {
    ($ty:ty, $tag:ident, $to_f64:expr, $to_i64:expr) => {
        impl Element for $ty {
            const TYPE: ElementType = ElementType::$tag;

            #[inline]
            fn to_f64(self) -> f64 {
                ($to_f64)(self)
            }

            #[inline]
            fn to_i64(self) -> i64 {
                ($to_i64)(self)
            }

            fn into_array(tensor: Tensor<Self>) -> Array {
                Array::$tag(tensor)
            }

            fn from_array(array: &Array) -> Option<&Tensor<Self>> {
                match array {
                    Array::$tag(t) => Some(t),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(bool, Bool, |v: bool| if v { 1.0 } else { 0.0 }, |v: bool| v as i64);
impl_element!(u8, U8, |v: u8| v as f64, |v: u8| v as i64);
impl_element!(i64, I64, |v: i64| v as f64, |v: i64| v);

impl Element for f64 {
    const TYPE: ElementType = ElementType::F64;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn to_i64(self) -> i64 {
        self as i64
    }

    #[inline]
    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }

    fn into_array(tensor: Tensor<Self>) -> Array {
        Array::F64(tensor)
    }

    fn from_array(array: &Array) -> Option<&Tensor<Self>> {
        match array {
            Array::F64(t) => Some(t),
            _ => None,
        }
    }
}

impl Numeric for i64 {
    const ZERO: Self = 0;
}

impl Numeric for f64 {
    const ZERO: Self = 0.0;
}
