use std::str::FromStr;

use bytemuck::Pod;
use derive_more::Display;
use half::f16;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown data type: {0}")]
pub struct DataTypeError(String);

/// Element type of a tensor buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    #[default]
    #[display("float32")]
    F32,
    #[display("float64")]
    F64,
    #[display("float16")]
    F16,
    #[display("uint8")]
    U8,
    #[display("int32")]
    I32,
    #[display("int64")]
    I64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F64 => 8,
            DataType::F16 => 2,
            DataType::U8 => 1,
            DataType::I32 => 4,
            DataType::I64 => 8,
        }
    }
}

impl FromStr for DataType {
    type Err = DataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "float32" | "f32" => Ok(Self::F32),
            "float64" | "f64" => Ok(Self::F64),
            "float16" | "f16" => Ok(Self::F16),
            "uint8" | "u8" => Ok(Self::U8),
            "int32" | "i32" => Ok(Self::I32),
            "int64" | "i64" => Ok(Self::I64),
            s => Err(DataTypeError(s.to_string())),
        }
    }
}

pub trait Scalar: Sized + Pod + Default + Send + Sync + std::fmt::Debug {
    const DATA_TYPE: DataType;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f64 {
    const DATA_TYPE: DataType = DataType::F64;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Scalar for i64 {
    const DATA_TYPE: DataType = DataType::I64;
}

/// Arithmetic needed by the built-in kernels.
pub trait Element:
    Scalar
    + PartialOrd
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
{
    const ZERO: Self;
    const ONE: Self;
    const MIN: Self;
    const MAX: Self;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($t:ty, $zero:expr, $one:expr) => {
        impl Element for $t {
            const ZERO: Self = $zero;
            const ONE: Self = $one;
            const MIN: Self = <$t>::MIN;
            const MAX: Self = <$t>::MAX;

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_element!(f32, 0.0, 1.0);
impl_element!(f64, 0.0, 1.0);
impl_element!(u8, 0, 1);
impl_element!(i32, 0, 1);
impl_element!(i64, 0, 1);

impl Element for f16 {
    const ZERO: Self = f16::ZERO;
    const ONE: Self = f16::ONE;
    const MIN: Self = f16::MIN;
    const MAX: Self = f16::MAX;

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

/// Dispatches a generic expression over the element type matching a [`DataType`].
///
/// ```ignore
/// dispatch_type!(dtype, T => kernel::<T>(x));
/// ```
macro_rules! dispatch_type {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::loom::num::DataType::F32 => {
                type $t = f32;
                $body
            }
            $crate::loom::num::DataType::F64 => {
                type $t = f64;
                $body
            }
            $crate::loom::num::DataType::F16 => {
                type $t = ::half::f16;
                $body
            }
            $crate::loom::num::DataType::U8 => {
                type $t = u8;
                $body
            }
            $crate::loom::num::DataType::I32 => {
                type $t = i32;
                $body
            }
            $crate::loom::num::DataType::I64 => {
                type $t = i64;
                $body
            }
        }
    };
}

pub(crate) use dispatch_type;
