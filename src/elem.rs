//! Element types the operators accept

use std::ops::{Add, Div, Sub};

use candle_core::{DType, WithDType};

/// Type constraint a kernel is registered under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElemType {
    F32,
    F64,
}

impl ElemType {
    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(Self::F32),
            DType::F64 => Some(Self::F64),
            _ => None,
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
        }
    }
}

/// Floating point scalar the host kernels compute in. All math stays at the
/// native precision of `Self`.
pub trait FloatElem:
    WithDType + Add<Output = Self> + Sub<Output = Self> + Div<Output = Self>
{
    const ELEM: ElemType;
    const NEG_INFINITY: Self;
    const ZERO: Self;

    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn max(self, other: Self) -> Self;
}

macro_rules! float_elem {
    ($ty:ty, $elem:expr) => {
        impl FloatElem for $ty {
            const ELEM: ElemType = $elem;
            const NEG_INFINITY: Self = <$ty>::NEG_INFINITY;
            const ZERO: Self = 0.0;

            #[inline]
            fn exp(self) -> Self {
                <$ty>::exp(self)
            }

            #[inline]
            fn ln(self) -> Self {
                <$ty>::ln(self)
            }

            #[inline]
            fn max(self, other: Self) -> Self {
                <$ty>::max(self, other)
            }
        }
    };
}

float_elem!(f32, ElemType::F32);
float_elem!(f64, ElemType::F64);
