//! Arguments passed to and values returned from native calls.

use frankenffi_membrane::{Primitive, Segment};

/// A single argument to [`crate::NativeBinding::invoke`].
#[derive(Debug, Clone)]
pub enum NativeArg {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Pointer to the first byte of an arena segment.
    Segment(Segment),
    /// Null pointer.
    Null,
}

impl NativeArg {
    /// Scalar kind carried, `None` for pointer arguments.
    #[must_use]
    pub fn primitive(&self) -> Option<Primitive> {
        Some(match self {
            Self::I8(_) => Primitive::I8,
            Self::U8(_) => Primitive::U8,
            Self::I16(_) => Primitive::I16,
            Self::U16(_) => Primitive::U16,
            Self::I32(_) => Primitive::I32,
            Self::U32(_) => Primitive::U32,
            Self::I64(_) => Primitive::I64,
            Self::U64(_) => Primitive::U64,
            Self::F32(_) => Primitive::F32,
            Self::F64(_) => Primitive::F64,
            Self::Segment(_) | Self::Null => return None,
        })
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Segment(_) => "segment",
            Self::Null => "null",
            scalar => scalar.primitive().map_or("?", Primitive::name),
        }
    }

    /// Integer-register image: sign-extended for signed kinds, zero-extended otherwise.
    pub(crate) fn int_bits(&self) -> u64 {
        match *self {
            Self::I8(v) => i64::from(v) as u64,
            Self::U8(v) => u64::from(v),
            Self::I16(v) => i64::from(v) as u64,
            Self::U16(v) => u64::from(v),
            Self::I32(v) => i64::from(v) as u64,
            Self::U32(v) => u64::from(v),
            Self::I64(v) => v as u64,
            Self::U64(v) => v,
            Self::F32(_) | Self::F64(_) | Self::Segment(_) | Self::Null => 0,
        }
    }

    /// Vector-register image. `F32` travels in the low half.
    pub(crate) fn float_bits(&self) -> f64 {
        match *self {
            Self::F32(v) => f64::from_bits(u64::from(v.to_bits())),
            Self::F64(v) => v,
            _ => 0.0,
        }
    }
}

macro_rules! arg_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for NativeArg {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

arg_from! {
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32,
    i64 => I64, u64 => U64, f32 => F32, f64 => F64, Segment => Segment,
}

impl From<&Segment> for NativeArg {
    fn from(segment: &Segment) -> Self {
        Self::Segment(segment.clone())
    }
}

/// Value produced by a native call, narrowed to the declared return layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeValue {
    Void,
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Address(usize),
}

impl NativeValue {
    /// Narrow a raw integer return register to `kind`.
    pub(crate) fn from_int_bits(kind: Primitive, raw: u64) -> Self {
        match kind {
            Primitive::I8 => Self::I8(raw as u8 as i8),
            Primitive::U8 => Self::U8(raw as u8),
            Primitive::I16 => Self::I16(raw as u16 as i16),
            Primitive::U16 => Self::U16(raw as u16),
            Primitive::I32 => Self::I32(raw as u32 as i32),
            Primitive::U32 => Self::U32(raw as u32),
            Primitive::I64 => Self::I64(raw as i64),
            Primitive::U64 => Self::U64(raw),
            Primitive::Address => Self::Address(raw as usize),
            Primitive::F32 => Self::F32(f32::from_bits(raw as u32)),
            Primitive::F64 => Self::F64(f64::from_bits(raw)),
        }
    }

    /// Read a raw vector return register as `kind`.
    pub(crate) fn from_float_bits(kind: Primitive, raw: f64) -> Self {
        match kind {
            Primitive::F32 => Self::F32(f32::from_bits(raw.to_bits() as u32)),
            _ => Self::F64(raw),
        }
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Any integer value widened to `i64` (unsigned 64-bit values reinterpret).
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(v.into()),
            Self::U8(v) => Some(v.into()),
            Self::I16(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::I32(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::I64(v) => Some(v),
            Self::U64(v) => Some(v as i64),
            Self::Address(v) => Some(v as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U64(v) => Some(v),
            Self::Address(v) => Some(v as u64),
            _ => self.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F32(v) => Some(v.into()),
            Self::F64(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_address(&self) -> Option<usize> {
        match *self {
            Self::Address(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::I8(_) => "i8",
            Self::U8(_) => "u8",
            Self::I16(_) => "i16",
            Self::U16(_) => "u16",
            Self::I32(_) => "i32",
            Self::U32(_) => "u32",
            Self::I64(_) => "i64",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::Address(_) => "address",
        }
    }
}
