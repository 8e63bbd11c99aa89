use std::fmt;

use serde::{Deserialize, Serialize};

/// Element types a recipe tensor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Bf16,
    F16,
    F32,
    F64,
    Fp8E4M3,
    Fp8E5M2,
    Bool,
}

impl DType {
    /// Storage size of one element.
    pub fn size_in_bytes(self) -> u64 {
        match self {
            DType::I8 | DType::U8 | DType::Fp8E4M3 | DType::Fp8E5M2 | DType::Bool => 1,
            DType::I16 | DType::U16 | DType::Bf16 | DType::F16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DType::Bf16 | DType::F16 | DType::F32 | DType::F64 | DType::Fp8E4M3 | DType::Fp8E5M2
        )
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(self, DType::I8 | DType::I16 | DType::I32 | DType::I64)
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(self, DType::U8 | DType::U16 | DType::U32 | DType::U64)
    }

    /// Returns `true` for the types synthetic data can be generated and compared for.
    pub fn is_generatable(self) -> bool {
        matches!(self, DType::Bf16 | DType::F16 | DType::F32)
            || self.is_signed_integer()
            || self.is_unsigned_integer()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::U16 => "u16",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::I64 => "i64",
            DType::U64 => "u64",
            DType::Bf16 => "bf16",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Fp8E4M3 => "fp8e4m3",
            DType::Fp8E5M2 => "fp8e5m2",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
