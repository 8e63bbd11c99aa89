//! Tensor roles and their storage classification.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dtype::DType;

/// Maximum number of dimensions a launch record can carry.
pub const LAUNCH_SHAPE_CAPACITY: usize = 25;

/// Runtime or declared tensor shape, outermost dimension last.
pub type Shape = SmallVec<[u64; 5]>;

/// Role of a tensor as reported by the compiled recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorKind {
    /// Ordinary device data with a static shape.
    Data,
    /// Device data whose runtime shape may be smaller than its declared maximum.
    DataDynamic,
    /// Shape-only tensor that still occupies device memory.
    DeviceShape,
    /// Shape tensor resident in host memory.
    HostShape,
    /// Host-resident tensor the device reads directly.
    HostToDevice,
    OutputDescribingShape,
    InputDescribingShape,
}

/// Where a tensor's storage lives at launch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Device,
    Host,
    None,
}

impl MemoryKind {
    pub fn classify(kind: TensorKind) -> Self {
        match kind {
            TensorKind::HostShape | TensorKind::HostToDevice => MemoryKind::Host,
            TensorKind::Data | TensorKind::DataDynamic | TensorKind::DeviceShape => {
                MemoryKind::Device
            }
            TensorKind::OutputDescribingShape | TensorKind::InputDescribingShape => {
                MemoryKind::None
            }
        }
    }
}

impl TensorKind {
    pub fn memory_kind(self) -> MemoryKind {
        MemoryKind::classify(self)
    }

    /// Host-to-device tensors are host resident but still reserve room in their section.
    pub fn occupies_section(self) -> bool {
        self.memory_kind() == MemoryKind::Device || self == TensorKind::HostToDevice
    }
}

/// Number of elements described by `shape`; a rank-0 shape is a scalar.
pub fn element_count(shape: &[u64]) -> u64 {
    shape.iter().product()
}

/// Bytes needed for `shape` elements of `dtype`, or `None` if the size does not fit in `u64`.
pub fn checked_byte_size(shape: &[u64], dtype: DType) -> Option<u64> {
    shape
        .iter()
        .try_fold(1u64, |acc, dim| acc.checked_mul(*dim))?
        .checked_mul(dtype.size_in_bytes())
}
