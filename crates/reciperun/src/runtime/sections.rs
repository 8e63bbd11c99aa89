//! Device section sizing and allocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::DataProvider;
use crate::device::{Device, DeviceAddr, DeviceBuffer};
use crate::error::{LaunchError, LaunchResult};
use crate::recipe::{Recipe, RecipeTensorInfo, SectionId};
use crate::tensor::TensorKind;

/// Rounds `value` up to a multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> LaunchResult<u64> {
    if alignment <= 1 {
        return Ok(value);
    }
    match value % alignment {
        0 => Ok(value),
        rem => value.checked_add(alignment - rem).ok_or_else(|| {
            LaunchError::contract(format!("{value} aligned to {alignment} overflows u64"))
        }),
    }
}

/// Bytes a tensor occupies at launch.
///
/// Static data tensors always use their declared maximum; other tensors use the data source's
/// size when the source knows them.
pub fn actual_tensor_size(
    info: &RecipeTensorInfo,
    provider: Option<&dyn DataProvider>,
) -> LaunchResult<u64> {
    match provider {
        Some(provider) if info.kind != TensorKind::Data && provider.contains(&info.name) => {
            provider.buffer_size(&info.name)
        }
        _ => info.max_bytes(),
    }
}

/// Aligned byte size per section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionPlan {
    sizes: BTreeMap<SectionId, u64>,
}

impl SectionPlan {
    pub fn size(&self, section: SectionId) -> Option<u64> {
        self.sizes.get(&section).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SectionId, u64)> + '_ {
        self.sizes.iter().map(|(id, size)| (*id, *size))
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.sizes.values().sum()
    }
}

/// One device buffer per planned section.
#[derive(Debug, Default)]
pub struct SectionBuffers {
    buffers: BTreeMap<SectionId, DeviceBuffer>,
}

impl SectionBuffers {
    pub fn base(&self, section: SectionId) -> LaunchResult<DeviceAddr> {
        self.buffers
            .get(&section)
            .map(DeviceBuffer::address)
            .ok_or_else(|| LaunchError::contract(format!("section {section} was not allocated")))
    }

    pub fn get(&self, section: SectionId) -> Option<&DeviceBuffer> {
        self.buffers.get(&section)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Sizes each mutable section to the high-water mark of its tensors.
#[derive(Debug, Clone, Copy)]
pub struct SectionPlanner {
    alignment: u64,
}

impl SectionPlanner {
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }

    pub fn for_device(device: &dyn Device) -> Self {
        Self::new(device.address_alignment())
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Computes section sizes for every section-backed tensor in `tensors`.
    ///
    /// Const sections are skipped. A tensor without a section, or with a section the recipe
    /// does not know, is a contract violation.
    pub fn plan<'a>(
        &self,
        recipe: &dyn Recipe,
        tensors: impl IntoIterator<Item = &'a RecipeTensorInfo>,
        provider: Option<&dyn DataProvider>,
    ) -> LaunchResult<SectionPlan> {
        let mut sizes: BTreeMap<SectionId, u64> = BTreeMap::new();
        for info in tensors {
            if !info.kind.occupies_section() {
                continue;
            }
            let section = info.section_id.ok_or_else(|| {
                LaunchError::contract(format!("tensor {} has no memory section", info.name))
            })?;
            let props = recipe.section_props(section).ok_or_else(|| {
                LaunchError::contract(format!(
                    "tensor {} references unknown section {section}",
                    info.name
                ))
            })?;
            if props.is_const {
                continue;
            }
            let high_water = actual_tensor_size(info, provider)?
                .checked_add(info.offset)
                .ok_or_else(|| {
                    LaunchError::contract(format!("tensor {} overflows its section", info.name))
                })?;
            let entry = sizes.entry(section).or_insert(0);
            *entry = (*entry).max(high_water);
        }
        for size in sizes.values_mut() {
            *size = align_up(*size, self.alignment)?;
        }
        Ok(SectionPlan { sizes })
    }

    pub fn allocate(
        &self,
        device: &Arc<dyn Device>,
        plan: &SectionPlan,
    ) -> LaunchResult<SectionBuffers> {
        let mut buffers = BTreeMap::new();
        for (section, size) in plan.iter() {
            tracing::debug!(section, size, "allocating section");
            buffers.insert(section, DeviceBuffer::allocate(device, size)?);
        }
        Ok(SectionBuffers { buffers })
    }
}
