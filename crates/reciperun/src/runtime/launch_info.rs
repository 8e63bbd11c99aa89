//! Per-tensor launch records.

use std::collections::BTreeMap;

use crate::data::DataProvider;
use crate::device::{Device, HostBuffer, LaunchTensor};
use crate::error::{LaunchError, LaunchResult};
use crate::recipe::{RecipeTensorInfo, TensorId};
use crate::runtime::sections::{actual_tensor_size, SectionBuffers};
use crate::tensor::{MemoryKind, Shape, LAUNCH_SHAPE_CAPACITY};

/// Checks a runtime shape against the tensor's declared geometry.
///
/// Returns one warning for a rank mismatch (or a rank the launch record cannot hold) and one
/// per dimension outside `[min, max]`.
pub fn verify_shape(shape: &[u64], info: &RecipeTensorInfo) -> Vec<String> {
    let mut warnings = Vec::new();
    if shape.len() != info.rank() || shape.len() > LAUNCH_SHAPE_CAPACITY {
        warnings.push(format!(
            "invalid shape info for tensor: {}, dims count: {}",
            info.name,
            shape.len()
        ));
    }
    for (dim, actual) in shape.iter().enumerate() {
        let Some(max) = info.max_shape.get(dim) else {
            break;
        };
        let min = info.min_shape.get(dim).copied().unwrap_or(0);
        if *actual < min || actual > max {
            warnings.push(format!(
                "invalid shape for tensor: {} in dim {}, actual size: {}, min size is: {} and max size is: {}",
                info.name, dim, actual, min, max
            ));
        }
    }
    warnings
}

/// Launch records plus the host buffers backing host-resident tensors.
#[derive(Debug, Default)]
pub struct LaunchDescriptors {
    pub records: Vec<LaunchTensor>,
    pub host_buffers: BTreeMap<TensorId, HostBuffer>,
    pub warnings: Vec<String>,
}

/// Resolves addresses and runtime shapes, appending records in launch order.
pub struct LaunchDescriptorBuilder<'a> {
    device: &'a dyn Device,
    sections: &'a SectionBuffers,
    provider: Option<&'a dyn DataProvider>,
    descriptors: LaunchDescriptors,
}

impl<'a> LaunchDescriptorBuilder<'a> {
    pub fn new(
        device: &'a dyn Device,
        sections: &'a SectionBuffers,
        provider: Option<&'a dyn DataProvider>,
    ) -> Self {
        Self {
            device,
            sections,
            provider,
            descriptors: LaunchDescriptors::default(),
        }
    }

    /// Records that were resolved elsewhere and go first, such as const tensors.
    pub fn with_records(mut self, records: Vec<LaunchTensor>) -> Self {
        self.descriptors.records.extend(records);
        self
    }

    /// Host-resident inputs are filled from the data source, or zeroed without one.
    pub fn push_input(&mut self, info: &RecipeTensorInfo) -> LaunchResult<()> {
        self.push(info, true)
    }

    pub fn push_output(&mut self, info: &RecipeTensorInfo) -> LaunchResult<()> {
        self.push(info, false)
    }

    pub fn build(self) -> LaunchDescriptors {
        self.descriptors
    }

    fn push(&mut self, info: &RecipeTensorInfo, fill: bool) -> LaunchResult<()> {
        let address = match info.memory_kind() {
            MemoryKind::Device => {
                let section = info.section_id.ok_or_else(|| {
                    LaunchError::contract(format!("tensor {} has no memory section", info.name))
                })?;
                self.sections.base(section)? + info.offset
            }
            MemoryKind::Host => {
                let mut buffer = self
                    .device
                    .host_malloc(actual_tensor_size(info, self.provider)?)?;
                if fill {
                    if let Some(provider) = self.provider.filter(|p| p.contains(&info.name)) {
                        provider.copy_buffer(&info.name, buffer.as_mut_slice())?;
                    }
                }
                let address = buffer.address();
                self.descriptors.host_buffers.insert(info.id, buffer);
                address
            }
            MemoryKind::None => 0,
        };
        let shape = self.runtime_shape(info)?;
        self.descriptors.records.push(LaunchTensor {
            name: info.name.clone(),
            id: info.id,
            kind: info.kind,
            address,
            shape,
        });
        Ok(())
    }

    fn runtime_shape(&mut self, info: &RecipeTensorInfo) -> LaunchResult<Shape> {
        let Some(provider) = self.provider.filter(|p| p.contains(&info.name)) else {
            return Ok(info.max_shape.clone());
        };
        let mut shape = provider.shape(&info.name)?;
        self.descriptors.warnings.extend(verify_shape(&shape, info));
        shape.truncate(LAUNCH_SHAPE_CAPACITY);
        Ok(shape)
    }
}
