//! At-most-once download of compiler-baked constant sections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{Device, DeviceAddr, DeviceBuffer, LaunchTensor, Stream};
use crate::error::{lock_named, LaunchError, LaunchResult};
use crate::recipe::{Recipe, RecipeTensorInfo, SectionId, TensorId};
use crate::tensor::{Shape, TensorKind};

/// A tensor backed by a non-empty const section.
#[derive(Debug, Clone)]
pub struct ConstSectionInfo {
    pub section_id: SectionId,
    pub size: u64,
    pub data: Arc<[u8]>,
    pub tensor_id: TensorId,
    pub tensor_name: String,
    pub kind: TensorKind,
    pub offset: u64,
    pub rank: usize,
}

/// Classification of a tensor with respect to const sections.
#[derive(Debug, Clone)]
pub enum ConstSectionLookup {
    /// Not in a const section.
    Mutable,
    /// In a const section without data; the tensor is dropped from the launch.
    Empty,
    Const(ConstSectionInfo),
}

impl ConstSectionInfo {
    pub fn lookup(recipe: &dyn Recipe, info: &RecipeTensorInfo) -> LaunchResult<ConstSectionLookup> {
        let Some(section) = info.section_id else {
            return Ok(ConstSectionLookup::Mutable);
        };
        let props = recipe.section_props(section).ok_or_else(|| {
            LaunchError::contract(format!(
                "tensor {} references unknown section {section}",
                info.name
            ))
        })?;
        if !props.is_const {
            return Ok(ConstSectionLookup::Mutable);
        }
        if props.size == 0 {
            return Ok(ConstSectionLookup::Empty);
        }
        let data = props.data.ok_or_else(|| {
            LaunchError::contract(format!("const section {section} carries no data"))
        })?;
        if (data.len() as u64) < props.size {
            return Err(LaunchError::contract(format!(
                "const section {section} holds {} bytes, expected {}",
                data.len(),
                props.size
            )));
        }
        Ok(ConstSectionLookup::Const(ConstSectionInfo {
            section_id: section,
            size: props.size,
            data,
            tensor_id: info.id,
            tensor_name: info.name.clone(),
            kind: info.kind,
            offset: info.offset,
            rank: info.rank(),
        }))
    }
}

/// Launch records for const tensors and the inputs left for regular planning.
#[derive(Debug)]
pub struct ConstSplit<'a> {
    pub records: Vec<LaunchTensor>,
    pub remaining: Vec<&'a RecipeTensorInfo>,
}

/// Device copies of const sections, keyed by section id.
pub struct ConstSectionCache {
    device: Arc<dyn Device>,
    buffers: Mutex<HashMap<SectionId, Arc<DeviceBuffer>>>,
    downloads: AtomicU64,
}

impl ConstSectionCache {
    pub fn new(device: &Arc<dyn Device>) -> Self {
        Self {
            device: Arc::clone(device),
            buffers: Mutex::new(HashMap::new()),
            downloads: AtomicU64::new(0),
        }
    }

    /// Device address of the tensor, downloading its section on first use.
    pub fn resolve(&self, info: &ConstSectionInfo, stream: &Stream) -> LaunchResult<DeviceAddr> {
        let mut buffers = lock_named(&self.buffers, "const section cache")?;
        if let Some(buffer) = buffers.get(&info.section_id) {
            return Ok(buffer.address() + info.offset);
        }
        let data = &info.data[..info.size as usize];
        let buffer = DeviceBuffer::allocate(&self.device, info.size)?;
        self.device.host_map(data)?;
        let copied = stream
            .copy_to_device(data, buffer.address())
            .and_then(|()| stream.synchronize());
        self.device.host_unmap(data)?;
        copied?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            section = info.section_id,
            bytes = info.size,
            "downloaded const section"
        );
        let address = buffer.address() + info.offset;
        buffers.insert(info.section_id, Arc::new(buffer));
        Ok(address)
    }

    /// Launch record for a const tensor; its shape is zeroed.
    pub fn launch_record(&self, info: &ConstSectionInfo, stream: &Stream) -> LaunchResult<LaunchTensor> {
        Ok(LaunchTensor {
            name: info.tensor_name.clone(),
            id: info.tensor_id,
            kind: info.kind,
            address: self.resolve(info, stream)?,
            shape: Shape::from_elem(0, info.rank),
        })
    }

    /// Separates const-section tensors from `inputs`.
    pub fn split_inputs<'a>(
        &self,
        recipe: &dyn Recipe,
        inputs: impl IntoIterator<Item = &'a RecipeTensorInfo>,
        stream: &Stream,
    ) -> LaunchResult<ConstSplit<'a>> {
        let mut split = ConstSplit {
            records: Vec::new(),
            remaining: Vec::new(),
        };
        for info in inputs {
            match ConstSectionInfo::lookup(recipe, info)? {
                ConstSectionLookup::Mutable => split.remaining.push(info),
                ConstSectionLookup::Empty => {}
                ConstSectionLookup::Const(const_info) => {
                    split.records.push(self.launch_record(&const_info, stream)?);
                }
            }
        }
        Ok(split)
    }

    /// Host-to-device transfers issued so far.
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn cached_sections(&self) -> LaunchResult<usize> {
        Ok(lock_named(&self.buffers, "const section cache")?.len())
    }
}
