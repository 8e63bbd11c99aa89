//! Read-only view of a compiled recipe.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::{LaunchError, LaunchResult};
use crate::tensor::{checked_byte_size, MemoryKind, Shape, TensorKind};

pub type TensorId = u64;
pub type SectionId = u32;
pub type NodeId = u64;

/// Launch metadata the recipe reports for one tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeTensorInfo {
    pub name: String,
    pub id: TensorId,
    pub dtype: DType,
    pub kind: TensorKind,
    pub min_shape: Shape,
    pub max_shape: Shape,
    /// Memory section for section-backed tensors.
    pub section_id: Option<SectionId>,
    /// Byte offset inside the section.
    pub offset: u64,
    pub is_input: bool,
}

impl RecipeTensorInfo {
    /// Static data input with `min_shape == max_shape` and no section.
    pub fn input(name: impl Into<String>, id: TensorId, dtype: DType, shape: &[u64]) -> Self {
        Self {
            name: name.into(),
            id,
            dtype,
            kind: TensorKind::Data,
            min_shape: Shape::from_slice(shape),
            max_shape: Shape::from_slice(shape),
            section_id: None,
            offset: 0,
            is_input: true,
        }
    }

    pub fn output(name: impl Into<String>, id: TensorId, dtype: DType, shape: &[u64]) -> Self {
        Self {
            is_input: false,
            ..Self::input(name, id, dtype, shape)
        }
    }

    pub fn in_section(mut self, section: SectionId, offset: u64) -> Self {
        self.section_id = Some(section);
        self.offset = offset;
        self
    }

    pub fn with_kind(mut self, kind: TensorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_min_shape(mut self, min_shape: &[u64]) -> Self {
        self.min_shape = Shape::from_slice(min_shape);
        self
    }

    pub fn rank(&self) -> usize {
        self.max_shape.len()
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.kind.memory_kind()
    }

    /// Declared maximum size in bytes.
    pub fn max_bytes(&self) -> LaunchResult<u64> {
        checked_byte_size(&self.max_shape, self.dtype).ok_or_else(|| {
            LaunchError::contract(format!("tensor {} declares more bytes than fit in u64", self.name))
        })
    }
}

/// Properties of a memory section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionProps {
    pub is_const: bool,
    /// Size of the baked data; only meaningful for const sections.
    pub size: u64,
    pub data: Option<Arc<[u8]>>,
}

impl SectionProps {
    pub fn mutable() -> Self {
        Self {
            is_const: false,
            size: 0,
            data: None,
        }
    }

    pub fn constant(data: Arc<[u8]>) -> Self {
        Self {
            is_const: true,
            size: data.len() as u64,
            data: Some(data),
        }
    }
}

/// A compiled program ready to be launched.
pub trait Recipe: Send + Sync {
    fn name(&self) -> &str;

    /// All launch tensors, inputs and outputs, in recipe order.
    fn tensors(&self) -> &[RecipeTensorInfo];

    /// Returns `None` for a section id the recipe does not know.
    fn section_props(&self, section: SectionId) -> Option<SectionProps>;

    fn workspace_size(&self) -> u64;

    /// Allows devices to recover their own recipe type.
    fn as_any(&self) -> &dyn Any;
}

impl<'a> dyn Recipe + 'a {
    pub fn inputs(&self) -> impl Iterator<Item = &RecipeTensorInfo> {
        self.tensors().iter().filter(|info| info.is_input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &RecipeTensorInfo> {
        self.tensors().iter().filter(|info| !info.is_input)
    }

    pub fn tensor_by_name(&self, name: &str) -> Option<&RecipeTensorInfo> {
        self.tensors().iter().find(|info| info.name == name)
    }
}

/// Recipe described entirely by tables, for devices that interpret launch records themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticRecipe {
    pub name: String,
    pub tensors: Vec<RecipeTensorInfo>,
    pub sections: BTreeMap<SectionId, SectionProps>,
    pub workspace_size: u64,
}

impl StaticRecipe {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_tensor(mut self, info: RecipeTensorInfo) -> Self {
        self.tensors.push(info);
        self
    }

    pub fn with_section(mut self, section: SectionId, props: SectionProps) -> Self {
        self.sections.insert(section, props);
        self
    }

    pub fn with_workspace(mut self, bytes: u64) -> Self {
        self.workspace_size = bytes;
        self
    }
}

impl Recipe for StaticRecipe {
    fn name(&self) -> &str {
        &self.name
    }

    fn tensors(&self) -> &[RecipeTensorInfo] {
        &self.tensors
    }

    fn section_props(&self, section: SectionId) -> Option<SectionProps> {
        self.sections.get(&section).cloned()
    }

    fn workspace_size(&self) -> u64 {
        self.workspace_size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
