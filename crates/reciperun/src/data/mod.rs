//! Input data sources for launches.

mod generate;

use std::collections::BTreeMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::dtype::DType;
use crate::error::{LaunchError, LaunchResult};
use crate::recipe::Recipe;
use crate::tensor::{checked_byte_size, element_count, MemoryKind, Shape};

pub use generate::{name_seed, random_buffer, uniform_buffer};

/// Dimension permutation applied by the data source's layout.
pub type Permutation = SmallVec<[u8; 5]>;

/// Supplies runtime shapes and contents for tensors by name.
pub trait DataProvider: Send + Sync {
    fn tensor_names(&self) -> Vec<String>;

    fn contains(&self, name: &str) -> bool;

    fn shape(&self, name: &str) -> LaunchResult<Shape>;

    fn permutation(&self, name: &str) -> LaunchResult<Option<Permutation>>;

    fn dtype(&self, name: &str) -> LaunchResult<DType>;

    fn buffer(&self, name: &str) -> LaunchResult<Arc<[u8]>>;

    fn buffer_size(&self, name: &str) -> LaunchResult<u64> {
        checked_byte_size(&self.shape(name)?, self.dtype(name)?).ok_or_else(|| {
            LaunchError::contract(format!("tensor {name} has more bytes than fit in u64"))
        })
    }

    /// Copies the tensor's contents into `dst`, zero-filling whatever the data does not cover.
    fn copy_buffer(&self, name: &str, dst: &mut [u8]) -> LaunchResult<()> {
        let data = self.buffer(name)?;
        let len = data.len().min(dst.len());
        dst[..len].copy_from_slice(&data[..len]);
        dst[len..].fill(0);
        Ok(())
    }
}

/// How [`ManualDataProvider::add_tensor`] initializes a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemInit {
    /// Uniform in `[-2, 2]`.
    RandomWithNegative,
    /// Uniform in `[0, 2]`.
    RandomPositive,
    AllOnes,
    AllZero,
    /// Caller-supplied bytes.
    FromInitializer,
    /// Zero-filled; the contents are not meaningful.
    None,
}

#[derive(Debug, Clone)]
struct Entry {
    dtype: DType,
    shape: Shape,
    permutation: Option<Permutation>,
    data: Option<Arc<[u8]>>,
}

/// Data source whose tensors are registered one by one.
///
/// Random contents are seeded from the tensor name, so two providers populated with the same
/// names and initializers hold identical bytes.
#[derive(Debug, Clone, Default)]
pub struct ManualDataProvider {
    entries: BTreeMap<String, Entry>,
}

impl ManualDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` with a buffer sized for `shape` and filled according to `init`.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dtype: DType,
        shape: &[u64],
        init: MemInit,
        initializer: Option<&[u8]>,
    ) -> LaunchResult<()> {
        let name = name.into();
        let elements = usize::try_from(element_count(shape))
            .map_err(|_| LaunchError::data(format!("tensor {name} is too large")))?;
        let data = match init {
            MemInit::RandomWithNegative => {
                random_buffer(dtype, elements, -2.0, 2.0, name_seed(&name))?
            }
            MemInit::RandomPositive => random_buffer(dtype, elements, 0.0, 2.0, name_seed(&name))?,
            MemInit::AllOnes => uniform_buffer(dtype, elements, 1.0)?,
            MemInit::AllZero | MemInit::None => {
                if !dtype.is_generatable() {
                    return Err(LaunchError::unsupported(dtype, format!("tensor {name}")));
                }
                vec![0u8; elements * dtype.size_in_bytes() as usize]
            }
            MemInit::FromInitializer => {
                let bytes = initializer.ok_or_else(|| {
                    LaunchError::data(format!("tensor {name} requires an initializer"))
                })?;
                let expected = elements * dtype.size_in_bytes() as usize;
                if bytes.len() != expected {
                    return Err(LaunchError::data(format!(
                        "initializer for tensor {name} holds {} bytes, expected {expected}",
                        bytes.len()
                    )));
                }
                bytes.to_vec()
            }
        };
        self.entries.insert(
            name,
            Entry {
                dtype,
                shape: Shape::from_slice(shape),
                permutation: None,
                data: Some(Arc::from(data)),
            },
        );
        Ok(())
    }

    /// Registers a runtime shape for a tensor that carries no input data, such as an output.
    pub fn add_shape(&mut self, name: impl Into<String>, dtype: DType, shape: &[u64]) {
        self.entries.insert(
            name.into(),
            Entry {
                dtype,
                shape: Shape::from_slice(shape),
                permutation: None,
                data: None,
            },
        );
    }

    /// Overrides the runtime shape; the stored data is kept and truncated on read.
    pub fn set_shape(&mut self, name: &str, shape: &[u64]) -> LaunchResult<()> {
        self.entry_mut(name)?.shape = Shape::from_slice(shape);
        Ok(())
    }

    pub fn set_permutation(&mut self, name: &str, permutation: &[u8]) -> LaunchResult<()> {
        self.entry_mut(name)?.permutation = Some(Permutation::from_slice(permutation));
        Ok(())
    }

    pub fn set_buffer(&mut self, name: &str, data: Arc<[u8]>) -> LaunchResult<()> {
        self.entry_mut(name)?.data = Some(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> LaunchResult<&Entry> {
        self.entries
            .get(name)
            .ok_or_else(|| LaunchError::data(format!("unknown tensor {name}")))
    }

    fn entry_mut(&mut self, name: &str) -> LaunchResult<&mut Entry> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| LaunchError::data(format!("unknown tensor {name}")))
    }
}

impl DataProvider for ManualDataProvider {
    fn tensor_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn shape(&self, name: &str) -> LaunchResult<Shape> {
        Ok(self.entry(name)?.shape.clone())
    }

    fn permutation(&self, name: &str) -> LaunchResult<Option<Permutation>> {
        Ok(self.entry(name)?.permutation.clone())
    }

    fn dtype(&self, name: &str) -> LaunchResult<DType> {
        Ok(self.entry(name)?.dtype)
    }

    fn buffer(&self, name: &str) -> LaunchResult<Arc<[u8]>> {
        let entry = self.entry(name)?;
        let data = entry
            .data
            .as_ref()
            .ok_or_else(|| LaunchError::data(format!("tensor {name} has no data")))?;
        let size = checked_byte_size(&entry.shape, entry.dtype).map(usize::try_from);
        match size {
            Some(Ok(size)) if size < data.len() => Ok(Arc::from(&data[..size])),
            _ => Ok(Arc::clone(data)),
        }
    }
}

/// How [`SyntheticDataProvider`] fills tensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Generator {
    Uniform(f64),
    /// Seeded from the tensor name.
    Random { min: f64, max: f64 },
}

/// Generates data for every input of a recipe at its declared maximum shape.
#[derive(Debug, Clone)]
pub struct SyntheticDataProvider {
    inner: ManualDataProvider,
}

impl SyntheticDataProvider {
    pub fn from_recipe(recipe: &dyn Recipe, generator: Generator) -> LaunchResult<Self> {
        let mut inner = ManualDataProvider::new();
        for info in recipe.inputs() {
            if info.memory_kind() == MemoryKind::None {
                continue;
            }
            let elements = usize::try_from(element_count(&info.max_shape))
                .map_err(|_| LaunchError::data(format!("tensor {} is too large", info.name)))?;
            let data = match generator {
                Generator::Uniform(value) => uniform_buffer(info.dtype, elements, value)?,
                Generator::Random { min, max } => {
                    random_buffer(info.dtype, elements, min, max, name_seed(&info.name))?
                }
            };
            inner.entries.insert(
                info.name.clone(),
                Entry {
                    dtype: info.dtype,
                    shape: info.max_shape.clone(),
                    permutation: None,
                    data: Some(Arc::from(data)),
                },
            );
        }
        Ok(Self { inner })
    }

    pub fn set_shape(&mut self, name: &str, shape: &[u64]) -> LaunchResult<()> {
        self.inner.set_shape(name, shape)
    }
}

impl DataProvider for SyntheticDataProvider {
    fn tensor_names(&self) -> Vec<String> {
        self.inner.tensor_names()
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    fn shape(&self, name: &str) -> LaunchResult<Shape> {
        self.inner.shape(name)
    }

    fn permutation(&self, name: &str) -> LaunchResult<Option<Permutation>> {
        self.inner.permutation(name)
    }

    fn dtype(&self, name: &str) -> LaunchResult<DType> {
        self.inner.dtype(name)
    }

    fn buffer(&self, name: &str) -> LaunchResult<Arc<[u8]>> {
        self.inner.buffer(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_with_equal_names_hold_equal_bytes() {
        let mut first = ManualDataProvider::new();
        let mut second = ManualDataProvider::new();
        for provider in [&mut first, &mut second] {
            provider
                .add_tensor("x", DType::F32, &[8], MemInit::RandomWithNegative, None)
                .unwrap();
        }
        assert_eq!(first.buffer("x").unwrap(), second.buffer("x").unwrap());
    }

    #[test]
    fn shape_override_truncates_reads() {
        let mut provider = ManualDataProvider::new();
        provider
            .add_tensor("x", DType::F32, &[2, 4], MemInit::AllOnes, None)
            .unwrap();
        provider.set_shape("x", &[2, 2]).unwrap();
        assert_eq!(provider.buffer_size("x").unwrap(), 16);
        assert_eq!(provider.buffer("x").unwrap().len(), 16);

        let mut dst = vec![0xffu8; 32];
        provider.copy_buffer("x", &mut dst).unwrap();
        assert_eq!(&dst[..4], &1.0f32.to_le_bytes());
        assert!(dst[16..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn initializer_length_is_checked() {
        let mut provider = ManualDataProvider::new();
        let err = provider
            .add_tensor("w", DType::F32, &[2], MemInit::FromInitializer, Some(&[0u8; 4]))
            .unwrap_err();
        assert!(matches!(err, LaunchError::DataProvider(_)));
    }

    #[test]
    fn shape_only_entries_have_no_buffer() {
        let mut provider = ManualDataProvider::new();
        provider.add_shape("y", DType::Bf16, &[3]);
        assert!(provider.contains("y"));
        assert_eq!(provider.buffer_size("y").unwrap(), 6);
        assert!(provider.buffer("y").is_err());
    }
}
