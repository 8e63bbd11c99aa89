//! Launch pipeline for compiled accelerator recipes.
//!
//! A [`Recipe`](recipe::Recipe) is executed on a [`Device`](device::Device) by the
//! [`ExecutionPipeline`](runtime::ExecutionPipeline): device sections are sized and allocated,
//! constant sections are downloaded once, inputs are staged over a dedicated stream, the recipe
//! is launched and optionally timed, and outputs are handed to an [`OutputSink`](sink::OutputSink).

extern crate self as reciperun;

pub mod data;
pub mod device;
pub mod dtype;
mod env;
pub mod error;
pub mod graph;
pub mod recipe;
pub mod runtime;
pub mod sink;
pub mod tensor;

pub use device::{Device, DeviceBuffer, Event, Stream};
pub use dtype::DType;
pub use error::{LaunchError, LaunchResult};
pub use recipe::{Recipe, RecipeTensorInfo, SectionId, SectionProps, StaticRecipe, TensorId};
pub use runtime::{ExecutionPipeline, LaunchOptions, LaunchOutcome, Measurement};
pub use tensor::{MemoryKind, Shape, TensorKind};
