//! Simulated device and reference graph compiler.
//!
//! [`SimDevice`] keeps device memory in host RAM, executes every stream operation immediately
//! in submission order and advances a per-stream virtual clock, so event timings and profiler
//! traces are deterministic. [`SimCompiler`] builds small elementwise graphs into
//! [`SimRecipe`]s the device knows how to run.

mod compiler;
mod device;
mod memory;
mod ops;

pub use compiler::{
    SimCompiler, SimGraph, SimRecipe, CONFIG_OUTPUT_ROUNDING, CONFIG_PACK_SECTIONS,
    CONFIG_SCHEDULE, CONFIG_WORKSPACE_PADDING,
};
pub use device::{
    register_sim_device, register_sim_device_in, ElapsedFault, SimDevice, SimDeviceConfig,
    SimStats, SIM_DEVICE_KIND,
};
pub use ops::OpKind;
