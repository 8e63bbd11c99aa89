//! Recipe execution: planning, staging, launching and timing.

pub mod const_sections;
pub mod launch_info;
mod measurement;
mod outcome;
pub mod pipeline;
pub mod sections;
pub mod timing;

pub use const_sections::{ConstSectionCache, ConstSectionInfo};
pub use launch_info::{LaunchDescriptorBuilder, LaunchDescriptors};
pub use measurement::{LaunchOptions, Measurement};
pub use outcome::LaunchOutcome;
pub use pipeline::{launch, launch_on, ExecutionPipeline};
pub use sections::{SectionPlan, SectionPlanner};
pub use timing::{filter_elapsed_times, poll_elapsed_times, TimingSampler};
