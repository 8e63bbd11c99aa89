//! Differential testing of recipes compiled under two configurations.
//!
//! A [`DifferentialHarness`] forwards every graph construction call to two independent graphs,
//! keeps the id maps between them, runs both compiled recipes through the launch pipeline with
//! identical inputs and compares the outputs bit for bit.

pub mod compare;
pub mod harness;
pub mod mirror;
pub mod naming;
pub mod suite;

pub use compare::compare_buffers;
pub use harness::{DifferentialHarness, RunIndex, TensorSpec};
pub use mirror::{IdMap, Mirror};
pub use naming::NameSequence;

/// Instantiates the end-to-end pipeline suite for a device and a compiler it can run.
///
/// ```ignore
/// reciperun_difftest::define_pipeline_tests!(sim, SimDevice::shared, SimCompiler::new);
/// ```
#[macro_export]
macro_rules! define_pipeline_tests {
    ($module:ident, $device_ctor:expr, $compiler_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::suite;

            #[test]
            fn elementwise_add_matches() {
                suite::elementwise_add_matches(($device_ctor)(), ($compiler_ctor)());
            }

            #[test]
            fn const_scale_bias_matches_host_reference() {
                suite::const_scale_bias_matches_host_reference(
                    ($device_ctor)(),
                    ($compiler_ctor)(),
                );
            }

            #[test]
            fn chained_intermediates_match() {
                suite::chained_intermediates_match(($device_ctor)(), ($compiler_ctor)());
            }

            #[test]
            fn dynamic_shapes_match() {
                suite::dynamic_shapes_match(($device_ctor)(), ($compiler_ctor)());
            }

            #[test]
            fn node_dependencies_are_mirrored() {
                suite::node_dependencies_are_mirrored(($device_ctor)(), ($compiler_ctor)());
            }

            #[test]
            fn events_timing_collects_samples() {
                suite::events_timing_collects_samples(($device_ctor)(), ($compiler_ctor)());
            }
        }
    };
}
