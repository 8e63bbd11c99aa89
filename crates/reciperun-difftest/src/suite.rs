//! Device-agnostic end-to-end checks instantiated by [`define_pipeline_tests!`](crate::define_pipeline_tests).
//!
//! Every check builds its graph through a [`DifferentialHarness`] with identical configurations
//! on both tracks, so any mismatch points at the device or the launch pipeline.

use std::sync::Arc;

use reciperun::data::{DataProvider, MemInit};
use reciperun::device::Device;
use reciperun::dtype::DType;
use reciperun::graph::GraphCompiler;
use reciperun::runtime::{LaunchOptions, Measurement};

use crate::harness::{DifferentialHarness, RunIndex, TensorSpec};

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn harness<C: GraphCompiler>(device: Arc<dyn Device>, compiler: C) -> DifferentialHarness<C> {
    DifferentialHarness::new(compiler, device)
        .unwrap()
        .with_options(LaunchOptions::default().with_measurement(Measurement::None))
}

fn input_values<C: GraphCompiler>(harness: &DifferentialHarness<C>, tensor: u64) -> Vec<f32> {
    let name = harness.tensor_name(tensor).unwrap();
    f32_values(&harness.data_provider().buffer(name).unwrap())
}

fn output_values<C: GraphCompiler>(harness: &DifferentialHarness<C>, tensor: u64) -> Vec<f32> {
    f32_values(harness.output(RunIndex::First, tensor).unwrap())
}

pub fn elementwise_add_matches<C: GraphCompiler>(device: Arc<dyn Device>, compiler: C) {
    let mut h = harness(device, compiler);
    let a = h.create_tensor(TensorSpec::input(DType::F32, &[4])).unwrap();
    let b = h.create_tensor(TensorSpec::input(DType::F32, &[4])).unwrap();
    let out = h.create_tensor(TensorSpec::output(DType::F32, &[4])).unwrap();
    h.add_node("add_f32", &[a, b], &[out], &[]).unwrap();

    h.assert_runs_match(&[out]);

    let expected: Vec<f32> = input_values(&h, a)
        .iter()
        .zip(input_values(&h, b))
        .map(|(x, y)| x + y)
        .collect();
    assert_eq!(output_values(&h, out), expected);
}

pub fn const_scale_bias_matches_host_reference<C: GraphCompiler>(
    device: Arc<dyn Device>,
    compiler: C,
) {
    let mut h = harness(device, compiler);
    let x = h.create_tensor(TensorSpec::input(DType::F32, &[8])).unwrap();
    let section = h.create_const_section().unwrap();
    let scale = h
        .create_const_persistent_tensor(
            section,
            0,
            TensorSpec::input(DType::F32, &[1]).initializer(2.0f32.to_le_bytes()),
        )
        .unwrap();
    let bias = h
        .create_const_persistent_tensor(
            section,
            4,
            TensorSpec::input(DType::F32, &[1]).initializer(0.5f32.to_le_bytes()),
        )
        .unwrap();
    let out = h.create_tensor(TensorSpec::output(DType::F32, &[8])).unwrap();
    h.add_node("scale_bias_f32", &[x, scale, bias], &[out], &[])
        .unwrap();

    h.assert_runs_match(&[out]);

    let expected: Vec<f32> = input_values(&h, x).iter().map(|v| v * 2.0 + 0.5).collect();
    assert_eq!(output_values(&h, out), expected);
}

pub fn chained_intermediates_match<C: GraphCompiler>(device: Arc<dyn Device>, compiler: C) {
    let mut h = harness(device, compiler);
    let x = h.create_tensor(TensorSpec::input(DType::F32, &[16])).unwrap();
    let y = h
        .create_tensor(TensorSpec::input(DType::F32, &[16]).with_init(MemInit::AllOnes))
        .unwrap();
    let hidden = h
        .create_tensor(TensorSpec::intermediate(DType::F32, &[16]))
        .unwrap();
    let out = h.create_tensor(TensorSpec::output(DType::F32, &[16])).unwrap();
    h.add_node("relu_f32", &[x], &[hidden], &[]).unwrap();
    h.add_node("add_f32", &[hidden, y], &[out], &[]).unwrap();

    h.assert_runs_match(&[out]);

    let expected: Vec<f32> = input_values(&h, x)
        .iter()
        .map(|v| v.max(0.0) + 1.0)
        .collect();
    assert_eq!(output_values(&h, out), expected);
}

pub fn dynamic_shapes_match<C: GraphCompiler>(device: Arc<dyn Device>, compiler: C) {
    let mut h = harness(device, compiler);
    let x = h
        .create_tensor(TensorSpec::input(DType::F32, &[8]).with_min_shape(&[1]))
        .unwrap();
    let y = h
        .create_tensor(TensorSpec::input(DType::F32, &[8]).with_min_shape(&[1]))
        .unwrap();
    let out = h
        .create_tensor(TensorSpec::output(DType::F32, &[8]).with_min_shape(&[1]))
        .unwrap();
    h.add_node("mul_f32", &[x, y], &[out], &[]).unwrap();
    for tensor in [x, y, out] {
        h.set_actual_sizes(tensor, &[5]).unwrap();
    }

    h.assert_runs_match(&[out]);

    let outcome = h.outcome(RunIndex::First).unwrap();
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
    let expected: Vec<f32> = input_values(&h, x)
        .iter()
        .zip(input_values(&h, y))
        .map(|(a, b)| a * b)
        .collect();
    assert_eq!(expected.len(), 5);
    assert_eq!(output_values(&h, out)[..5], expected[..]);
}

pub fn node_dependencies_are_mirrored<C: GraphCompiler>(device: Arc<dyn Device>, compiler: C) {
    let mut h = harness(device, compiler);
    let x = h.create_tensor(TensorSpec::input(DType::F32, &[4])).unwrap();
    let left = h.create_tensor(TensorSpec::output(DType::F32, &[4])).unwrap();
    let right = h.create_tensor(TensorSpec::output(DType::F32, &[4])).unwrap();
    let first = h.add_node("identity_f32", &[x], &[left], &[]).unwrap();
    let second = h.add_node("relu_f32", &[x], &[right], &[]).unwrap();
    h.set_node_dependency(&[second], &[first]).unwrap();

    assert_eq!(h.mirror().nodes.len(), 2);
    assert!(h.mirror().nodes.get(first).is_ok());
    h.assert_runs_match(&[left, right]);
    assert_eq!(output_values(&h, left), input_values(&h, x));
}

pub fn events_timing_collects_samples<C: GraphCompiler>(device: Arc<dyn Device>, compiler: C) {
    let mut h = DifferentialHarness::new(compiler, device).unwrap().with_options(
        LaunchOptions::default()
            .with_measurement(Measurement::Events)
            .with_iterations(4)
            .with_keep_going(false),
    );
    let a = h
        .create_tensor(TensorSpec::input(DType::F32, &[64]).with_init(MemInit::RandomPositive))
        .unwrap();
    let out = h.create_tensor(TensorSpec::output(DType::F32, &[64])).unwrap();
    h.add_node("relu_f32", &[a], &[out], &[]).unwrap();

    h.assert_runs_match(&[out]);

    for run in [RunIndex::First, RunIndex::Second] {
        let outcome = h.outcome(run).unwrap();
        assert!(outcome.durations_ns.len() >= 4);
        assert!(outcome.durations_ns.iter().all(|ns| *ns > 0.0));
    }
}
