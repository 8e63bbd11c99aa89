use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use proptest::prelude::*;
use reciperun::data::{DataProvider, MemInit};
use reciperun::device::Device;
use reciperun::dtype::DType;
use reciperun::error::{LaunchError, LaunchResult};
use reciperun::graph::{GraphCompiler, NodeDesc, TensorDesc};
use reciperun::recipe::{NodeId, Recipe, SectionId, TensorId};
use reciperun::runtime::{LaunchOptions, Measurement};
use reciperun_difftest::{DifferentialHarness, RunIndex, TensorSpec};
use reciperun_sim::{
    SimCompiler, SimDevice, SimGraph, CONFIG_OUTPUT_ROUNDING, CONFIG_PACK_SECTIONS,
    CONFIG_SCHEDULE, CONFIG_WORKSPACE_PADDING,
};

fn untimed() -> LaunchOptions {
    LaunchOptions::default().with_measurement(Measurement::None)
}

fn sim_harness() -> Result<(Arc<SimDevice>, DifferentialHarness<SimCompiler>)> {
    let sim = Arc::new(SimDevice::default());
    let device: Arc<dyn Device> = sim.clone();
    let harness = DifferentialHarness::new(SimCompiler::new(), device)?.with_options(untimed());
    Ok((sim, harness))
}

#[derive(Debug, Clone)]
struct FlaggedGraph {
    graph: SimGraph,
    second: bool,
}

/// Wraps [`SimCompiler`]; the second graph it creates rejects new tensors and nodes while
/// `reject` is set.
struct SecondGraphRejects {
    inner: SimCompiler,
    graphs: AtomicUsize,
    reject: Arc<AtomicBool>,
}

impl SecondGraphRejects {
    fn new(reject: Arc<AtomicBool>) -> Self {
        Self {
            inner: SimCompiler::new(),
            graphs: AtomicUsize::new(0),
            reject,
        }
    }

    fn check(&self, graph: &FlaggedGraph, op: &'static str) -> LaunchResult<()> {
        if graph.second && self.reject.load(Ordering::Relaxed) {
            return Err(LaunchError::device(op, "rejected by the second graph"));
        }
        Ok(())
    }
}

impl GraphCompiler for SecondGraphRejects {
    type Graph = FlaggedGraph;

    fn create_graph(&self) -> LaunchResult<FlaggedGraph> {
        Ok(FlaggedGraph {
            graph: self.inner.create_graph()?,
            second: self.graphs.fetch_add(1, Ordering::Relaxed) == 1,
        })
    }

    fn create_section(&self, graph: &mut FlaggedGraph, is_const: bool) -> LaunchResult<SectionId> {
        self.inner.create_section(&mut graph.graph, is_const)
    }

    fn create_tensor(&self, graph: &mut FlaggedGraph, desc: &TensorDesc) -> LaunchResult<TensorId> {
        self.check(graph, "create_tensor")?;
        self.inner.create_tensor(&mut graph.graph, desc)
    }

    fn add_node(&self, graph: &mut FlaggedGraph, node: &NodeDesc<'_>) -> LaunchResult<NodeId> {
        self.check(graph, "add_node")?;
        self.inner.add_node(&mut graph.graph, node)
    }

    fn set_node_dependency(
        &self,
        graph: &mut FlaggedGraph,
        blocking: &[NodeId],
        blocked: &[NodeId],
    ) -> LaunchResult<()> {
        self.inner
            .set_node_dependency(&mut graph.graph, blocking, blocked)
    }

    fn compile(
        &self,
        graph: &FlaggedGraph,
        name: &str,
        config: &[(String, String)],
    ) -> LaunchResult<Arc<dyn Recipe>> {
        self.inner.compile(&graph.graph, name, config)
    }
}

/// relu(a) * b + c over `len` elements, with the product kept in the workspace.
fn build_chain(harness: &mut DifferentialHarness<SimCompiler>, len: u64) -> Result<u64> {
    let a = harness.create_tensor(TensorSpec::input(DType::F32, &[len]))?;
    let b = harness.create_tensor(TensorSpec::input(DType::F32, &[len]))?;
    let c = harness.create_tensor(TensorSpec::input(DType::F32, &[len]))?;
    let relu = harness.create_tensor(TensorSpec::intermediate(DType::F32, &[len]))?;
    let product = harness.create_tensor(TensorSpec::intermediate(DType::F32, &[len]))?;
    let out = harness.create_tensor(TensorSpec::output(DType::F32, &[len]))?;
    harness.add_node("relu_f32", &[a], &[relu], &[])?;
    harness.add_node("mul_f32", &[relu, b], &[product], &[])?;
    harness.add_node("add_f32", &[product, c], &[out], &[])?;
    Ok(out)
}

#[test]
fn structural_configurations_do_not_change_results() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 32)?;
    harness.add_configuration_to_run(RunIndex::Second, CONFIG_SCHEDULE, "reverse")?;
    harness.add_configuration_to_run(RunIndex::Second, CONFIG_PACK_SECTIONS, "true")?;
    harness.add_configuration_to_run(RunIndex::Second, CONFIG_WORKSPACE_PADDING, "4096")?;
    harness.compare_runs_results(&[out])?;
    Ok(())
}

#[test]
fn bf16_rounding_is_reported_as_mismatch() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 32)?;
    harness.add_configuration_to_run(RunIndex::Second, CONFIG_OUTPUT_ROUNDING, "bf16")?;
    match harness.compare_runs_results(&[out]) {
        Err(LaunchError::DataMismatch { tensor, .. }) => {
            assert_eq!(Some(tensor.as_str()), harness.tensor_name(out));
        }
        other => panic!("expected a data mismatch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn global_configuration_reaches_both_tracks() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 8)?;
    harness.add_global_configuration(CONFIG_OUTPUT_ROUNDING, "bf16")?;
    harness.compare_runs_results(&[out])?;
    Ok(())
}

#[test]
fn track_configuration_overrides_global() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 32)?;
    harness.add_global_configuration(CONFIG_OUTPUT_ROUNDING, "bf16")?;
    harness.add_configuration_to_run(RunIndex::First, CONFIG_OUTPUT_ROUNDING, "none")?;
    assert!(matches!(
        harness.compare_runs_results(&[out]),
        Err(LaunchError::DataMismatch { .. })
    ));
    Ok(())
}

#[test]
fn const_section_is_downloaded_once_per_run() -> Result<()> {
    let (sim, mut harness) = sim_harness()?;
    let x = harness.create_tensor(TensorSpec::input(DType::F32, &[1]))?;
    let section = harness.create_const_section()?;
    let scale = harness.create_const_persistent_tensor(
        section,
        0,
        TensorSpec::input(DType::F32, &[1]).named("scale"),
    )?;
    let bias = harness.create_const_persistent_tensor(
        section,
        64,
        TensorSpec::input(DType::F32, &[1]).named("bias"),
    )?;
    let out = harness.create_tensor(TensorSpec::output(DType::F32, &[1]))?;
    harness.add_node("scale_bias_f32", &[x, scale, bias], &[out], &[])?;

    harness.compare_runs_results(&[out])?;

    assert_eq!(harness.mirror().sections.len(), 3);
    let stats = sim.stats()?;
    assert_eq!(stats.host_maps, 2);
    // Per run: the const section once and `x` once.
    assert_eq!(stats.host_to_device_copies, 4);
    Ok(())
}

#[test]
fn runs_happen_once() -> Result<()> {
    let (sim, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 4)?;
    harness.compare_runs_results(&[out])?;
    let launches = sim.stats()?.launches;
    harness.compare_runs_results(&[out])?;
    assert_eq!(sim.stats()?.launches, launches);
    assert_eq!(launches, 2);
    Ok(())
}

#[test]
fn construction_after_run_is_rejected() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 4)?;
    harness.compare_runs_results(&[out])?;
    let err = harness
        .create_tensor(TensorSpec::input(DType::F32, &[4]))
        .unwrap_err();
    assert!(err.is_contract_violation());
    Ok(())
}

#[test]
fn late_configuration_is_rejected() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 4)?;
    harness.compare_runs_results(&[out])?;

    let err = harness
        .add_global_configuration(CONFIG_OUTPUT_ROUNDING, "bf16")
        .unwrap_err();
    assert!(err.is_contract_violation());
    let err = harness
        .add_configuration_to_run(RunIndex::Second, CONFIG_OUTPUT_ROUNDING, "bf16")
        .unwrap_err();
    assert!(err.is_contract_violation());
    harness.compare_runs_results(&[out])?;
    Ok(())
}

#[test]
fn failed_run_is_not_repeated() -> Result<()> {
    let (sim, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 4)?;
    harness.add_configuration_to_run(RunIndex::Second, "SIM_UNKNOWN", "1")?;

    let first = harness.compare_runs_results(&[out]).unwrap_err();
    assert!(first.is_contract_violation());
    assert_eq!(sim.stats()?.launches, 1);

    let again = harness.compare_runs_results(&[out]).unwrap_err();
    assert_eq!(again.to_string(), first.to_string());
    assert_eq!(sim.stats()?.launches, 1);
    assert!(harness.outcome(RunIndex::First).is_none());
    assert!(harness
        .create_tensor(TensorSpec::input(DType::F32, &[4]))
        .unwrap_err()
        .is_contract_violation());
    Ok(())
}

#[test]
fn second_track_failure_rolls_back_both_tracks() -> Result<()> {
    let reject = Arc::new(AtomicBool::new(false));
    let mut harness = DifferentialHarness::new(
        SecondGraphRejects::new(Arc::clone(&reject)),
        SimDevice::shared(),
    )?
    .with_options(untimed());
    let x = harness.create_tensor(TensorSpec::input(DType::F32, &[4]).named("x"))?;
    let tensors = harness.graph(RunIndex::First).graph.tensor_count();
    let sections = harness.mirror().sections.len();

    reject.store(true, Ordering::Relaxed);
    let err = harness
        .create_tensor(TensorSpec::input(DType::F32, &[4]).named("y"))
        .unwrap_err();
    assert!(matches!(err, LaunchError::Device { op: "create_tensor", .. }));
    assert_eq!(harness.graph(RunIndex::First).graph.tensor_count(), tensors);
    assert_eq!(harness.mirror().tensors.len(), 1);
    assert_eq!(harness.mirror().sections.len(), sections);
    assert!(!harness.data_provider().contains("y"));
    assert!(harness.tensor_name(x).is_some());

    reject.store(false, Ordering::Relaxed);
    let y = harness.create_tensor(TensorSpec::input(DType::F32, &[4]).named("y"))?;
    let out = harness.create_tensor(TensorSpec::output(DType::F32, &[4]))?;

    reject.store(true, Ordering::Relaxed);
    assert!(harness.add_node("add_f32", &[x, y], &[out], &[]).is_err());
    assert_eq!(harness.graph(RunIndex::First).graph.node_count(), 0);
    assert!(harness.mirror().nodes.is_empty());

    reject.store(false, Ordering::Relaxed);
    harness.add_node("add_f32", &[x, y], &[out], &[])?;
    harness.compare_runs_results(&[out])?;
    Ok(())
}

#[test]
fn unmirrored_ids_are_contract_violations() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 4)?;
    let bogus = out + 1_000;
    let err = harness.add_node("relu_f32", &[bogus], &[out], &[]).unwrap_err();
    assert!(err.is_contract_violation());
    let err = harness.set_node_dependency(&[bogus], &[]).unwrap_err();
    assert!(err.is_contract_violation());
    let err = harness.compare_runs_results(&[bogus]).unwrap_err();
    assert!(err.is_contract_violation());
    Ok(())
}

#[test]
fn mirror_is_complete() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    build_chain(&mut harness, 16)?;
    harness.create_host_shape_tensor(DType::U32, &[2])?;

    let mirror = harness.mirror();
    assert_eq!(mirror.tensors.len(), 7);
    assert_eq!(mirror.nodes.len(), 3);
    for (first, second) in mirror.tensors.iter() {
        let a = harness.graph(RunIndex::First).tensor(first).unwrap();
        let b = harness.graph(RunIndex::Second).tensor(second).unwrap();
        assert_ne!(first, second);
        assert_eq!(a.name, b.name);
        assert_eq!(a.dtype, b.dtype);
        assert_eq!(a.max_shape, b.max_shape);
        assert_eq!(a.min_shape, b.min_shape);
        assert_eq!(a.kind, b.kind);
    }
    Ok(())
}

#[test]
fn host_shape_tensor_reaches_launch() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let out = build_chain(&mut harness, 4)?;
    harness.create_host_shape_tensor(DType::U32, &[1])?;
    harness.compare_runs_results(&[out])?;
    let outcome = harness.outcome(RunIndex::Second).unwrap();
    assert!(outcome.warnings.is_empty());
    Ok(())
}

#[test]
fn duplicate_names_are_rejected() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    harness.create_tensor(TensorSpec::input(DType::F32, &[4]).named("x"))?;
    let err = harness
        .create_tensor(TensorSpec::output(DType::F32, &[4]).named("x"))
        .unwrap_err();
    assert!(err.is_contract_violation());
    Ok(())
}

#[test]
fn actual_sizes_limit_comparison() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let x = harness.create_tensor(
        TensorSpec::input(DType::Bf16, &[16])
            .with_min_shape(&[1])
            .with_init(MemInit::RandomPositive),
    )?;
    let out = harness.create_tensor(TensorSpec::output(DType::Bf16, &[16]).with_min_shape(&[1]))?;
    harness.add_node("identity_bf16", &[x], &[out], &[])?;
    harness.set_actual_sizes(x, &[3])?;
    harness.set_actual_sizes(out, &[3])?;
    harness.compare_runs_results(&[out])?;

    let first = harness.output(RunIndex::First, out).unwrap();
    assert_eq!(first.len(), 32);
    assert!(first[6..].iter().all(|byte| *byte == 0));
    Ok(())
}

#[test]
fn out_of_range_actual_size_warns_but_runs() -> Result<()> {
    let (_, mut harness) = sim_harness()?;
    let x = harness.create_tensor(TensorSpec::input(DType::F32, &[8]).with_min_shape(&[4]))?;
    let out = harness.create_tensor(TensorSpec::output(DType::F32, &[8]))?;
    harness.add_node("identity_f32", &[x], &[out], &[])?;
    harness.set_actual_sizes(x, &[2])?;
    harness.compare_runs_results(&[out])?;
    let outcome = harness.outcome(RunIndex::First).unwrap();
    assert_eq!(
        outcome.warnings,
        vec![format!(
            "invalid shape for tensor: {} in dim 0, actual size: 2, min size is: 4 and max size is: 8",
            harness.tensor_name(x).unwrap()
        )]
    );
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn identical_configurations_never_mismatch(len in 1u64..64, reverse in any::<bool>()) {
        let (_, mut harness) = sim_harness().unwrap();
        let out = build_chain(&mut harness, len).unwrap();
        if reverse {
            harness.add_global_configuration(CONFIG_SCHEDULE, "reverse").unwrap();
        }
        prop_assert!(harness.compare_runs_results(&[out]).is_ok());
    }
}
