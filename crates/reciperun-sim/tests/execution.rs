use std::sync::Arc;

use anyhow::Result;
use reciperun::data::{DataProvider, ManualDataProvider, MemInit};
use reciperun::device::Device;
use reciperun::dtype::DType;
use reciperun::graph::{GraphCompiler, NodeDesc, SectionPlacement, TensorDesc};
use reciperun::recipe::Recipe;
use reciperun::runtime::{launch, LaunchOptions, Measurement};
use reciperun::sink::DataCollector;
use reciperun::tensor::{Shape, TensorKind};
use reciperun_sim::{SimCompiler, SimDevice, SimGraph, SimRecipe, CONFIG_PACK_SECTIONS, CONFIG_SCHEDULE};

fn desc(name: &str, dtype: DType, len: u64, placement: Option<SectionPlacement>) -> TensorDesc {
    TensorDesc {
        name: name.to_string(),
        dtype,
        kind: TensorKind::Data,
        max_shape: Shape::from_slice(&[len]),
        min_shape: Shape::from_slice(&[len]),
        placement,
        const_data: None,
    }
}

fn persistent(compiler: &SimCompiler, graph: &mut SimGraph, name: &str, dtype: DType) -> Result<u64> {
    let section = compiler.create_section(graph, false)?;
    let placement = SectionPlacement { section, offset: 0 };
    Ok(compiler.create_tensor(graph, &desc(name, dtype, 8, Some(placement)))?)
}

fn node(compiler: &SimCompiler, graph: &mut SimGraph, guid: &str, inputs: &[u64], output: u64) -> Result<u64> {
    Ok(compiler.add_node(
        graph,
        &NodeDesc {
            guid,
            name: guid,
            inputs,
            outputs: &[output],
            params: &[],
        },
    )?)
}

/// `out = (a - b) * relu(a)` in bf16 with both temporaries in the workspace.
fn diamond(compiler: &SimCompiler) -> Result<SimGraph> {
    let mut graph = compiler.create_graph()?;
    let a = persistent(compiler, &mut graph, "a", DType::Bf16)?;
    let b = persistent(compiler, &mut graph, "b", DType::Bf16)?;
    let out = persistent(compiler, &mut graph, "out", DType::Bf16)?;
    let diff = compiler.create_tensor(&mut graph, &desc("diff", DType::Bf16, 8, None))?;
    let pos = compiler.create_tensor(&mut graph, &desc("pos", DType::Bf16, 8, None))?;
    node(compiler, &mut graph, "sub_bf16", &[a, b], diff)?;
    node(compiler, &mut graph, "relu_bf16", &[a], pos)?;
    node(compiler, &mut graph, "mul_bf16", &[diff, pos], out)?;
    Ok(graph)
}

fn run(device: &Arc<dyn Device>, recipe: &dyn Recipe, provider: &ManualDataProvider) -> Result<Arc<[u8]>> {
    let mut collector = DataCollector::new();
    launch(
        device,
        recipe,
        Some(provider as &dyn DataProvider),
        Some(&mut collector),
        &LaunchOptions::default().with_measurement(Measurement::None),
    )?;
    Ok(Arc::clone(collector.get("out").expect("output collected")))
}

#[test]
fn structural_options_keep_results() -> Result<()> {
    let compiler = SimCompiler::new();
    let graph = diamond(&compiler)?;
    let device = SimDevice::shared();
    let mut provider = ManualDataProvider::new();
    provider.add_tensor("a", DType::Bf16, &[8], MemInit::RandomWithNegative, None)?;
    provider.add_tensor("b", DType::Bf16, &[8], MemInit::RandomPositive, None)?;

    let plain = compiler.compile(&graph, "plain", &[])?;
    let shuffled = compiler.compile(
        &graph,
        "shuffled",
        &[
            (CONFIG_SCHEDULE.to_string(), "reverse".to_string()),
            (CONFIG_PACK_SECTIONS.to_string(), "true".to_string()),
        ],
    )?;
    let schedule = shuffled
        .as_any()
        .downcast_ref::<SimRecipe>()
        .expect("simulator recipe")
        .schedule();
    assert_eq!(schedule.last(), Some(&"mul_bf16"));
    assert_eq!(plain.workspace_size(), 128);

    let expected = run(&device, plain.as_ref(), &provider)?;
    let actual = run(&device, shuffled.as_ref(), &provider)?;
    assert_eq!(expected, actual);
    Ok(())
}

#[test]
fn results_follow_the_graph() -> Result<()> {
    let compiler = SimCompiler::new();
    let graph = diamond(&compiler)?;
    let recipe = compiler.compile(&graph, "diamond", &[])?;
    let device = SimDevice::shared();
    let values = [-1.5f32, -0.5, 0.0, 0.25, 0.5, 1.0, 1.5, 2.0];
    let a: Vec<u8> = values
        .iter()
        .flat_map(|v| half::bf16::from_f32(*v).to_le_bytes())
        .collect();
    let mut provider = ManualDataProvider::new();
    provider.add_tensor("a", DType::Bf16, &[8], MemInit::FromInitializer, Some(&a))?;
    provider.add_tensor("b", DType::Bf16, &[8], MemInit::AllOnes, None)?;

    let out = run(&device, recipe.as_ref(), &provider)?;
    let got: Vec<f32> = out
        .chunks_exact(2)
        .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
        .collect();
    let expected: Vec<f32> = values.iter().map(|v| (v - 1.0) * v.max(0.0)).collect();
    assert_eq!(got, expected);
    Ok(())
}

#[test]
fn unsupported_operand_type_fails_the_launch() -> Result<()> {
    let compiler = SimCompiler::new();
    let mut graph = compiler.create_graph()?;
    let x = persistent(&compiler, &mut graph, "x", DType::I32)?;
    let y = persistent(&compiler, &mut graph, "y", DType::I32)?;
    node(&compiler, &mut graph, "identity", &[x], y)?;
    let recipe = compiler.compile(&graph, "ints", &[])?;
    let err = launch(
        &SimDevice::shared(),
        recipe.as_ref(),
        None,
        None,
        &LaunchOptions::default().with_measurement(Measurement::None),
    )
    .unwrap_err();
    assert!(err.is_contract_violation());
    Ok(())
}

#[test]
fn unknown_guid_is_rejected() -> Result<()> {
    let compiler = SimCompiler::new();
    let mut graph = compiler.create_graph()?;
    let x = persistent(&compiler, &mut graph, "x", DType::F32)?;
    let y = persistent(&compiler, &mut graph, "y", DType::F32)?;
    let err = node(&compiler, &mut graph, "softmax_f32", &[x], y).unwrap_err();
    assert!(err.to_string().contains("unsupported guid softmax_f32"));
    Ok(())
}
