//! Reference graph compiler producing [`SimRecipe`]s.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reciperun::dtype::DType;
use reciperun::error::{LaunchError, LaunchResult};
use reciperun::graph::{GraphCompiler, NodeDesc, TensorDesc};
use reciperun::recipe::{NodeId, Recipe, RecipeTensorInfo, SectionId, SectionProps, TensorId};
use reciperun::runtime::sections::align_up;
use reciperun::tensor::{checked_byte_size, element_count, MemoryKind};

use crate::ops::OpKind;

/// `forward` (default) or `reverse`: tie-break order among ready nodes.
pub const CONFIG_SCHEDULE: &str = "SIM_SCHEDULE";
/// `true` relocates every mutable persistent tensor into one section.
pub const CONFIG_PACK_SECTIONS: &str = "SIM_PACK_SECTIONS";
/// Extra workspace bytes reserved beyond the intermediates.
pub const CONFIG_WORKSPACE_PADDING: &str = "SIM_WORKSPACE_PADDING";
/// `none` (default) or `bf16`: rounds every result to bf16 precision.
pub const CONFIG_OUTPUT_ROUNDING: &str = "SIM_OUTPUT_ROUNDING";

const TENSOR_ALIGNMENT: u64 = 64;
const SECTION_STRIDE: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Schedule {
    #[default]
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, Default)]
struct CompileConfig {
    schedule: Schedule,
    pack_sections: bool,
    workspace_padding: u64,
    round_bf16: bool,
}

impl CompileConfig {
    fn parse(config: &[(String, String)]) -> LaunchResult<Self> {
        let mut parsed = Self::default();
        let invalid = |key: &str, value: &str| {
            LaunchError::contract(format!("invalid value {value:?} for configuration {key}"))
        };
        for (key, value) in config {
            match key.as_str() {
                CONFIG_SCHEDULE => {
                    parsed.schedule = match value.as_str() {
                        "forward" => Schedule::Forward,
                        "reverse" => Schedule::Reverse,
                        _ => return Err(invalid(key.as_str(), value.as_str())),
                    }
                }
                CONFIG_PACK_SECTIONS => {
                    parsed.pack_sections = value.parse().map_err(|_| invalid(key.as_str(), value.as_str()))?
                }
                CONFIG_WORKSPACE_PADDING => {
                    parsed.workspace_padding = value.parse().map_err(|_| invalid(key.as_str(), value.as_str()))?
                }
                CONFIG_OUTPUT_ROUNDING => {
                    parsed.round_bf16 = match value.as_str() {
                        "none" => false,
                        "bf16" => true,
                        _ => return Err(invalid(key.as_str(), value.as_str())),
                    }
                }
                other => {
                    return Err(LaunchError::contract(format!(
                        "unknown configuration key {other}"
                    )))
                }
            }
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone)]
struct GraphNode {
    op: OpKind,
    name: String,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    blocked_by: BTreeSet<NodeId>,
}

/// Graph under construction; one independent id arena per instance.
#[derive(Debug, Clone)]
pub struct SimGraph {
    ordinal: u64,
    tensors: BTreeMap<TensorId, TensorDesc>,
    sections: BTreeMap<SectionId, bool>,
    nodes: BTreeMap<NodeId, GraphNode>,
    next_tensor: u64,
    next_node: u64,
    next_section: u32,
}

impl SimGraph {
    fn new(ordinal: u64) -> Self {
        Self {
            ordinal,
            tensors: BTreeMap::new(),
            sections: BTreeMap::new(),
            nodes: BTreeMap::new(),
            next_tensor: 0,
            next_node: 0,
            next_section: 0,
        }
    }

    pub fn tensor(&self, id: TensorId) -> Option<&TensorDesc> {
        self.tensors.get(&id)
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn section_is_const(&self, section: SectionId) -> Option<bool> {
        self.sections.get(&section).copied()
    }

    /// Operator and tensor operands of a node.
    pub fn node(&self, id: NodeId) -> Option<(OpKind, &[TensorId], &[TensorId])> {
        self.nodes
            .get(&id)
            .map(|node| (node.op, node.inputs.as_slice(), node.outputs.as_slice()))
    }

    /// Nodes that must complete before `id` runs.
    pub fn dependencies(&self, id: NodeId) -> Option<Vec<NodeId>> {
        self.nodes
            .get(&id)
            .map(|node| node.blocked_by.iter().copied().collect())
    }

    fn check_tensor(&self, id: TensorId) -> LaunchResult<&TensorDesc> {
        self.tensors
            .get(&id)
            .ok_or_else(|| LaunchError::contract(format!("unknown tensor id {id:#x}")))
    }

    fn check_node(&self, id: NodeId) -> LaunchResult<()> {
        if self.nodes.contains_key(&id) {
            Ok(())
        } else {
            Err(LaunchError::contract(format!("unknown node id {id:#x}")))
        }
    }
}

/// Compiled simulator program.
#[derive(Debug, Clone)]
pub struct SimRecipe {
    name: String,
    tensors: Vec<RecipeTensorInfo>,
    sections: BTreeMap<SectionId, SectionProps>,
    workspace_size: u64,
    pub(crate) program: Vec<Instruction>,
    /// Workspace offset, dtype and element count of every intermediate.
    pub(crate) intermediates: HashMap<TensorId, (u64, DType, u64)>,
    pub(crate) dtypes: HashMap<TensorId, DType>,
    pub(crate) round_bf16: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Instruction {
    pub(crate) op: OpKind,
    pub(crate) name: String,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
}

impl SimRecipe {
    /// Node names in execution order.
    pub fn schedule(&self) -> Vec<&str> {
        self.program.iter().map(|inst| inst.name.as_str()).collect()
    }

    pub fn section_ids(&self) -> Vec<SectionId> {
        self.sections.keys().copied().collect()
    }
}

impl Recipe for SimRecipe {
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

/// Compiler for [`SimGraph`]s.
#[derive(Debug, Default)]
pub struct SimCompiler {
    graphs: AtomicU64,
}

impl SimCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphCompiler for SimCompiler {
    type Graph = SimGraph;

    fn create_graph(&self) -> LaunchResult<SimGraph> {
        let ordinal = self.graphs.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SimGraph::new(ordinal))
    }

    fn create_section(&self, graph: &mut SimGraph, is_const: bool) -> LaunchResult<SectionId> {
        let index = graph.next_section;
        if index >= SECTION_STRIDE - 1 {
            return Err(LaunchError::contract("too many sections in one graph"));
        }
        graph.next_section += 1;
        let id = (graph.ordinal as u32 % SECTION_STRIDE) * SECTION_STRIDE + index + 1;
        graph.sections.insert(id, is_const);
        Ok(id)
    }

    fn create_tensor(&self, graph: &mut SimGraph, desc: &TensorDesc) -> LaunchResult<TensorId> {
        if desc.min_shape.len() != desc.max_shape.len() {
            return Err(LaunchError::contract(format!(
                "tensor {} has min rank {} and max rank {}",
                desc.name,
                desc.min_shape.len(),
                desc.max_shape.len()
            )));
        }
        if let Some(placement) = desc.placement {
            let is_const = graph.sections.get(&placement.section).copied().ok_or_else(|| {
                LaunchError::contract(format!(
                    "tensor {} placed in unknown section {}",
                    desc.name, placement.section
                ))
            })?;
            if is_const && desc.const_data.is_none() {
                return Err(LaunchError::contract(format!(
                    "tensor {} in const section {} has no data",
                    desc.name, placement.section
                )));
            }
        }
        let id = (graph.ordinal << 32) | graph.next_tensor;
        graph.next_tensor += 1;
        graph.tensors.insert(id, desc.clone());
        Ok(id)
    }

    fn add_node(&self, graph: &mut SimGraph, node: &NodeDesc<'_>) -> LaunchResult<NodeId> {
        let op = OpKind::parse(node.guid)
            .ok_or_else(|| LaunchError::contract(format!("unsupported guid {}", node.guid)))?;
        if node.inputs.len() != op.arity() || node.outputs.len() != 1 {
            return Err(LaunchError::contract(format!(
                "node {} ({}) takes {} inputs and one output",
                node.name,
                node.guid,
                op.arity()
            )));
        }
        for id in node.inputs.iter().chain(node.outputs) {
            graph.check_tensor(*id)?;
        }
        let id = (graph.ordinal << 32) | graph.next_node;
        graph.next_node += 1;
        graph.nodes.insert(
            id,
            GraphNode {
                op,
                name: node.name.to_string(),
                inputs: node.inputs.to_vec(),
                outputs: node.outputs.to_vec(),
                blocked_by: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    fn set_node_dependency(
        &self,
        graph: &mut SimGraph,
        blocking: &[NodeId],
        blocked: &[NodeId],
    ) -> LaunchResult<()> {
        for id in blocking.iter().chain(blocked) {
            graph.check_node(*id)?;
        }
        for id in blocked {
            if let Some(node) = graph.nodes.get_mut(id) {
                node.blocked_by.extend(blocking.iter().copied());
            }
        }
        Ok(())
    }

    fn compile(
        &self,
        graph: &SimGraph,
        name: &str,
        config: &[(String, String)],
    ) -> LaunchResult<Arc<dyn Recipe>> {
        let config = CompileConfig::parse(config)?;
        let recipe = Compilation::new(graph, config).run(name)?;
        tracing::debug!(
            recipe = name,
            nodes = recipe.program.len(),
            tensors = recipe.tensors.len(),
            workspace = recipe.workspace_size,
            "compiled simulator recipe"
        );
        Ok(Arc::new(recipe))
    }
}

struct Compilation<'g> {
    graph: &'g SimGraph,
    config: CompileConfig,
    producers: HashMap<TensorId, NodeId>,
}

impl<'g> Compilation<'g> {
    fn new(graph: &'g SimGraph, config: CompileConfig) -> Self {
        Self {
            graph,
            config,
            producers: HashMap::new(),
        }
    }

    fn run(mut self, name: &str) -> LaunchResult<SimRecipe> {
        for (node_id, node) in &self.graph.nodes {
            for output in &node.outputs {
                if self.producers.insert(*output, *node_id).is_some() {
                    return Err(LaunchError::contract(format!(
                        "tensor {} is produced by more than one node",
                        self.graph.tensors[output].name
                    )));
                }
            }
        }
        let order = self.schedule()?;

        let mut intermediates = HashMap::new();
        let mut workspace = 0u64;
        let mut tensors = Vec::new();
        let mut dtypes = HashMap::new();
        for (id, desc) in &self.graph.tensors {
            dtypes.insert(*id, desc.dtype);
            let produced = self.producers.contains_key(id);
            match desc.placement {
                Some(placement) => tensors.push(RecipeTensorInfo {
                    name: desc.name.clone(),
                    id: *id,
                    dtype: desc.dtype,
                    kind: desc.kind,
                    min_shape: desc.min_shape.clone(),
                    max_shape: desc.max_shape.clone(),
                    section_id: Some(placement.section),
                    offset: placement.offset,
                    is_input: !produced,
                }),
                None if desc.kind.memory_kind() != MemoryKind::Device => {
                    tensors.push(RecipeTensorInfo {
                        name: desc.name.clone(),
                        id: *id,
                        dtype: desc.dtype,
                        kind: desc.kind,
                        min_shape: desc.min_shape.clone(),
                        max_shape: desc.max_shape.clone(),
                        section_id: None,
                        offset: 0,
                        is_input: !produced,
                    })
                }
                None if produced => {
                    let elements = element_count(&desc.max_shape);
                    intermediates.insert(*id, (workspace, desc.dtype, elements));
                    let end = checked_byte_size(&desc.max_shape, desc.dtype)
                        .and_then(|bytes| bytes.checked_add(workspace))
                        .ok_or_else(|| {
                            LaunchError::contract(format!(
                                "workspace overflows u64 at tensor {}",
                                desc.name
                            ))
                        })?;
                    workspace = align_up(end, TENSOR_ALIGNMENT)?;
                }
                None => {
                    return Err(LaunchError::contract(format!(
                        "tensor {} is neither persistent nor produced by any node",
                        desc.name
                    )))
                }
            }
        }

        let sections = self.layout_sections(&mut tensors)?;
        let program = order
            .iter()
            .map(|id| {
                let node = &self.graph.nodes[id];
                Instruction {
                    op: node.op,
                    name: node.name.clone(),
                    inputs: node.inputs.clone(),
                    outputs: node.outputs.clone(),
                }
            })
            .collect();

        Ok(SimRecipe {
            name: name.to_string(),
            tensors,
            sections,
            workspace_size: workspace + self.config.workspace_padding,
            program,
            intermediates,
            dtypes,
            round_bf16: self.config.round_bf16,
        })
    }

    /// Topological order; ties go to the lowest node id, or the highest when reversed.
    fn schedule(&self) -> LaunchResult<Vec<NodeId>> {
        let mut pending: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (id, node) in &self.graph.nodes {
            let mut deps = node.blocked_by.clone();
            for input in &node.inputs {
                if let Some(producer) = self.producers.get(input) {
                    deps.insert(*producer);
                }
            }
            deps.remove(id);
            pending.insert(*id, deps);
        }

        let mut order = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let mut ready = pending
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| *id);
            let next = match self.config.schedule {
                Schedule::Forward => ready.next(),
                Schedule::Reverse => ready.last(),
            };
            let Some(next) = next else {
                return Err(LaunchError::contract("graph contains a dependency cycle"));
            };
            pending.remove(&next);
            for deps in pending.values_mut() {
                deps.remove(&next);
            }
            order.push(next);
        }
        Ok(order)
    }

    fn layout_sections(
        &self,
        tensors: &mut [RecipeTensorInfo],
    ) -> LaunchResult<BTreeMap<SectionId, SectionProps>> {
        let mut sections = BTreeMap::new();
        let mut const_data: BTreeMap<SectionId, Vec<u8>> = BTreeMap::new();
        let mut packed: Option<(SectionId, u64)> = None;

        for info in tensors.iter_mut() {
            let Some(section) = info.section_id else {
                continue;
            };
            let is_const = self.graph.section_is_const(section).ok_or_else(|| {
                LaunchError::contract(format!("unknown section {section}"))
            })?;
            if is_const {
                let data = self.graph.tensors[&info.id]
                    .const_data
                    .clone()
                    .ok_or_else(|| {
                        LaunchError::contract(format!("const tensor {} has no data", info.name))
                    })?;
                let bytes = const_data.entry(section).or_default();
                let end = info.offset as usize + data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[info.offset as usize..end].copy_from_slice(&data);
                continue;
            }
            if self.config.pack_sections {
                let (target, cursor) = *packed.get_or_insert((section, 0));
                info.section_id = Some(target);
                info.offset = cursor;
                let end = info.max_bytes()?.checked_add(cursor).ok_or_else(|| {
                    LaunchError::contract(format!("packed section overflows at {}", info.name))
                })?;
                packed = Some((target, align_up(end, TENSOR_ALIGNMENT)?));
                sections.insert(target, SectionProps::mutable());
            } else {
                sections.insert(section, SectionProps::mutable());
            }
        }
        for (section, data) in const_data {
            sections.insert(section, SectionProps::constant(Arc::from(data)));
        }
        Ok(sections)
    }
}

#[cfg(test)]
mod tests {
    use reciperun::graph::SectionPlacement;
    use reciperun::tensor::{Shape, TensorKind};

    use super::*;

    fn desc(name: &str, placement: Option<SectionPlacement>) -> TensorDesc {
        TensorDesc {
            name: name.to_string(),
            dtype: DType::F32,
            kind: TensorKind::Data,
            max_shape: Shape::from_slice(&[4]),
            min_shape: Shape::from_slice(&[4]),
            placement,
            const_data: None,
        }
    }

    fn persistent(
        compiler: &SimCompiler,
        graph: &mut SimGraph,
        name: &str,
    ) -> TensorId {
        let section = compiler.create_section(graph, false).unwrap();
        compiler
            .create_tensor(
                graph,
                &desc(name, Some(SectionPlacement { section, offset: 0 })),
            )
            .unwrap()
    }

    fn chain(compiler: &SimCompiler) -> SimGraph {
        let mut graph = compiler.create_graph().unwrap();
        let x = persistent(compiler, &mut graph, "x");
        let y = persistent(compiler, &mut graph, "y");
        let tmp = compiler.create_tensor(&mut graph, &desc("tmp", None)).unwrap();
        let side = persistent(compiler, &mut graph, "side");
        for (guid, name, input, output) in [
            ("relu", "n0", x, tmp),
            ("identity", "n1", tmp, y),
            ("identity", "n2", x, side),
        ] {
            compiler
                .add_node(
                    &mut graph,
                    &NodeDesc {
                        guid,
                        name,
                        inputs: &[input],
                        outputs: &[output],
                        params: &[],
                    },
                )
                .unwrap();
        }
        graph
    }

    #[test]
    fn graphs_use_disjoint_ids() {
        let compiler = SimCompiler::new();
        let mut first = compiler.create_graph().unwrap();
        let mut second = compiler.create_graph().unwrap();
        let a = persistent(&compiler, &mut first, "a");
        let b = persistent(&compiler, &mut second, "a");
        assert_ne!(a, b);
        assert!(second.tensor(a).is_none());
    }

    #[test]
    fn reverse_schedule_respects_dependencies() {
        let compiler = SimCompiler::new();
        let graph = chain(&compiler);
        let forward = compiler.compile(&graph, "fwd", &[]).unwrap();
        let reverse = compiler
            .compile(
                &graph,
                "rev",
                &[(CONFIG_SCHEDULE.to_string(), "reverse".to_string())],
            )
            .unwrap();
        let forward = forward.as_any().downcast_ref::<SimRecipe>().unwrap();
        let reverse = reverse.as_any().downcast_ref::<SimRecipe>().unwrap();
        assert_eq!(forward.schedule(), vec!["n0", "n1", "n2"]);
        assert_eq!(reverse.schedule(), vec!["n2", "n0", "n1"]);
    }

    #[test]
    fn intermediates_live_in_workspace() {
        let compiler = SimCompiler::new();
        let graph = chain(&compiler);
        let recipe = compiler
            .compile(
                &graph,
                "ws",
                &[(CONFIG_WORKSPACE_PADDING.to_string(), "100".to_string())],
            )
            .unwrap();
        assert_eq!(recipe.workspace_size(), 164);
        assert_eq!(recipe.tensors().len(), 3);
        assert!(recipe.tensors().iter().all(|info| info.name != "tmp"));
    }

    #[test]
    fn packing_moves_tensors_into_one_section() {
        let compiler = SimCompiler::new();
        let graph = chain(&compiler);
        let recipe = compiler
            .compile(
                &graph,
                "packed",
                &[(CONFIG_PACK_SECTIONS.to_string(), "true".to_string())],
            )
            .unwrap();
        let sections: BTreeSet<_> = recipe.tensors().iter().map(|t| t.section_id).collect();
        assert_eq!(sections.len(), 1);
        let offsets: Vec<_> = recipe.tensors().iter().map(|t| t.offset).collect();
        assert_eq!(offsets, vec![0, 64, 128]);
    }

    #[test]
    fn unknown_configuration_is_rejected() {
        let compiler = SimCompiler::new();
        let graph = chain(&compiler);
        let err = compiler
            .compile(&graph, "bad", &[("SIM_TURBO".to_string(), "1".to_string())])
            .err().unwrap();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn cycles_are_rejected() {
        let compiler = SimCompiler::new();
        let mut graph = chain(&compiler);
        let nodes: Vec<NodeId> = graph.nodes.keys().copied().collect();
        compiler
            .set_node_dependency(&mut graph, &[nodes[1]], &[nodes[0]])
            .unwrap();
        assert!(compiler.compile(&graph, "cycle", &[]).is_err());
    }
}
