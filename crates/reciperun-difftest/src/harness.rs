//! Two-track graph construction with lazy compile, run and compare.

use std::collections::BTreeMap;
use std::sync::Arc;

use reciperun::data::{DataProvider, ManualDataProvider, MemInit};
use reciperun::device::Device;
use reciperun::dtype::DType;
use reciperun::error::{LaunchError, LaunchResult};
use reciperun::graph::{GraphCompiler, NodeDesc, SectionPlacement, TensorDesc};
use reciperun::recipe::{NodeId, SectionId, TensorId};
use reciperun::runtime::{launch, LaunchOptions, LaunchOutcome};
use reciperun::sink::{DataCollector, OutputSink};
use reciperun::tensor::{element_count, Shape, TensorKind};

use crate::compare::compare_buffers;
use crate::mirror::Mirror;
use crate::naming::NameSequence;

/// Selects one of the two tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunIndex {
    First,
    Second,
}

impl RunIndex {
    fn slot(self) -> usize {
        match self {
            RunIndex::First => 0,
            RunIndex::Second => 1,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RunIndex::First => "first",
            RunIndex::Second => "second",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    Persistent,
    Workspace,
}

/// Description of a tensor created through the harness.
#[derive(Debug, Clone)]
pub struct TensorSpec {
    name: Option<String>,
    dtype: DType,
    kind: TensorKind,
    max_shape: Shape,
    min_shape: Option<Shape>,
    storage: Storage,
    init: MemInit,
    initializer: Option<Vec<u8>>,
}

impl TensorSpec {
    fn new(dtype: DType, shape: &[u64], storage: Storage, init: MemInit) -> Self {
        Self {
            name: None,
            dtype,
            kind: TensorKind::Data,
            max_shape: Shape::from_slice(shape),
            min_shape: None,
            storage,
            init,
            initializer: None,
        }
    }

    /// Persistent tensor filled with random values in `[-2, 2]`.
    pub fn input(dtype: DType, shape: &[u64]) -> Self {
        Self::new(dtype, shape, Storage::Persistent, MemInit::RandomWithNegative)
    }

    /// Persistent tensor with no input data.
    pub fn output(dtype: DType, shape: &[u64]) -> Self {
        Self::new(dtype, shape, Storage::Persistent, MemInit::None)
    }

    /// Tensor the compiler places in the workspace.
    pub fn intermediate(dtype: DType, shape: &[u64]) -> Self {
        Self::new(dtype, shape, Storage::Workspace, MemInit::None)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_min_shape(mut self, shape: &[u64]) -> Self {
        self.min_shape = Some(Shape::from_slice(shape));
        self
    }

    pub fn with_kind(mut self, kind: TensorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_init(mut self, init: MemInit) -> Self {
        self.init = init;
        self
    }

    /// Explicit contents; implies [`MemInit::FromInitializer`].
    pub fn initializer(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.init = MemInit::FromInitializer;
        self.initializer = Some(bytes.into());
        self
    }

    fn prefix(&self) -> &'static str {
        match (self.storage, self.init) {
            (Storage::Workspace, _) => "tensor",
            (Storage::Persistent, MemInit::None) => "output",
            (Storage::Persistent, _) => "input",
        }
    }
}

#[derive(Debug, Clone)]
struct TensorMeta {
    name: String,
    dtype: DType,
    max_shape: Shape,
    actual_shape: Option<Shape>,
}

struct Track<G> {
    graph: G,
    config: Vec<(String, String)>,
}

struct RunResult {
    outputs: DataCollector,
    outcome: LaunchOutcome,
}

enum Runs {
    Pending,
    Finished(Box<[RunResult; 2]>),
    /// The first error is replayed on every later comparison.
    Failed(LaunchError),
}

/// Builds the same graph twice and checks that both compilations compute the same outputs.
///
/// Ids returned by the construction methods belong to the first track; the harness translates
/// them for the second. Both tracks are compiled and run lazily, once, on the first comparison.
pub struct DifferentialHarness<C: GraphCompiler> {
    compiler: C,
    device: Arc<dyn Device>,
    tracks: [Track<C::Graph>; 2],
    mirror: Mirror,
    names: NameSequence,
    provider: ManualDataProvider,
    tensors: BTreeMap<TensorId, TensorMeta>,
    global_config: Vec<(String, String)>,
    options: LaunchOptions,
    runs: Runs,
}

impl<C: GraphCompiler> DifferentialHarness<C> {
    pub fn new(compiler: C, device: Arc<dyn Device>) -> LaunchResult<Self> {
        let tracks = [
            Track {
                graph: compiler.create_graph()?,
                config: Vec::new(),
            },
            Track {
                graph: compiler.create_graph()?,
                config: Vec::new(),
            },
        ];
        Ok(Self {
            compiler,
            device,
            tracks,
            mirror: Mirror::default(),
            names: NameSequence::new(),
            provider: ManualDataProvider::new(),
            tensors: BTreeMap::new(),
            global_config: Vec::new(),
            options: LaunchOptions::default(),
            runs: Runs::Pending,
        })
    }

    /// Options used for both runs.
    pub fn with_options(mut self, options: LaunchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn graph(&self, run: RunIndex) -> &C::Graph {
        &self.tracks[run.slot()].graph
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn data_provider(&self) -> &ManualDataProvider {
        &self.provider
    }

    fn results(&self) -> Option<&[RunResult; 2]> {
        match &self.runs {
            Runs::Finished(results) => Some(&**results),
            Runs::Pending | Runs::Failed(_) => None,
        }
    }

    /// Outcome of a run, once the comparison has triggered it.
    pub fn outcome(&self, run: RunIndex) -> Option<&LaunchOutcome> {
        self.results().map(|results| &results[run.slot()].outcome)
    }

    /// Output bytes of a run for a first-track tensor id.
    pub fn output(&self, run: RunIndex, tensor: TensorId) -> Option<&Arc<[u8]>> {
        let meta = self.tensors.get(&tensor)?;
        self.results()?[run.slot()].outputs.get(&meta.name)
    }

    /// Name under which a first-track tensor id was created.
    pub fn tensor_name(&self, tensor: TensorId) -> Option<&str> {
        self.tensors.get(&tensor).map(|meta| meta.name.as_str())
    }

    fn ensure_building(&self) -> LaunchResult<()> {
        match self.runs {
            Runs::Pending => Ok(()),
            Runs::Finished(_) | Runs::Failed(_) => Err(LaunchError::contract(
                "graphs were already compiled and run; construction is closed",
            )),
        }
    }

    /// Applies `edit` to both tracks as one step.
    ///
    /// On failure the graphs, the mirror, the tensor table and the data source are restored, so
    /// a track never holds an entity its twin lacks.
    fn mirrored<T>(&mut self, edit: impl FnOnce(&mut Self) -> LaunchResult<T>) -> LaunchResult<T> {
        self.ensure_building()?;
        let graphs = [
            self.tracks[0].graph.clone(),
            self.tracks[1].graph.clone(),
        ];
        let mirror = self.mirror.clone();
        let provider = self.provider.clone();
        let tensors = self.tensors.clone();
        let result = edit(self);
        if let Err(err) = &result {
            let [first, second] = graphs;
            self.tracks[0].graph = first;
            self.tracks[1].graph = second;
            self.mirror = mirror;
            self.provider = provider;
            self.tensors = tensors;
            tracing::debug!(error = %err, "rolled back mirrored edit");
        }
        result
    }

    fn create_in_both(
        &mut self,
        name: String,
        spec: &TensorSpec,
        sections: Option<([SectionId; 2], u64)>,
        const_data: Option<Arc<[u8]>>,
    ) -> LaunchResult<TensorId> {
        let mut ids = [0; 2];
        for (slot, id) in ids.iter_mut().enumerate() {
            let desc = TensorDesc {
                name: name.clone(),
                dtype: spec.dtype,
                kind: spec.kind,
                max_shape: spec.max_shape.clone(),
                min_shape: spec
                    .min_shape
                    .clone()
                    .unwrap_or_else(|| spec.max_shape.clone()),
                placement: sections.map(|(sections, offset)| SectionPlacement {
                    section: sections[slot],
                    offset,
                }),
                const_data: const_data.clone(),
            };
            *id = self
                .compiler
                .create_tensor(&mut self.tracks[slot].graph, &desc)?;
        }
        self.mirror.tensors.insert(ids[0], ids[1])?;
        self.tensors.insert(
            ids[0],
            TensorMeta {
                name,
                dtype: spec.dtype,
                max_shape: spec.max_shape.clone(),
                actual_shape: None,
            },
        );
        Ok(ids[0])
    }

    fn create_sections(&mut self, is_const: bool) -> LaunchResult<[SectionId; 2]> {
        let first = self
            .compiler
            .create_section(&mut self.tracks[0].graph, is_const)?;
        let second = self
            .compiler
            .create_section(&mut self.tracks[1].graph, is_const)?;
        self.mirror.sections.insert(first, second)?;
        Ok([first, second])
    }

    fn register_data(&mut self, name: &str, spec: &TensorSpec) -> LaunchResult<()> {
        self.provider.add_tensor(
            name,
            spec.dtype,
            &spec.max_shape,
            spec.init,
            spec.initializer.as_deref(),
        )
    }

    /// Creates a tensor in both graphs.
    ///
    /// Persistent tensors get a section of their own; inputs are registered with the shared
    /// data source so both runs see identical bytes.
    pub fn create_tensor(&mut self, spec: TensorSpec) -> LaunchResult<TensorId> {
        self.ensure_building()?;
        let name = match &spec.name {
            Some(name) => name.clone(),
            None => self.names.next(spec.prefix()),
        };
        if self.provider.contains(&name) || self.tensors.values().any(|meta| meta.name == name) {
            return Err(LaunchError::contract(format!("tensor name {name} is already used")));
        }
        self.mirrored(|harness| {
            let sections = match spec.storage {
                Storage::Persistent => Some((harness.create_sections(false)?, 0)),
                Storage::Workspace => None,
            };
            let id = harness.create_in_both(name.clone(), &spec, sections, None)?;
            if spec.storage == Storage::Persistent && spec.init != MemInit::None {
                harness.register_data(&name, &spec)?;
            }
            Ok(id)
        })
    }

    pub fn create_const_section(&mut self) -> LaunchResult<SectionId> {
        self.mirrored(|harness| Ok(harness.create_sections(true)?[0]))
    }

    /// Creates a tensor baked into a const section at `offset`.
    ///
    /// The contents come from the tensor's initializer or are generated from its name.
    pub fn create_const_persistent_tensor(
        &mut self,
        section: SectionId,
        offset: u64,
        spec: TensorSpec,
    ) -> LaunchResult<TensorId> {
        self.ensure_building()?;
        let second = self.mirror.sections.get(section)?;
        let name = match &spec.name {
            Some(name) => name.clone(),
            None => self.names.next("const"),
        };
        if self.provider.contains(&name) || self.tensors.values().any(|meta| meta.name == name) {
            return Err(LaunchError::contract(format!("tensor name {name} is already used")));
        }
        let mut spec = spec;
        if spec.init == MemInit::None {
            spec.init = MemInit::RandomWithNegative;
        }
        self.mirrored(|harness| {
            // The baked bytes are the data source's, so they are registered before the compiler
            // sees them; a rejected tensor rolls the registration back.
            harness.register_data(&name, &spec)?;
            let data = harness.provider.buffer(&name)?;
            harness.create_in_both(name, &spec, Some(([section, second], offset)), Some(data))
        })
    }

    /// Creates a host-resident shape tensor in both graphs.
    pub fn create_host_shape_tensor(&mut self, dtype: DType, shape: &[u64]) -> LaunchResult<TensorId> {
        self.ensure_building()?;
        let name = self.names.next("shape");
        let spec = TensorSpec::new(dtype, shape, Storage::Workspace, MemInit::AllZero)
            .with_kind(TensorKind::HostShape);
        self.mirrored(|harness| {
            let id = harness.create_in_both(name.clone(), &spec, None, None)?;
            harness.register_data(&name, &spec)?;
            Ok(id)
        })
    }

    pub fn add_node(
        &mut self,
        guid: &str,
        inputs: &[TensorId],
        outputs: &[TensorId],
        params: &[u8],
    ) -> LaunchResult<NodeId> {
        self.ensure_building()?;
        let second_inputs = self.mirror.tensors.translate(inputs)?;
        let second_outputs = self.mirror.tensors.translate(outputs)?;
        let name = self.names.next(guid);
        self.mirrored(|harness| {
            let first = harness.compiler.add_node(
                &mut harness.tracks[0].graph,
                &NodeDesc {
                    guid,
                    name: &name,
                    inputs,
                    outputs,
                    params,
                },
            )?;
            let second = harness.compiler.add_node(
                &mut harness.tracks[1].graph,
                &NodeDesc {
                    guid,
                    name: &name,
                    inputs: &second_inputs,
                    outputs: &second_outputs,
                    params,
                },
            )?;
            harness.mirror.nodes.insert(first, second)?;
            Ok(first)
        })
    }

    pub fn set_node_dependency(&mut self, blocking: &[NodeId], blocked: &[NodeId]) -> LaunchResult<()> {
        self.ensure_building()?;
        let second_blocking = self.mirror.nodes.translate(blocking)?;
        let second_blocked = self.mirror.nodes.translate(blocked)?;
        self.mirrored(|harness| {
            harness
                .compiler
                .set_node_dependency(&mut harness.tracks[0].graph, blocking, blocked)?;
            harness.compiler.set_node_dependency(
                &mut harness.tracks[1].graph,
                &second_blocking,
                &second_blocked,
            )
        })
    }

    /// Adds a compile override for one track only.
    pub fn add_configuration_to_run(
        &mut self,
        run: RunIndex,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> LaunchResult<()> {
        self.ensure_building()?;
        self.tracks[run.slot()]
            .config
            .push((key.into(), value.into()));
        Ok(())
    }

    /// Adds a compile override for both tracks; track overrides are applied after it.
    pub fn add_global_configuration(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> LaunchResult<()> {
        self.ensure_building()?;
        self.global_config.push((key.into(), value.into()));
        Ok(())
    }

    /// Sets the runtime shape of a tensor for both runs and for the comparison.
    pub fn set_actual_sizes(&mut self, tensor: TensorId, shape: &[u64]) -> LaunchResult<()> {
        self.ensure_building()?;
        let meta = self.tensors.get_mut(&tensor).ok_or_else(|| {
            LaunchError::contract(format!("tensor {tensor:#x} was not created by this harness"))
        })?;
        if self.provider.contains(&meta.name) {
            self.provider.set_shape(&meta.name, shape)?;
        } else {
            self.provider.add_shape(meta.name.clone(), meta.dtype, shape);
        }
        meta.actual_shape = Some(Shape::from_slice(shape));
        Ok(())
    }

    fn run_track(&self, run: RunIndex) -> LaunchResult<RunResult> {
        let track = &self.tracks[run.slot()];
        let config: Vec<(String, String)> = self
            .global_config
            .iter()
            .chain(&track.config)
            .cloned()
            .collect();
        let recipe = self
            .compiler
            .compile(&track.graph, &format!("difftest_{}", run.as_str()), &config)?;
        let mut outputs = DataCollector::new();
        let outcome = launch(
            &self.device,
            recipe.as_ref(),
            Some(&self.provider as &dyn DataProvider),
            Some(&mut outputs as &mut dyn OutputSink),
            &self.options,
        )?;
        tracing::debug!(
            run = run.as_str(),
            outputs = outputs.len(),
            warnings = outcome.warnings.len(),
            "differential run finished"
        );
        Ok(RunResult { outputs, outcome })
    }

    fn ensure_ran(&mut self) -> LaunchResult<()> {
        if matches!(self.runs, Runs::Pending) {
            self.runs = match self
                .run_track(RunIndex::First)
                .and_then(|first| Ok([first, self.run_track(RunIndex::Second)?]))
            {
                Ok(results) => Runs::Finished(Box::new(results)),
                Err(err) => {
                    tracing::warn!(error = %err, "differential run failed");
                    Runs::Failed(err)
                }
            };
        }
        match &self.runs {
            Runs::Finished(_) => Ok(()),
            Runs::Failed(err) => Err(err.clone()),
            Runs::Pending => Err(LaunchError::contract("runs did not produce results")),
        }
    }

    /// Compiles and runs both tracks on first use, then compares the given first-track outputs.
    ///
    /// Both runs key their outputs by tensor name, which mirrored tensors share.
    pub fn compare_runs_results(&mut self, outputs: &[TensorId]) -> LaunchResult<()> {
        self.ensure_ran()?;
        let Some(results) = self.results() else {
            return Err(LaunchError::contract("runs did not produce results"));
        };
        for id in outputs {
            let meta = self.tensors.get(id).ok_or_else(|| {
                LaunchError::contract(format!("tensor {id:#x} was not created by this harness"))
            })?;
            let elements = element_count(meta.actual_shape.as_ref().unwrap_or(&meta.max_shape));
            let mut buffers = Vec::with_capacity(2);
            for run in [RunIndex::First, RunIndex::Second] {
                let buffer = results[run.slot()].outputs.get(&meta.name).ok_or_else(|| {
                    LaunchError::contract(format!(
                        "{} run produced no output {}",
                        run.as_str(),
                        meta.name
                    ))
                })?;
                buffers.push(buffer);
            }
            compare_buffers(&meta.name, meta.dtype, elements, buffers[0], buffers[1])?;
        }
        Ok(())
    }

    /// Panicking form of [`compare_runs_results`](Self::compare_runs_results) for tests.
    #[track_caller]
    pub fn assert_runs_match(&mut self, outputs: &[TensorId]) {
        if let Err(err) = self.compare_runs_results(outputs) {
            panic!("differential comparison failed: {err}");
        }
    }
}
