//! Phase-based execution of one recipe on one device.

use std::sync::Arc;
use std::time::Instant;

use crate::data::DataProvider;
use crate::device::registry::acquire_device;
use crate::device::{Device, DeviceAddr, DeviceBuffer, Event, LaunchTensor, Stream};
use crate::error::{LaunchError, LaunchResult};
use crate::recipe::{Recipe, RecipeTensorInfo};
use crate::runtime::const_sections::ConstSectionCache;
use crate::runtime::launch_info::{LaunchDescriptorBuilder, LaunchDescriptors};
use crate::runtime::measurement::{LaunchOptions, Measurement};
use crate::runtime::outcome::LaunchOutcome;
use crate::runtime::sections::{actual_tensor_size, SectionBuffers, SectionPlanner};
use crate::runtime::timing::{
    busy_span_ns, filter_elapsed_times, poll_elapsed_times, BatchLauncher, BatchSamples,
    TimingSampler,
};
use crate::sink::OutputSink;
use crate::tensor::MemoryKind;

/// Staged input bytes allowed in flight before the download stream is drained.
pub const MAX_ACTIVE_DOWNLOAD_BYTES: u64 = 1_000_000_000;

/// Size of the dummy copy that holds back the compute stream while launches are queued.
pub const DELAY_COPY_BYTES: u64 = 1024 * 1024;

struct PreparedTensors<'a> {
    inputs: Vec<&'a RecipeTensorInfo>,
    outputs: Vec<&'a RecipeTensorInfo>,
    sections: SectionBuffers,
    descriptors: LaunchDescriptors,
}

/// Runs a recipe over three streams: download, compute and upload.
///
/// A run plans and allocates sections, downloads const sections, stages inputs, launches the
/// recipe under the requested [`Measurement`], releases the inputs and finally copies every
/// output back to the host for the [`OutputSink`].
pub struct ExecutionPipeline<'a> {
    device: Arc<dyn Device>,
    recipe: &'a dyn Recipe,
    provider: Option<&'a dyn DataProvider>,
    sink: Option<&'a mut dyn OutputSink>,
    download: Stream,
    compute: Stream,
    upload: Stream,
    ready: Event,
    const_sections: ConstSectionCache,
}

impl<'a> ExecutionPipeline<'a> {
    pub fn new(device: &Arc<dyn Device>, recipe: &'a dyn Recipe) -> LaunchResult<Self> {
        Ok(Self {
            device: Arc::clone(device),
            recipe,
            provider: None,
            sink: None,
            download: Stream::create(device)?,
            compute: Stream::create(device)?,
            upload: Stream::create(device)?,
            ready: Event::create(device, false)?,
            const_sections: ConstSectionCache::new(device),
        })
    }

    pub fn with_data_provider(mut self, provider: &'a dyn DataProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_output_sink(mut self, sink: &'a mut dyn OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn run(mut self, options: &LaunchOptions) -> LaunchResult<LaunchOutcome> {
        tracing::info!(
            recipe = self.recipe.name(),
            device = self.device.name(),
            iterations = options.iterations,
            measurement = %options.measurement,
            "launching recipe"
        );
        let mut outcome = LaunchOutcome::default();
        let mut prepared = self.prepare_tensors()?;
        for warning in std::mem::take(&mut prepared.descriptors.warnings) {
            outcome.warn(warning);
        }

        self.stage_inputs(&prepared)?;
        self.download.record(&self.ready)?;

        let workspace_size = self.recipe.workspace_size();
        let workspace = if workspace_size > 0 {
            Some(DeviceBuffer::allocate(&self.device, workspace_size)?)
        } else {
            None
        };
        let mut launcher = ComputeLauncher {
            device: &self.device,
            recipe: self.recipe,
            download: &self.download,
            compute: &self.compute,
            records: &prepared.descriptors.records,
            workspace: workspace.as_ref().map_or(0, DeviceBuffer::address),
        };
        TimingSampler::new(options).run(&mut launcher, &mut outcome)?;
        drop(workspace);

        self.release_inputs(&mut prepared)?;
        self.upload_outputs(&mut prepared)?;
        self.device.synchronize()?;
        tracing::debug!(
            recipe = self.recipe.name(),
            attempts = outcome.attempts,
            samples = outcome.durations_ns.len(),
            warnings = outcome.warnings.len(),
            "launch finished"
        );
        Ok(outcome)
    }

    fn prepare_tensors(&self) -> LaunchResult<PreparedTensors<'a>> {
        let recipe = self.recipe;
        let split = self
            .const_sections
            .split_inputs(recipe, recipe.inputs(), &self.download)?;
        let outputs: Vec<&'a RecipeTensorInfo> = recipe.outputs().collect();

        let planner = SectionPlanner::for_device(self.device.as_ref());
        let plan = planner.plan(
            recipe,
            split.remaining.iter().chain(outputs.iter()).copied(),
            self.provider,
        )?;
        let sections = planner.allocate(&self.device, &plan)?;

        let mut builder = LaunchDescriptorBuilder::new(self.device.as_ref(), &sections, self.provider)
            .with_records(split.records);
        for info in &split.remaining {
            builder.push_input(info)?;
        }
        for info in &outputs {
            builder.push_output(info)?;
        }
        let descriptors = builder.build();
        Ok(PreparedTensors {
            inputs: split.remaining,
            outputs,
            sections,
            descriptors,
        })
    }

    fn stage_inputs(&self, prepared: &PreparedTensors<'a>) -> LaunchResult<()> {
        let mut in_flight = 0u64;
        let mut staged = Vec::new();
        for info in &prepared.inputs {
            if info.memory_kind() != MemoryKind::Device {
                continue;
            }
            let section = info.section_id.ok_or_else(|| {
                LaunchError::contract(format!("tensor {} has no memory section", info.name))
            })?;
            let dst = prepared.sections.base(section)? + info.offset;
            let mut host = self
                .device
                .host_malloc(actual_tensor_size(info, self.provider)?)?;
            if let Some(provider) = self.provider.filter(|p| p.contains(&info.name)) {
                provider.copy_buffer(&info.name, host.as_mut_slice())?;
            }
            self.download.copy_to_device(host.as_slice(), dst)?;
            in_flight += host.len() as u64;
            staged.push(host);
            if in_flight > MAX_ACTIVE_DOWNLOAD_BYTES {
                self.download.synchronize()?;
                staged.clear();
                in_flight = 0;
            }
        }
        self.download.synchronize()
    }

    fn release_inputs(&self, prepared: &mut PreparedTensors<'a>) -> LaunchResult<()> {
        self.download.synchronize()?;
        for info in prepared.inputs.drain(..) {
            prepared.descriptors.host_buffers.remove(&info.id);
        }
        Ok(())
    }

    fn upload_outputs(&mut self, prepared: &mut PreparedTensors<'a>) -> LaunchResult<()> {
        self.upload.wait(&self.ready)?;
        let Some(sink) = self.sink.as_deref_mut() else {
            return Ok(());
        };
        for info in &prepared.outputs {
            match info.memory_kind() {
                MemoryKind::Device => {
                    let section = info.section_id.ok_or_else(|| {
                        LaunchError::contract(format!("output {} has no memory section", info.name))
                    })?;
                    let mut host = self
                        .device
                        .host_malloc(actual_tensor_size(info, self.provider)?)?;
                    let src = prepared.sections.base(section)? + info.offset;
                    self.upload.copy_to_host(src, host.as_mut_slice())?;
                    self.upload.synchronize()?;
                    sink.on_output(&info.name, &host.into_shared());
                }
                MemoryKind::Host => {
                    if let Some(host) = prepared.descriptors.host_buffers.remove(&info.id) {
                        sink.on_output(&info.name, &host.into_shared());
                    }
                }
                MemoryKind::None => {}
            }
        }
        Ok(())
    }
}

struct ComputeLauncher<'p> {
    device: &'p Arc<dyn Device>,
    recipe: &'p dyn Recipe,
    download: &'p Stream,
    compute: &'p Stream,
    records: &'p [LaunchTensor],
    workspace: DeviceAddr,
}

impl ComputeLauncher<'_> {
    fn launch_once(&self) -> LaunchResult<()> {
        self.compute.launch(self.recipe, self.records, self.workspace)
    }

    /// Holds the compute stream behind a dummy copy so every launch is queued before any runs.
    fn delay_execution(&self, event: &Event) -> LaunchResult<DeviceBuffer> {
        let dummy = DeviceBuffer::allocate(self.device, DELAY_COPY_BYTES)?;
        let host = self.device.host_malloc(DELAY_COPY_BYTES)?;
        self.download.copy_to_device(host.as_slice(), dummy.address())?;
        self.download.record(event)?;
        self.compute.wait(event)?;
        Ok(dummy)
    }

    fn launch_with_events(&self, iterations: u32) -> LaunchResult<Vec<f64>> {
        let mut pairs = Vec::with_capacity(iterations as usize);
        for _ in 0..iterations {
            pairs.push((
                Event::create(self.device, true)?,
                Event::create(self.device, true)?,
            ));
        }
        let delay = Event::create(self.device, false)?;
        let _dummy = self.delay_execution(&delay)?;

        let start = Instant::now();
        for (begin, end) in &pairs {
            self.compute.record(begin)?;
            self.launch_once()?;
            self.compute.record(end)?;
        }
        self.compute.synchronize()?;
        let max_valid_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let samples = pairs.iter().map(|(begin, end)| begin.elapsed_ns(end));
        Ok(filter_elapsed_times(
            poll_elapsed_times(samples),
            max_valid_ns,
        ))
    }

    fn launch_with_profiler(&self, iterations: u32) -> LaunchResult<Vec<f64>> {
        let mut durations = Vec::new();
        for _ in 0..iterations {
            self.device.profiler_start()?;
            self.launch_once()?;
            self.compute.synchronize()?;
            self.device.profiler_stop()?;
            let duration = busy_span_ns(&self.device.profiler_events()?);
            if duration > 0.0 {
                durations.push(duration);
            }
        }
        Ok(durations)
    }
}

impl BatchLauncher for ComputeLauncher<'_> {
    fn launch_batch(
        &mut self,
        measurement: Measurement,
        iterations: u32,
    ) -> LaunchResult<BatchSamples> {
        match measurement {
            Measurement::None => {
                for _ in 0..iterations {
                    self.launch_once()?;
                }
                self.compute.synchronize()?;
                Ok(BatchSamples::Extend(Vec::new()))
            }
            Measurement::Events => Ok(BatchSamples::Replace(self.launch_with_events(iterations)?)),
            Measurement::Profiler => {
                Ok(BatchSamples::Extend(self.launch_with_profiler(iterations)?))
            }
        }
    }
}

/// Runs `recipe` once on `device` with the given collaborators.
pub fn launch<'a>(
    device: &Arc<dyn Device>,
    recipe: &'a dyn Recipe,
    provider: Option<&'a dyn DataProvider>,
    sink: Option<&'a mut dyn OutputSink>,
    options: &LaunchOptions,
) -> LaunchResult<LaunchOutcome> {
    let mut pipeline = ExecutionPipeline::new(device, recipe)?;
    if let Some(provider) = provider {
        pipeline = pipeline.with_data_provider(provider);
    }
    if let Some(sink) = sink {
        pipeline = pipeline.with_output_sink(sink);
    }
    pipeline.run(options)
}

/// Acquires a device from the global registry, falling back through `optional`, and runs
/// `recipe` on it.
pub fn launch_on<'a>(
    preferred: &str,
    optional: &[&str],
    recipe: &'a dyn Recipe,
    provider: Option<&'a dyn DataProvider>,
    sink: Option<&'a mut dyn OutputSink>,
    options: &LaunchOptions,
) -> LaunchResult<LaunchOutcome> {
    let device = acquire_device(preferred, optional)?;
    launch(&device, recipe, provider, sink, options)
}
