//! In-process device with a deterministic virtual clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use reciperun::device::registry::{register_device, DeviceRegistry};
use reciperun::device::{
    Device, DeviceAddr, ElapsedTimeError, EventId, LaunchTensor, StreamId, TraceEvent,
};
use reciperun::error::{lock_named, LaunchError, LaunchResult};
use reciperun::recipe::{Recipe, TensorId};
use reciperun::tensor::{element_count, MemoryKind};

use crate::compiler::SimRecipe;
use crate::memory::DeviceMemory;
use crate::ops::{decode, encode, round_to_bf16};

/// Registry name of the simulator.
pub const SIM_DEVICE_KIND: &str = "sim";

/// Cost model and identity of a [`SimDevice`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimDeviceConfig {
    pub name: String,
    pub alignment: u64,
    /// Fixed cost of every launch.
    pub launch_overhead_ns: u64,
    /// Cost per element written by a launch.
    pub ns_per_element: u64,
    /// Cost per KiB moved by a copy.
    pub copy_ns_per_kib: u64,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            name: SIM_DEVICE_KIND.to_string(),
            alignment: 256,
            launch_overhead_ns: 100,
            ns_per_element: 1,
            copy_ns_per_kib: 10,
        }
    }
}

/// Result forced onto one elapsed-time query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElapsedFault {
    /// Reports a duration of zero.
    Zero,
    Unavailable,
    Failed,
}

/// Counters of everything the device was asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub host_to_device_copies: u64,
    pub device_to_host_copies: u64,
    pub launches: u64,
    pub allocations: u64,
    pub frees: u64,
    pub host_maps: u64,
    pub elapsed_queries: u64,
    pub live_allocations: usize,
    pub live_streams: usize,
    pub live_events: usize,
}

#[derive(Debug, Clone, Copy)]
struct SimEvent {
    collect_time: bool,
    timestamp_ns: Option<u64>,
}

#[derive(Debug, Default)]
struct Profiler {
    active: bool,
    events: Vec<TraceEvent>,
}

#[derive(Debug)]
struct SimState {
    memory: DeviceMemory,
    streams: HashMap<u32, u64>,
    events: HashMap<u32, SimEvent>,
    next_handle: u32,
    mapped: HashSet<(usize, usize)>,
    profiler: Profiler,
    faults: HashMap<u64, ElapsedFault>,
    stats: SimStats,
}

impl SimState {
    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn clock(&mut self, op: &'static str, stream: StreamId) -> LaunchResult<&mut u64> {
        self.streams
            .get_mut(&stream.0)
            .ok_or_else(|| LaunchError::device(op, format!("unknown stream {}", stream.0)))
    }

    fn event(&mut self, op: &'static str, event: EventId) -> LaunchResult<&mut SimEvent> {
        self.events
            .get_mut(&event.0)
            .ok_or_else(|| LaunchError::device(op, format!("unknown event {}", event.0)))
    }
}

/// Simulated accelerator; see the crate docs.
#[derive(Debug)]
pub struct SimDevice {
    config: SimDeviceConfig,
    state: Mutex<SimState>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(SimDeviceConfig::default())
    }
}

impl SimDevice {
    pub fn new(config: SimDeviceConfig) -> Self {
        let state = SimState {
            memory: DeviceMemory::new(config.alignment),
            streams: HashMap::new(),
            events: HashMap::new(),
            next_handle: 0,
            mapped: HashSet::new(),
            profiler: Profiler::default(),
            faults: HashMap::new(),
            stats: SimStats::default(),
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Default-configured device behind the trait object the pipeline expects.
    pub fn shared() -> Arc<dyn Device> {
        Arc::new(Self::default())
    }

    pub fn config(&self) -> &SimDeviceConfig {
        &self.config
    }

    /// Forces the outcome of the elapsed-time query with the given zero-based index.
    ///
    /// Queries are counted over the whole lifetime of the device.
    pub fn set_elapsed_fault(&self, query_index: u64, fault: ElapsedFault) -> LaunchResult<()> {
        lock_named(&self.state, "sim state")?
            .faults
            .insert(query_index, fault);
        Ok(())
    }

    pub fn stats(&self) -> LaunchResult<SimStats> {
        let state = lock_named(&self.state, "sim state")?;
        Ok(SimStats {
            live_allocations: state.memory.live_allocations(),
            live_streams: state.streams.len(),
            live_events: state.events.len(),
            ..state.stats
        })
    }

    fn copy_cost(&self, bytes: usize) -> u64 {
        (bytes as u64).div_ceil(1024) * self.config.copy_ns_per_kib
    }

    fn execute(
        &self,
        state: &mut SimState,
        recipe: &SimRecipe,
        tensors: &[LaunchTensor],
        workspace: DeviceAddr,
    ) -> LaunchResult<u64> {
        let records: HashMap<TensorId, &LaunchTensor> =
            tensors.iter().map(|record| (record.id, record)).collect();
        let declared: HashMap<TensorId, u64> = recipe
            .tensors()
            .iter()
            .map(|info| (info.id, element_count(&info.max_shape)))
            .collect();

        let locate = |id: TensorId| -> LaunchResult<(DeviceAddr, u64)> {
            if let Some((offset, _, elements)) = recipe.intermediates.get(&id) {
                return Ok((workspace + offset, *elements));
            }
            let record = records.get(&id).ok_or_else(|| {
                LaunchError::device("launch", format!("no launch record for tensor {id:#x}"))
            })?;
            if record.kind.memory_kind() != MemoryKind::Device {
                return Err(LaunchError::device(
                    "launch",
                    format!("tensor {} is not in device memory", record.name),
                ));
            }
            let elements = if record.shape.iter().all(|dim| *dim == 0) {
                declared.get(&id).copied().unwrap_or(0)
            } else {
                element_count(&record.shape)
            };
            Ok((record.address, elements))
        };
        let dtype_of = |id: TensorId| {
            recipe.dtypes.get(&id).copied().ok_or_else(|| {
                LaunchError::device("launch", format!("unknown tensor {id:#x}"))
            })
        };

        let mut written = 0u64;
        for inst in &recipe.program {
            let mut operands = Vec::with_capacity(inst.inputs.len());
            for id in &inst.inputs {
                let (addr, elements) = locate(*id)?;
                let dtype = dtype_of(*id)?;
                let mut bytes = vec![0u8; (elements * dtype.size_in_bytes()) as usize];
                state.memory.read(addr, &mut bytes)?;
                operands.push(decode(dtype, &bytes)?);
            }
            let mut result = inst.op.apply(&operands)?;
            if recipe.round_bf16 {
                round_to_bf16(&mut result);
            }
            for id in &inst.outputs {
                let (addr, elements) = locate(*id)?;
                let dtype = dtype_of(*id)?;
                let count = result.len().min(elements as usize);
                state.memory.write(addr, &encode(dtype, &result[..count])?)?;
                written += count as u64;
            }
            tracing::trace!(node = %inst.name, op = inst.op.as_str(), "executed node");
        }
        Ok(written)
    }
}

impl Device for SimDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn address_alignment(&self) -> u64 {
        self.config.alignment
    }

    fn malloc(&self, bytes: u64) -> LaunchResult<DeviceAddr> {
        let mut state = lock_named(&self.state, "sim state")?;
        let addr = state.memory.alloc(bytes)?;
        state.stats.allocations += 1;
        Ok(addr)
    }

    fn free(&self, addr: DeviceAddr) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        state.memory.free(addr)?;
        state.stats.frees += 1;
        Ok(())
    }

    fn host_map(&self, data: &[u8]) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        state.mapped.insert((data.as_ptr() as usize, data.len()));
        state.stats.host_maps += 1;
        Ok(())
    }

    fn host_unmap(&self, data: &[u8]) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        if state.mapped.remove(&(data.as_ptr() as usize, data.len())) {
            Ok(())
        } else {
            Err(LaunchError::device("host_unmap", "buffer was never mapped"))
        }
    }

    fn create_stream(&self) -> LaunchResult<StreamId> {
        let mut state = lock_named(&self.state, "sim state")?;
        let id = state.handle();
        state.streams.insert(id, 0);
        Ok(StreamId(id))
    }

    fn destroy_stream(&self, stream: StreamId) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        state
            .streams
            .remove(&stream.0)
            .map(|_| ())
            .ok_or_else(|| LaunchError::device("destroy_stream", format!("unknown stream {}", stream.0)))
    }

    fn create_event(&self, collect_time: bool) -> LaunchResult<EventId> {
        let mut state = lock_named(&self.state, "sim state")?;
        let id = state.handle();
        state.events.insert(
            id,
            SimEvent {
                collect_time,
                timestamp_ns: None,
            },
        );
        Ok(EventId(id))
    }

    fn destroy_event(&self, event: EventId) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        state
            .events
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| LaunchError::device("destroy_event", format!("unknown event {}", event.0)))
    }

    fn copy_host_to_device(
        &self,
        stream: StreamId,
        src: &[u8],
        dst: DeviceAddr,
    ) -> LaunchResult<()> {
        let cost = self.copy_cost(src.len());
        let mut state = lock_named(&self.state, "sim state")?;
        *state.clock("copy_host_to_device", stream)? += cost;
        state.memory.write(dst, src)?;
        state.stats.host_to_device_copies += 1;
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        stream: StreamId,
        src: DeviceAddr,
        dst: &mut [u8],
    ) -> LaunchResult<()> {
        let cost = self.copy_cost(dst.len());
        let mut state = lock_named(&self.state, "sim state")?;
        *state.clock("copy_device_to_host", stream)? += cost;
        state.memory.read(src, dst)?;
        state.stats.device_to_host_copies += 1;
        Ok(())
    }

    fn record_event(&self, stream: StreamId, event: EventId) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        let now = *state.clock("record_event", stream)?;
        state.event("record_event", event)?.timestamp_ns = Some(now);
        Ok(())
    }

    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        let ready = state.event("stream_wait_event", event)?.timestamp_ns;
        let clock = state.clock("stream_wait_event", stream)?;
        if let Some(ready) = ready {
            *clock = (*clock).max(ready);
        }
        Ok(())
    }

    fn launch(
        &self,
        stream: StreamId,
        recipe: &dyn Recipe,
        tensors: &[LaunchTensor],
        workspace: DeviceAddr,
    ) -> LaunchResult<()> {
        let recipe = recipe.as_any().downcast_ref::<SimRecipe>().ok_or_else(|| {
            LaunchError::device(
                "launch",
                format!("recipe {} was not built by the simulator compiler", recipe.name()),
            )
        })?;
        let mut state = lock_named(&self.state, "sim state")?;
        let start = *state.clock("launch", stream)?;
        let written = self.execute(&mut state, recipe, tensors, workspace)?;
        let end = start + self.config.launch_overhead_ns + written * self.config.ns_per_element;
        *state.clock("launch", stream)? = end;
        state.stats.launches += 1;
        if state.profiler.active {
            let (start_us, end_us) = (start as f64 / 1e3, end as f64 / 1e3);
            let events = &mut state.profiler.events;
            events.push(TraceEvent {
                name: format!("Launch:{}", recipe.name()),
                timestamp_us: start_us,
            });
            events.push(TraceEvent {
                name: "Busy:engine".to_string(),
                timestamp_us: start_us,
            });
            events.push(TraceEvent {
                name: "Busy:engine".to_string(),
                timestamp_us: end_us,
            });
        }
        Ok(())
    }

    fn synchronize_stream(&self, stream: StreamId) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        state.clock("synchronize_stream", stream)?;
        Ok(())
    }

    fn synchronize(&self) -> LaunchResult<()> {
        Ok(())
    }

    fn event_elapsed_ns(&self, begin: EventId, end: EventId) -> Result<u64, ElapsedTimeError> {
        let mut state = lock_named(&self.state, "sim state")
            .map_err(|err| ElapsedTimeError::Failed(err.to_string()))?;
        let query = state.stats.elapsed_queries;
        state.stats.elapsed_queries += 1;
        match state.faults.get(&query) {
            Some(ElapsedFault::Zero) => return Ok(0),
            Some(ElapsedFault::Unavailable) => return Err(ElapsedTimeError::Unavailable),
            Some(ElapsedFault::Failed) => {
                return Err(ElapsedTimeError::Failed(format!("injected failure on query {query}")))
            }
            None => {}
        }
        let stamp = |event: EventId| {
            let event = state
                .events
                .get(&event.0)
                .ok_or_else(|| ElapsedTimeError::Failed(format!("unknown event {}", event.0)))?;
            if !event.collect_time {
                return Err(ElapsedTimeError::Failed("event does not collect time".to_string()));
            }
            event.timestamp_ns.ok_or(ElapsedTimeError::Unavailable)
        };
        let begin = stamp(begin)?;
        let end = stamp(end)?;
        Ok(end.saturating_sub(begin))
    }

    fn profiler_start(&self) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        state.profiler.active = true;
        state.profiler.events.clear();
        Ok(())
    }

    fn profiler_stop(&self) -> LaunchResult<()> {
        let mut state = lock_named(&self.state, "sim state")?;
        if !state.profiler.active {
            return Err(LaunchError::device("profiler_stop", "profiler is not running"));
        }
        state.profiler.active = false;
        Ok(())
    }

    fn profiler_events(&self) -> LaunchResult<Vec<TraceEvent>> {
        Ok(lock_named(&self.state, "sim state")?.profiler.events.clone())
    }
}

/// Registers the simulator under [`SIM_DEVICE_KIND`] in the global registry.
pub fn register_sim_device() {
    register_device(SIM_DEVICE_KIND, || 1, || Ok(SimDevice::shared()));
}

pub fn register_sim_device_in(registry: &DeviceRegistry) {
    registry.register(SIM_DEVICE_KIND, || 1, || Ok(SimDevice::shared()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_measure_stream_clock() {
        let device = SimDevice::default();
        let stream = device.create_stream().unwrap();
        let begin = device.create_event(true).unwrap();
        let end = device.create_event(true).unwrap();
        let buffer = device.malloc(4096).unwrap();

        device.record_event(stream, begin).unwrap();
        device
            .copy_host_to_device(stream, &[0u8; 2048], buffer)
            .unwrap();
        device.record_event(stream, end).unwrap();
        assert_eq!(device.event_elapsed_ns(begin, end), Ok(20));
    }

    #[test]
    fn unrecorded_events_are_unavailable() {
        let device = SimDevice::default();
        let begin = device.create_event(true).unwrap();
        let end = device.create_event(true).unwrap();
        assert_eq!(
            device.event_elapsed_ns(begin, end),
            Err(ElapsedTimeError::Unavailable)
        );
        let untimed = device.create_event(false).unwrap();
        assert!(matches!(
            device.event_elapsed_ns(untimed, end),
            Err(ElapsedTimeError::Failed(_))
        ));
    }

    #[test]
    fn faults_apply_to_one_query() {
        let device = SimDevice::default();
        device.set_elapsed_fault(1, ElapsedFault::Zero).unwrap();
        let stream = device.create_stream().unwrap();
        let begin = device.create_event(true).unwrap();
        let end = device.create_event(true).unwrap();
        let buffer = device.malloc(1024).unwrap();
        device.record_event(stream, begin).unwrap();
        device.copy_host_to_device(stream, &[0u8; 1024], buffer).unwrap();
        device.record_event(stream, end).unwrap();
        assert_eq!(device.event_elapsed_ns(begin, end), Ok(10));
        assert_eq!(device.event_elapsed_ns(begin, end), Ok(0));
        assert_eq!(device.event_elapsed_ns(begin, end), Ok(10));
        assert_eq!(device.stats().unwrap().elapsed_queries, 3);
    }

    #[test]
    fn waiting_on_event_advances_clock() {
        let device = SimDevice::default();
        let slow = device.create_stream().unwrap();
        let fast = device.create_stream().unwrap();
        let buffer = device.malloc(1 << 20).unwrap();
        let ready = device.create_event(true).unwrap();
        let begin = device.create_event(true).unwrap();

        device.record_event(fast, begin).unwrap();
        device
            .copy_host_to_device(slow, &vec![0u8; 1 << 20], buffer)
            .unwrap();
        device.record_event(slow, ready).unwrap();
        device.stream_wait_event(fast, ready).unwrap();
        let end = device.create_event(true).unwrap();
        device.record_event(fast, end).unwrap();
        assert_eq!(device.event_elapsed_ns(begin, end), Ok(10240));
    }

    #[test]
    fn unmapping_unknown_memory_fails() {
        let device = SimDevice::default();
        let data = vec![1u8; 16];
        device.host_map(&data).unwrap();
        device.host_unmap(&data).unwrap();
        assert!(device.host_unmap(&data).is_err());
    }

    #[test]
    fn stats_track_live_handles() {
        let device = SimDevice::default();
        let stream = device.create_stream().unwrap();
        let addr = device.malloc(64).unwrap();
        assert_eq!(device.stats().unwrap().live_allocations, 1);
        device.free(addr).unwrap();
        device.destroy_stream(stream).unwrap();
        let stats = device.stats().unwrap();
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.live_streams, 0);
        assert_eq!(stats.frees, 1);
    }
}
