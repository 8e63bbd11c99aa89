//! Device abstraction: memory, streams, events and recipe launches.
//!
//! [`Device`] is the low-level, handle-based contract a device implementation provides. The
//! RAII wrappers [`Stream`], [`Event`] and [`DeviceBuffer`] release their handles on drop and
//! are what the pipeline works with.

mod buffers;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, LaunchResult};
use crate::recipe::{Recipe, TensorId};
use crate::tensor::{Shape, TensorKind};

pub use buffers::{DeviceBuffer, HostBuffer};

pub type DeviceAddr = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

/// Failure reported when querying the elapsed time between two events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElapsedTimeError {
    /// The device has no timestamp for this pair; the sample is skipped.
    Unavailable,
    Failed(String),
}

impl fmt::Display for ElapsedTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElapsedTimeError::Unavailable => f.write_str("elapsed time unavailable"),
            ElapsedTimeError::Failed(message) => write!(f, "elapsed time query failed: {message}"),
        }
    }
}

/// One entry of a device trace collected by the profiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub name: String,
    pub timestamp_us: f64,
}

/// Per-tensor record passed to [`Device::launch`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchTensor {
    pub name: String,
    pub id: TensorId,
    pub kind: TensorKind,
    /// Device address, host address for host-resident tensors, or 0.
    pub address: u64,
    pub shape: Shape,
}

/// Handle-based device contract.
///
/// Operations submitted to one stream execute in submission order. Ordering across streams is
/// only established through [`Device::record_event`] and [`Device::stream_wait_event`].
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Minimum alignment of device allocations.
    fn address_alignment(&self) -> u64;

    fn malloc(&self, bytes: u64) -> LaunchResult<DeviceAddr>;

    fn free(&self, addr: DeviceAddr) -> LaunchResult<()>;

    /// Allocates zeroed host memory suitable for DMA.
    fn host_malloc(&self, bytes: u64) -> LaunchResult<HostBuffer> {
        let len = usize::try_from(bytes)
            .map_err(|_| LaunchError::device("host_malloc", format!("{bytes} bytes")))?;
        Ok(HostBuffer::zeroed(len))
    }

    /// Registers caller-owned host memory for DMA.
    fn host_map(&self, data: &[u8]) -> LaunchResult<()>;

    fn host_unmap(&self, data: &[u8]) -> LaunchResult<()>;

    fn create_stream(&self) -> LaunchResult<StreamId>;

    fn destroy_stream(&self, stream: StreamId) -> LaunchResult<()>;

    fn create_event(&self, collect_time: bool) -> LaunchResult<EventId>;

    fn destroy_event(&self, event: EventId) -> LaunchResult<()>;

    fn copy_host_to_device(&self, stream: StreamId, src: &[u8], dst: DeviceAddr)
        -> LaunchResult<()>;

    fn copy_device_to_host(
        &self,
        stream: StreamId,
        src: DeviceAddr,
        dst: &mut [u8],
    ) -> LaunchResult<()>;

    fn record_event(&self, stream: StreamId, event: EventId) -> LaunchResult<()>;

    fn stream_wait_event(&self, stream: StreamId, event: EventId) -> LaunchResult<()>;

    fn launch(
        &self,
        stream: StreamId,
        recipe: &dyn Recipe,
        tensors: &[LaunchTensor],
        workspace: DeviceAddr,
    ) -> LaunchResult<()>;

    fn synchronize_stream(&self, stream: StreamId) -> LaunchResult<()>;

    fn synchronize(&self) -> LaunchResult<()>;

    fn event_elapsed_ns(&self, begin: EventId, end: EventId) -> Result<u64, ElapsedTimeError>;

    fn profiler_start(&self) -> LaunchResult<()> {
        Err(LaunchError::device("profiler_start", "profiling not supported"))
    }

    fn profiler_stop(&self) -> LaunchResult<()> {
        Err(LaunchError::device("profiler_stop", "profiling not supported"))
    }

    /// Events captured between the last start/stop pair.
    fn profiler_events(&self) -> LaunchResult<Vec<TraceEvent>> {
        Err(LaunchError::device("profiler_events", "profiling not supported"))
    }
}

/// Command stream owned by the pipeline; destroyed on drop.
pub struct Stream {
    device: Arc<dyn Device>,
    id: StreamId,
}

impl Stream {
    pub fn create(device: &Arc<dyn Device>) -> LaunchResult<Self> {
        let id = device.create_stream()?;
        Ok(Self {
            device: Arc::clone(device),
            id,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn copy_to_device(&self, src: &[u8], dst: DeviceAddr) -> LaunchResult<()> {
        self.device.copy_host_to_device(self.id, src, dst)
    }

    pub fn copy_to_host(&self, src: DeviceAddr, dst: &mut [u8]) -> LaunchResult<()> {
        self.device.copy_device_to_host(self.id, src, dst)
    }

    pub fn record(&self, event: &Event) -> LaunchResult<()> {
        self.device.record_event(self.id, event.id)
    }

    pub fn wait(&self, event: &Event) -> LaunchResult<()> {
        self.device.stream_wait_event(self.id, event.id)
    }

    pub fn launch(
        &self,
        recipe: &dyn Recipe,
        tensors: &[LaunchTensor],
        workspace: DeviceAddr,
    ) -> LaunchResult<()> {
        self.device.launch(self.id, recipe, tensors, workspace)
    }

    pub fn synchronize(&self) -> LaunchResult<()> {
        self.device.synchronize_stream(self.id)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_stream(self.id) {
            tracing::warn!(stream = self.id.0, %err, "failed to destroy stream");
        }
    }
}

/// Synchronization event; destroyed on drop.
pub struct Event {
    device: Arc<dyn Device>,
    id: EventId,
}

impl Event {
    pub fn create(device: &Arc<dyn Device>, collect_time: bool) -> LaunchResult<Self> {
        let id = device.create_event(collect_time)?;
        Ok(Self {
            device: Arc::clone(device),
            id,
        })
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Nanoseconds between `self` and the later event `end`.
    pub fn elapsed_ns(&self, end: &Event) -> Result<u64, ElapsedTimeError> {
        self.device.event_elapsed_ns(self.id, end.id)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("id", &self.id).finish()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_event(self.id) {
            tracing::warn!(event = self.id.0, %err, "failed to destroy event");
        }
    }
}
