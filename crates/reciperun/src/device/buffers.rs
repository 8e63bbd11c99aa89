use std::fmt;
use std::sync::Arc;

use super::{Device, DeviceAddr};
use crate::error::LaunchResult;

/// Device allocation released when the last owner drops it.
pub struct DeviceBuffer {
    device: Arc<dyn Device>,
    addr: DeviceAddr,
    bytes: u64,
}

impl DeviceBuffer {
    pub fn allocate(device: &Arc<dyn Device>, bytes: u64) -> LaunchResult<Self> {
        let addr = device.malloc(bytes)?;
        Ok(Self {
            device: Arc::clone(device),
            addr,
            bytes,
        })
    }

    pub fn address(&self) -> DeviceAddr {
        self.addr
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("addr", &self.addr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.addr) {
            tracing::warn!(addr = self.addr, %err, "failed to free device buffer");
        }
    }
}

/// Host staging memory for one tensor.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HostBuffer {
    data: Vec<u8>,
}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Host address handed to the device for host-resident tensors.
    pub fn address(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    /// Freezes the buffer so output sinks can retain it cheaply.
    pub fn into_shared(self) -> Arc<[u8]> {
        Arc::from(self.data)
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}
