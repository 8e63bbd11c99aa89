use std::collections::BTreeMap;

use reciperun::error::{LaunchError, LaunchResult};
use reciperun::runtime::sections::align_up;

const BASE_ADDRESS: u64 = 0x1000_0000;

/// Bump-allocated device address space backed by host vectors.
#[derive(Debug)]
pub(crate) struct DeviceMemory {
    allocations: BTreeMap<u64, Vec<u8>>,
    next: u64,
    alignment: u64,
}

impl DeviceMemory {
    pub(crate) fn new(alignment: u64) -> Self {
        Self {
            allocations: BTreeMap::new(),
            next: BASE_ADDRESS,
            alignment: alignment.max(1),
        }
    }

    /// Zero-filled allocation; zero-byte requests still get a distinct address.
    pub(crate) fn alloc(&mut self, bytes: u64) -> LaunchResult<u64> {
        let len = usize::try_from(bytes)
            .map_err(|_| LaunchError::device("malloc", format!("{bytes} bytes")))?;
        let addr = self.next;
        let end = addr
            .checked_add(bytes.max(1))
            .ok_or_else(|| LaunchError::device("malloc", format!("{bytes} bytes")))?;
        self.next = align_up(end, self.alignment)?;
        self.allocations.insert(addr, vec![0u8; len]);
        Ok(addr)
    }

    pub(crate) fn free(&mut self, addr: u64) -> LaunchResult<()> {
        self.allocations
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| LaunchError::device("free", format!("unknown address {addr:#x}")))
    }

    fn locate(&self, addr: u64, len: usize) -> LaunchResult<(u64, usize)> {
        let (base, buffer) = self
            .allocations
            .range(..=addr)
            .next_back()
            .ok_or_else(|| LaunchError::device("access", format!("unmapped address {addr:#x}")))?;
        let offset = (addr - base) as usize;
        if offset + len > buffer.len() {
            return Err(LaunchError::device(
                "access",
                format!(
                    "{len} bytes at {addr:#x} exceed allocation {base:#x} of {} bytes",
                    buffer.len()
                ),
            ));
        }
        Ok((*base, offset))
    }

    pub(crate) fn read(&self, addr: u64, dst: &mut [u8]) -> LaunchResult<()> {
        let (base, offset) = self.locate(addr, dst.len())?;
        let buffer = &self.allocations[&base];
        dst.copy_from_slice(&buffer[offset..offset + dst.len()]);
        Ok(())
    }

    pub(crate) fn write(&mut self, addr: u64, src: &[u8]) -> LaunchResult<()> {
        let (base, offset) = self.locate(addr, src.len())?;
        if let Some(buffer) = self.allocations.get_mut(&base) {
            buffer[offset..offset + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.allocations.len()
    }
}
