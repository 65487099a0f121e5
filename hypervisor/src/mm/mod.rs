//! Access to host physical memory.

use crate::mm::e820::{E820Map, E820Type};
use alloc::{boxed::Box, vec};
use x86::bits64::paging::PAddr;

pub mod e820;

/// The services the platform provides for host physical memory.
pub trait HostMemory {
    /// Allocates `size` bytes of physical memory ending at or below
    /// `max_addr`.
    fn alloc_below(&mut self, size: u64, max_addr: u64) -> Option<PAddr>;

    /// Translates `[hpa, hpa + len)` into accessible memory.
    fn hpa_slice(&self, hpa: PAddr, len: usize) -> Option<&[u8]>;

    /// Mutable variant of [`HostMemory::hpa_slice`].
    fn hpa_slice_mut(&mut self, hpa: PAddr, len: usize) -> Option<&mut [u8]>;
}

/// A window of host RAM backed by an owned buffer.
///
/// Allocations are served from the window's e820 map, so the returned
/// addresses are always translatable by the same instance.
pub struct RamRegion {
    base: u64,
    memory: Box<[u8]>,
    e820: E820Map,
}

impl RamRegion {
    /// Creates a zeroed window `[base, base + size)` that is entirely usable
    /// RAM.
    pub fn new(base: PAddr, size: usize) -> Self {
        let mut e820 = E820Map::new();
        e820.add(base.as_u64(), size as u64, E820Type::Ram);

        Self::with_e820(base, size, e820)
    }

    /// Creates a zeroed window with a custom memory map. Ranges of the map
    /// outside of the window are never translatable.
    pub fn with_e820(base: PAddr, size: usize, e820: E820Map) -> Self {
        log::trace!("Creating RAM window at {:x} ({:#x} bytes)", base, size);

        Self {
            base: base.as_u64(),
            memory: vec![0u8; size].into_boxed_slice(),
            e820,
        }
    }

    pub fn e820(&self) -> &E820Map {
        &self.e820
    }

    fn range(&self, hpa: PAddr, len: usize) -> Option<core::ops::Range<usize>> {
        let offset = usize::try_from(hpa.as_u64().checked_sub(self.base)?).ok()?;
        let end = offset.checked_add(len)?;

        (end <= self.memory.len()).then_some(offset..end)
    }
}

impl HostMemory for RamRegion {
    fn alloc_below(&mut self, size: u64, max_addr: u64) -> Option<PAddr> {
        self.e820.alloc_below(size, max_addr)
    }

    fn hpa_slice(&self, hpa: PAddr, len: usize) -> Option<&[u8]> {
        let range = self.range(hpa, len)?;
        Some(&self.memory[range])
    }

    fn hpa_slice_mut(&mut self, hpa: PAddr, len: usize) -> Option<&mut [u8]> {
        let range = self.range(hpa, len)?;
        Some(&mut self.memory[range])
    }
}
