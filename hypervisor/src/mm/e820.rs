//! Host physical memory map and the boot-time allocator carving from it.

use crate::utils::paging::{round_page_down, round_page_up};
use tinyvec::ArrayVec;
use x86::bits64::paging::PAddr;

pub const MAX_E820_ENTRIES: usize = 32;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum E820Type {
    #[default]
    Ram,
    Reserved,
    AcpiReclaim,
    AcpiNvs,
    Unusable,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct E820Entry {
    pub base_address: u64,
    pub length: u64,
    pub kind: E820Type,
}

impl E820Entry {
    pub const fn end(&self) -> u64 {
        self.base_address.saturating_add(self.length)
    }
}

#[derive(Debug, Default)]
pub struct E820Map {
    entries: ArrayVec<[E820Entry; MAX_E820_ENTRIES]>,
}

impl E820Map {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a range. Returns `false` if the map is full.
    pub fn add(&mut self, base_address: u64, length: u64, kind: E820Type) -> bool {
        self.entries
            .try_push(E820Entry {
                base_address,
                length,
                kind,
            })
            .is_none()
    }

    pub fn entries(&self) -> &[E820Entry] {
        &self.entries
    }

    /// Total bytes of usable RAM left in the map.
    pub fn free_ram(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.kind == E820Type::Ram)
            .map(|entry| entry.length)
            .sum()
    }

    /// Allocates `size` bytes (rounded up to pages) of RAM ending at or below
    /// `max_addr`.
    ///
    /// The first RAM range that fits is used. The block is carved from the
    /// highest pages of that range below `max_addr` and recorded as reserved,
    /// so it is never handed out twice. RAM left below or above the block
    /// stays usable as separate entries.
    pub fn alloc_below(&mut self, size: u64, max_addr: u64) -> Option<PAddr> {
        let size = round_page_up(size);
        if size == 0 {
            return None;
        }

        for index in 0..self.entries.len() {
            let entry = self.entries[index];
            if entry.kind != E820Type::Ram {
                continue;
            }

            let start = round_page_up(entry.base_address);
            let end = round_page_down(entry.end());
            let top = end.min(round_page_down(max_addr));

            let block = match top.checked_sub(size) {
                Some(block) if block >= start => block,
                _ => continue,
            };

            // Partial pages at either end of the range can't be handed out,
            // they go with the block.
            let reserved_start = if block == start { entry.base_address } else { block };
            let reserved_end = if top == end { entry.end() } else { top };

            let below = reserved_start > entry.base_address;
            let above = reserved_end < entry.end();
            let extra = usize::from(below) + usize::from(above);
            if self.entries.len() + extra > self.entries.capacity() {
                continue;
            }

            self.entries[index] = E820Entry {
                base_address: reserved_start,
                length: reserved_end - reserved_start,
                kind: E820Type::Reserved,
            };
            if below {
                self.entries.push(E820Entry {
                    base_address: entry.base_address,
                    length: reserved_start - entry.base_address,
                    kind: E820Type::Ram,
                });
            }
            if above {
                self.entries.push(E820Entry {
                    base_address: reserved_end,
                    length: entry.end() - reserved_end,
                    kind: E820Type::Ram,
                });
            }

            log::trace!(
                "e820: reserved {} pages at {:#x}",
                crate::bytes_to_pages!(size),
                block
            );
            return Some(PAddr::from(block));
        }

        log::warn!("e820: no RAM for {:#x} bytes below {:#x}", size, max_addr);
        None
    }
}
