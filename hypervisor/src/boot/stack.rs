use crate::{config::CPU_STACK_ALIGN, utils::paging::align_down};
use core::ops::Range;

/// The boot stacks of all physical processors, laid out back to back.
///
/// ```text
///  Low     base                        stack of pcpu 0
///          base + stack_size           stack of pcpu 1
///          ...
///  High    base + count * stack_size
/// ```
#[derive(Debug, Copy, Clone)]
pub struct StackArea {
    base: u64,
    stack_size: u64,
    count: u16,
}

impl StackArea {
    pub const fn new(base: u64, stack_size: u64, count: u16) -> Self {
        Self {
            base,
            stack_size,
            count,
        }
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    /// Memory backing the stack of `pcpu_id`.
    pub fn stack_region(&self, pcpu_id: u16) -> Option<Range<u64>> {
        if pcpu_id >= self.count {
            return None;
        }

        let start = self.base + u64::from(pcpu_id) * self.stack_size;
        Some(start..start + self.stack_size)
    }

    /// Initial stack pointer of `pcpu_id`: the last byte of its stack, aligned
    /// down to [`CPU_STACK_ALIGN`].
    pub fn stack_top(&self, pcpu_id: u16) -> Option<u64> {
        let region = self.stack_region(pcpu_id)?;

        Some(align_down(region.end - 1, CPU_STACK_ALIGN))
    }
}
