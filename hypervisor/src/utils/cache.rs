//! Cache maintenance for memory that is fetched by processors which are not
//! yet cache coherent with the writer (e.g. a core starting in real mode).

use cfg_if::cfg_if;

pub const CACHE_LINE_SIZE: usize = 64;

/// Orders all previous loads and stores before any following ones.
#[inline]
pub fn memory_barrier() {
    cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe { core::arch::x86_64::_mm_mfence() };
        } else {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
}

/// Writes back and invalidates the cache line containing `ptr`.
#[inline]
pub fn flush_cache_line(ptr: *const u8) {
    cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe { core::arch::x86_64::_mm_clflush(ptr) };
        } else {
            let _ = ptr;
            memory_barrier();
        }
    }
}

/// Flushes every cache line covering `memory`.
pub fn flush_cache_range(memory: &[u8]) {
    if memory.is_empty() {
        return;
    }

    let start = memory.as_ptr() as usize & !(CACHE_LINE_SIZE - 1);
    let end = memory.as_ptr() as usize + memory.len();

    for line in (start..end).step_by(CACHE_LINE_SIZE) {
        flush_cache_line(line as *const u8);
    }
}
