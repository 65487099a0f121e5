//! Load-time relocation of the hypervisor image.
//!
//! The hypervisor is linked at a fixed address but may be loaded higher. The
//! trampoline is relocated differently (it is copied below 1 MiB), so any
//! trampoline symbol the hypervisor takes the address of has to be converted
//! back to its link address before it can be used as an offset into the
//! trampoline image.
//!
//! ## Assumptions
//!
//! Both are not checked at runtime, violating them yields wrong offsets:
//! - The hypervisor is always loaded at or above its link address.
//! - The trampoline is linked below the hypervisor.

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Relocation {
    delta: u64,
}

impl Relocation {
    /// Relocation of an image linked at `link_base` and loaded at
    /// `load_base`.
    pub const fn new(load_base: u64, link_base: u64) -> Self {
        Self {
            delta: load_base.wrapping_sub(link_base),
        }
    }

    /// The image runs at its link address.
    pub const fn identity() -> Self {
        Self { delta: 0 }
    }

    /// Displacement between the load and the link address of the image.
    pub const fn delta(&self) -> u64 {
        self.delta
    }

    /// Converts the runtime address of a trampoline symbol into its link
    /// address.
    pub const fn relo_addr(&self, runtime_address: u64) -> u64 {
        runtime_address.wrapping_sub(self.delta)
    }

    /// Converts a link address into the address the symbol has at runtime.
    pub const fn runtime_addr(&self, link_address: u64) -> u64 {
        link_address.wrapping_add(self.delta)
    }
}
