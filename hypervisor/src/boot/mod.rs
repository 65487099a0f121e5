//! Everything needed to start the secondary processors.

pub mod reloc;
pub mod stack;
pub mod trampoline;
