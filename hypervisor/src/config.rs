//! Build-time platform configuration.

use x86::bits64::paging::BASE_PAGE_SIZE;

/// Size of the boot stack of a single physical cpu.
pub const CONFIG_STACK_SIZE: usize = 0x2000;

/// Alignment of the initial stack pointer handed to a secondary cpu.
pub const CPU_STACK_ALIGN: u64 = 16;

/// Highest number of physical cpus the hypervisor brings up.
pub const MAX_PCPU_NUM: u16 = 8;

/// The trampoline has to be addressable from real mode.
pub const MEM_1M: u64 = 0x10_0000;

/// Highest number of virtual PCI devices attached to a single vPCI root.
pub const MAX_PCI_DEV_NUM: usize = 96;

/// `1 << VDEV_LIST_HASHBITS` buckets are used for the vdev lookup index.
pub const VDEV_LIST_HASHBITS: u32 = 4;

/// Number of BAR registers in a type 0 configuration header.
pub const PCI_BAR_COUNT: usize = 6;

/// PCIe extended configuration space.
pub const PCI_CFG_SPACE_SIZE: usize = 0x1000;

const_assert_eq!(CONFIG_STACK_SIZE % BASE_PAGE_SIZE, 0);
const_assert!(CPU_STACK_ALIGN.is_power_of_two());
const_assert_eq!(PCI_CFG_SPACE_SIZE % 4, 0);
const_assert!(MAX_PCI_DEV_NUM >= (1 << VDEV_LIST_HASHBITS));
