//! The secondary processor boot trampoline.
//!
//! Application processors start in real mode at a page below 1 MiB. The
//! trampoline code is linked into the hypervisor image, copied to such a page
//! and then patched, because every absolute reference inside of it (far jump,
//! boot page tables, GDT, the 64-bit jump and the hypervisor entry) depends on
//! where it ends up in physical memory.
//!
//! The copy is prepared once on the bootstrap processor. Before waking up a
//! secondary processor, its boot stack is written into the trampoline.

use crate::{
    boot::{reloc::Relocation, stack::StackArea},
    config::MEM_1M,
    mm::HostMemory,
    utils::cache::{flush_cache_line, flush_cache_range, memory_barrier},
};
use snafu::prelude::*;
use spin::Once;
use x86::bits64::paging::PAddr;

#[derive(Debug, Snafu)]
pub enum TrampolineError {
    #[snafu(display("Failed to allocate {:#x} bytes below 1MB for the trampoline", size))]
    AllocationFailed { size: u64 },

    #[snafu(display("Trampoline image has {:#x} bytes, but {:#x} are required", available, size))]
    ImageTruncated { size: u64, available: usize },

    #[snafu(display("Trampoline end marker {:#x} is below its start {:#x}", end, start))]
    InvalidImage { start: u64, end: u64 },

    #[snafu(display("Fixup {} at offset {:#x} is outside of the trampoline", name, offset))]
    FixupOutOfBounds { name: &'static str, offset: u64 },

    #[snafu(display("Host physical address {:#x} is not mapped", hpa))]
    UnmappedMemory { hpa: u64 },

    #[snafu(display("No boot stack for pcpu {}", pcpu_id))]
    NoSuchStack { pcpu_id: u16 },

    #[snafu(display("Trampoline has already been prepared at {:#x}", base))]
    AlreadyPrepared { base: u64 },

    #[snafu(display("Trampoline has not been prepared yet"))]
    NotPrepared,
}

/// The named sites inside of the trampoline.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrampolineSymbol {
    /// First instruction executed after the real mode far jump.
    FixupTarget,
    /// Segment of the real mode far jump.
    FixupCs,
    /// Offset of the real mode far jump.
    FixupIp,
    /// 32-bit pointer to the boot page tables (loaded into cr3).
    BootPageTablesPtr,
    /// First entry of the boot page tables.
    BootPageTablesStart,
    /// The 4 page directory pointer table entries.
    PdptAddr,
    /// Pseudo descriptor of the boot GDT (2-byte limit, 8-byte base).
    GdtPtr,
    /// 32-bit target of the jump into long mode.
    Start64Fixup,
    /// 64-bit pointer to the hypervisor's entry point of secondary processors.
    MainEntry,
    /// Initial stack pointer of the processor being started.
    SecondaryCpuStack,
}

/// Runtime addresses of the trampoline symbols, as seen by the (relocated)
/// hypervisor.
#[derive(Debug, Default, Copy, Clone)]
pub struct TrampolineSymbols {
    pub fixup_target: u64,
    pub fixup_cs: u64,
    pub fixup_ip: u64,
    pub boot_page_tables_ptr: u64,
    pub boot_page_tables_start: u64,
    pub pdpt_addr: u64,
    pub gdt_ptr: u64,
    pub start64_fixup: u64,
    pub main_entry: u64,
    pub secondary_cpu_stack: u64,
}

impl TrampolineSymbols {
    pub fn address(&self, symbol: TrampolineSymbol) -> u64 {
        match symbol {
            TrampolineSymbol::FixupTarget => self.fixup_target,
            TrampolineSymbol::FixupCs => self.fixup_cs,
            TrampolineSymbol::FixupIp => self.fixup_ip,
            TrampolineSymbol::BootPageTablesPtr => self.boot_page_tables_ptr,
            TrampolineSymbol::BootPageTablesStart => self.boot_page_tables_start,
            TrampolineSymbol::PdptAddr => self.pdpt_addr,
            TrampolineSymbol::GdtPtr => self.gdt_ptr,
            TrampolineSymbol::Start64Fixup => self.start64_fixup,
            TrampolineSymbol::MainEntry => self.main_entry,
            TrampolineSymbol::SecondaryCpuStack => self.secondary_cpu_stack,
        }
    }
}

/// The trampoline as it is stored inside of the hypervisor image.
///
/// `start` and `end` are the runtime addresses of the section markers, `load`
/// holds the bytes of the section.
#[derive(Debug, Copy, Clone)]
pub struct TrampolineImage<'a> {
    load: &'a [u8],
    start: u64,
    end: u64,
    symbols: TrampolineSymbols,
}

impl<'a> TrampolineImage<'a> {
    pub fn new(load: &'a [u8], start: u64, end: u64, symbols: TrampolineSymbols) -> Self {
        Self {
            load,
            start,
            end,
            symbols,
        }
    }

    /// Size of the image, `None` if the markers are swapped.
    pub fn size(&self) -> Option<u64> {
        self.end.checked_sub(self.start)
    }

    pub fn symbols(&self) -> &TrampolineSymbols {
        &self.symbols
    }
}

#[derive(Debug, Copy, Clone)]
enum Width {
    U16,
    U32,
    U64,
}

impl Width {
    const fn bytes(self) -> usize {
        match self {
            Width::U16 => 2,
            Width::U32 => 4,
            Width::U64 => 8,
        }
    }

    fn read(self, code: &[u8], at: usize) -> Option<u64> {
        let bytes = code.get(at..at.checked_add(self.bytes())?)?;

        Some(match self {
            Width::U16 => u64::from(u16::from_le_bytes(bytes.try_into().ok()?)),
            Width::U32 => u64::from(u32::from_le_bytes(bytes.try_into().ok()?)),
            Width::U64 => u64::from_le_bytes(bytes.try_into().ok()?),
        })
    }

    /// Stores the low `self.bytes()` bytes of `value`.
    fn write(self, code: &mut [u8], at: usize, value: u64) -> Option<()> {
        let bytes = code.get_mut(at..at.checked_add(self.bytes())?)?;
        bytes.copy_from_slice(&value.to_le_bytes()[..self.bytes()]);

        Some(())
    }
}

#[derive(Debug, Copy, Clone)]
enum FixupKind {
    /// Real mode segment of the fixup target.
    Segment,
    /// Real mode offset of the fixup target.
    Offset,
    /// Adds the physical base of the trampoline.
    AddBase,
    /// Adds the relocation delta of the hypervisor.
    AddDelta,
}

#[derive(Debug, Copy, Clone)]
struct Fixup {
    name: &'static str,
    symbol: TrampolineSymbol,
    /// Additional offset from the symbol.
    offset: u64,
    width: Width,
    kind: FixupKind,
}

impl Fixup {
    const fn new(
        name: &'static str, symbol: TrampolineSymbol, offset: u64, width: Width, kind: FixupKind,
    ) -> Self {
        Self {
            name,
            symbol,
            offset,
            width,
            kind,
        }
    }
}

/// The fixups in the order they are applied. Offsets and widths are dictated
/// by the trampoline assembly and must not change.
const FIXUPS: [Fixup; 11] = [
    Fixup::new("cs", TrampolineSymbol::FixupCs, 0, Width::U16, FixupKind::Segment),
    Fixup::new("ip", TrampolineSymbol::FixupIp, 0, Width::U16, FixupKind::Offset),
    Fixup::new("boot_page_tables_ptr", TrampolineSymbol::BootPageTablesPtr, 0, Width::U32, FixupKind::AddBase),
    Fixup::new("boot_page_tables_start", TrampolineSymbol::BootPageTablesStart, 0, Width::U64, FixupKind::AddBase),
    Fixup::new("pdpt[0]", TrampolineSymbol::PdptAddr, 0, Width::U64, FixupKind::AddBase),
    Fixup::new("pdpt[1]", TrampolineSymbol::PdptAddr, 8, Width::U64, FixupKind::AddBase),
    Fixup::new("pdpt[2]", TrampolineSymbol::PdptAddr, 16, Width::U64, FixupKind::AddBase),
    Fixup::new("pdpt[3]", TrampolineSymbol::PdptAddr, 24, Width::U64, FixupKind::AddBase),
    // Skip the 2-byte limit of the pseudo descriptor.
    Fixup::new("gdt_base", TrampolineSymbol::GdtPtr, 2, Width::U64, FixupKind::AddBase),
    Fixup::new("start64", TrampolineSymbol::Start64Fixup, 0, Width::U32, FixupKind::AddBase),
    Fixup::new("main_entry", TrampolineSymbol::MainEntry, 0, Width::U64, FixupKind::AddDelta),
];

/// A trampoline that has been copied and patched.
#[derive(Debug, Copy, Clone)]
pub struct Trampoline {
    base: PAddr,
    size: u64,
    start: u64,
    symbols: TrampolineSymbols,
    relocation: Relocation,
}

impl Trampoline {
    /// Copies the trampoline below 1 MiB and patches all absolute references.
    pub fn prepare<M: HostMemory>(
        memory: &mut M, image: &TrampolineImage, relocation: Relocation,
    ) -> Result<Self, TrampolineError> {
        let size = image.size().context(InvalidImageSnafu {
            start: image.start,
            end: image.end,
        })?;
        ensure!(
            image.load.len() as u64 >= size,
            ImageTruncatedSnafu {
                size,
                available: image.load.len()
            }
        );

        let base = memory
            .alloc_below(size, MEM_1M)
            .context(AllocationFailedSnafu { size })?;
        log::debug!("trampoline code: {:x} trampoline_size {:#x}", base, size);

        let trampoline = Self {
            base,
            size,
            start: image.start,
            symbols: image.symbols,
            relocation,
        };

        // Copy the code and fix it up for its new location.
        //
        let code = memory
            .hpa_slice_mut(base, size as usize)
            .context(UnmappedMemorySnafu { hpa: base.as_u64() })?;
        code.copy_from_slice(&image.load[..size as usize]);
        trampoline.update_code_refs(code)?;

        // Secondary processors fetch this code with caches that are not yet
        // coherent with ours.
        //
        memory_barrier();
        flush_cache_range(code);

        Ok(trampoline)
    }

    fn update_code_refs(&self, code: &mut [u8]) -> Result<(), TrampolineError> {
        let base = self.base.as_u64();

        // Trampoline starts in real mode, so the target of the far jump is a
        // physical address.
        //
        let target = base + self.offset_of(TrampolineSymbol::FixupTarget);
        log::trace!("trampoline fixup target: {:#x}", target);

        for fixup in FIXUPS.iter() {
            let offset = self.offset_of(fixup.symbol) + fixup.offset;
            let at = usize::try_from(offset).ok();

            let patched = at.and_then(|at| {
                let value = match fixup.kind {
                    FixupKind::Segment => (target >> 4) & 0xffff,
                    FixupKind::Offset => target & 0xf,
                    FixupKind::AddBase => fixup.width.read(code, at)?.wrapping_add(base),
                    FixupKind::AddDelta => fixup
                        .width
                        .read(code, at)?
                        .wrapping_add(self.relocation.delta()),
                };

                fixup.width.write(code, at, value)
            });

            ensure!(
                patched.is_some(),
                FixupOutOfBoundsSnafu {
                    name: fixup.name,
                    offset
                }
            );
        }

        Ok(())
    }

    /// Physical address of the trampoline. This is also the real mode entry
    /// of the secondary processors.
    pub fn base(&self) -> PAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of `symbol` inside of the trampoline.
    pub fn offset_of(&self, symbol: TrampolineSymbol) -> u64 {
        let start = self.relocation.relo_addr(self.start);

        self.relocation
            .relo_addr(self.symbols.address(symbol))
            .wrapping_sub(start)
    }

    fn sym_hpa(&self, symbol: TrampolineSymbol) -> Result<PAddr, TrampolineError> {
        let offset = self.offset_of(symbol);
        ensure!(
            offset.saturating_add(8) <= self.size,
            FixupOutOfBoundsSnafu {
                name: "symbol",
                offset
            }
        );

        Ok(PAddr::from(self.base.as_u64() + offset))
    }

    /// Reads the 8-byte value stored at `symbol`.
    pub fn read_sym<M: HostMemory>(
        &self, memory: &M, symbol: TrampolineSymbol,
    ) -> Result<u64, TrampolineError> {
        let hpa = self.sym_hpa(symbol)?;
        let bytes = memory
            .hpa_slice(hpa, 8)
            .context(UnmappedMemorySnafu { hpa: hpa.as_u64() })?;

        Width::U64
            .read(bytes, 0)
            .context(UnmappedMemorySnafu { hpa: hpa.as_u64() })
    }

    /// Writes the 8-byte `value` to `symbol` and flushes it out of the cache.
    pub fn write_sym<M: HostMemory>(
        &self, memory: &mut M, symbol: TrampolineSymbol, value: u64,
    ) -> Result<(), TrampolineError> {
        let hpa = self.sym_hpa(symbol)?;
        let bytes = memory
            .hpa_slice_mut(hpa, 8)
            .context(UnmappedMemorySnafu { hpa: hpa.as_u64() })?;

        bytes.copy_from_slice(&value.to_le_bytes());
        flush_cache_line(bytes.as_ptr());

        Ok(())
    }

    /// Stores the boot stack of `pcpu_id` in the trampoline. Has to be called
    /// right before the processor is started.
    pub fn write_stack_sym<M: HostMemory>(
        &self, memory: &mut M, stacks: &StackArea, pcpu_id: u16,
    ) -> Result<u64, TrampolineError> {
        let stack_top = stacks
            .stack_top(pcpu_id)
            .context(NoSuchStackSnafu { pcpu_id })?;

        log::trace!("pcpu {} boot stack: {:#x}", pcpu_id, stack_top);
        self.write_sym(memory, TrampolineSymbol::SecondaryCpuStack, stack_top)?;

        Ok(stack_top)
    }
}

/// The trampoline of this boot.
static TRAMPOLINE: Once<Trampoline> = Once::new();

/// Prepares the trampoline of this boot. There is exactly one trampoline, so
/// this can only succeed once.
pub fn prepare_trampoline<M: HostMemory>(
    memory: &mut M, image: &TrampolineImage, relocation: Relocation,
) -> Result<PAddr, TrampolineError> {
    if let Some(trampoline) = TRAMPOLINE.get() {
        return AlreadyPreparedSnafu {
            base: trampoline.base().as_u64(),
        }
        .fail();
    }

    let trampoline = Trampoline::prepare(memory, image, relocation)?;

    Ok(TRAMPOLINE.call_once(|| trampoline).base())
}

pub fn trampoline() -> Option<&'static Trampoline> {
    TRAMPOLINE.get()
}

/// Real mode entry of the secondary processors, if the trampoline has been
/// prepared.
pub fn trampoline_start16_paddr() -> Option<PAddr> {
    trampoline().map(Trampoline::base)
}

pub fn read_trampoline_sym<M: HostMemory>(
    memory: &M, symbol: TrampolineSymbol,
) -> Result<u64, TrampolineError> {
    trampoline().context(NotPreparedSnafu)?.read_sym(memory, symbol)
}

pub fn write_trampoline_sym<M: HostMemory>(
    memory: &mut M, symbol: TrampolineSymbol, value: u64,
) -> Result<(), TrampolineError> {
    trampoline()
        .context(NotPreparedSnafu)?
        .write_sym(memory, symbol, value)
}

pub fn write_trampoline_stack_sym<M: HostMemory>(
    memory: &mut M, stacks: &StackArea, pcpu_id: u16,
) -> Result<u64, TrampolineError> {
    trampoline()
        .context(NotPreparedSnafu)?
        .write_stack_sym(memory, stacks, pcpu_id)
}

/// The trampoline described by the linker script.
#[cfg(feature = "linker-symbols")]
pub mod ld_sym {
    use super::{TrampolineImage, TrampolineSymbols};
    use core::ptr::addr_of;

    extern "C" {
        static ld_trampoline_load: u8;
        static ld_trampoline_start: u8;
        static ld_trampoline_end: u8;

        static trampoline_fixup_target: u8;
        static trampoline_fixup_cs: u8;
        static trampoline_fixup_ip: u8;
        static cpu_boot_page_tables_ptr: u8;
        static cpu_boot_page_tables_start: u8;
        static trampoline_pdpt_addr: u8;
        static trampoline_gdt_ptr: u8;
        static trampoline_start64_fixup: u8;
        static main_entry: u8;
        static secondary_cpu_stack: u8;
    }

    pub fn image() -> TrampolineImage<'static> {
        macro_rules! addr {
            ($symbol:ident) => {
                unsafe { addr_of!($symbol) as u64 }
            };
        }

        let start = addr!(ld_trampoline_start);
        let end = addr!(ld_trampoline_end);
        let load = unsafe {
            core::slice::from_raw_parts(addr_of!(ld_trampoline_load), (end - start) as usize)
        };

        let symbols = TrampolineSymbols {
            fixup_target: addr!(trampoline_fixup_target),
            fixup_cs: addr!(trampoline_fixup_cs),
            fixup_ip: addr!(trampoline_fixup_ip),
            boot_page_tables_ptr: addr!(cpu_boot_page_tables_ptr),
            boot_page_tables_start: addr!(cpu_boot_page_tables_start),
            pdpt_addr: addr!(trampoline_pdpt_addr),
            gdt_ptr: addr!(trampoline_gdt_ptr),
            start64_fixup: addr!(trampoline_start64_fixup),
            main_entry: addr!(main_entry),
            secondary_cpu_stack: addr!(secondary_cpu_stack),
        };

        TrampolineImage::new(load, start, end, symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mm::{
            e820::{E820Map, E820Type},
            RamRegion,
        },
        utils::paging::_1MB,
    };
    use alloc::{vec, vec::Vec};

    const LINK_BASE: u64 = 0x4000_0000;
    const LOAD_BASE: u64 = 0x5000_0000;
    const IMAGE_SIZE: usize = 0x200;

    // Link offsets of the sites inside of the synthetic image.
    const FIXUP_TARGET: usize = 0x4b;
    const FIXUP_IP: usize = 0x09;
    const FIXUP_CS: usize = 0x0b;
    const BOOT_PAGE_TABLES_PTR: usize = 0x20;
    const BOOT_PAGE_TABLES_START: usize = 0x28;
    const GDT_PTR: usize = 0x80;
    const START64_FIXUP: usize = 0x90;
    const MAIN_ENTRY: usize = 0x98;
    const SECONDARY_CPU_STACK: usize = 0xa0;
    const PDPT: usize = 0x100;

    const HV_ENTRY_LINK: u64 = 0x4000_1000;

    fn relocation() -> Relocation {
        Relocation::new(LOAD_BASE, LINK_BASE)
    }

    fn put(image: &mut [u8], at: usize, bytes: &[u8]) {
        image[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn load_image() -> Vec<u8> {
        let mut image = vec![0x90u8; IMAGE_SIZE];

        // ljmp $cs, $ip
        image[0x08] = 0xea;
        put(&mut image, FIXUP_IP, &0u16.to_le_bytes());
        put(&mut image, FIXUP_CS, &0u16.to_le_bytes());

        put(&mut image, BOOT_PAGE_TABLES_PTR, &0x1000u32.to_le_bytes());
        put(&mut image, BOOT_PAGE_TABLES_START, &0x2003u64.to_le_bytes());
        put(&mut image, GDT_PTR, &0x17u16.to_le_bytes());
        put(&mut image, GDT_PTR + 2, &0x60u64.to_le_bytes());
        put(&mut image, START64_FIXUP, &0x180u32.to_le_bytes());
        put(&mut image, MAIN_ENTRY, &HV_ENTRY_LINK.to_le_bytes());
        put(&mut image, SECONDARY_CPU_STACK, &0u64.to_le_bytes());
        for i in 0..4u64 {
            put(&mut image, PDPT + 8 * i as usize, &(0x3083 + (i << 30)).to_le_bytes());
        }

        image
    }

    fn symbols() -> TrampolineSymbols {
        let runtime = |offset: usize| relocation().runtime_addr(offset as u64);

        TrampolineSymbols {
            fixup_target: runtime(FIXUP_TARGET),
            fixup_cs: runtime(FIXUP_CS),
            fixup_ip: runtime(FIXUP_IP),
            boot_page_tables_ptr: runtime(BOOT_PAGE_TABLES_PTR),
            boot_page_tables_start: runtime(BOOT_PAGE_TABLES_START),
            pdpt_addr: runtime(PDPT),
            gdt_ptr: runtime(GDT_PTR),
            start64_fixup: runtime(START64_FIXUP),
            main_entry: runtime(MAIN_ENTRY),
            secondary_cpu_stack: runtime(SECONDARY_CPU_STACK),
        }
    }

    fn image(load: &[u8]) -> TrampolineImage<'_> {
        TrampolineImage::new(
            load,
            relocation().runtime_addr(0),
            relocation().runtime_addr(IMAGE_SIZE as u64),
            symbols(),
        )
    }

    /// Conventional memory with the EBDA and the BIOS area reserved.
    fn low_memory(ram_end: u64) -> RamRegion {
        let mut e820 = E820Map::new();
        e820.add(0x1000, ram_end - 0x1000, E820Type::Ram);
        e820.add(ram_end, 0xf_0000 - ram_end, E820Type::Reserved);
        e820.add(0xf_0000, 0x1_0000, E820Type::Reserved);

        RamRegion::with_e820(PAddr::from(0u64), _1MB as usize, e820)
    }

    fn read(memory: &RamRegion, hpa: u64, width: Width) -> u64 {
        let bytes = memory.hpa_slice(PAddr::from(hpa), width.bytes()).unwrap();
        width.read(bytes, 0).unwrap()
    }

    #[test]
    fn test_prepare_patches_all_references() {
        let load = load_image();
        let mut memory = low_memory(0x9_fc00);

        let trampoline = Trampoline::prepare(&mut memory, &image(&load), relocation()).unwrap();
        let base = trampoline.base().as_u64();

        assert_eq!(base, 0x9_e000);
        assert_eq!(trampoline.size(), IMAGE_SIZE as u64);

        let at = |offset: usize| base + offset as u64;
        assert_eq!(read(&memory, at(0x08), Width::U16) & 0xff, 0xea);
        assert_eq!(read(&memory, at(BOOT_PAGE_TABLES_PTR), Width::U32), 0x1000 + base);
        assert_eq!(read(&memory, at(BOOT_PAGE_TABLES_START), Width::U64), 0x2003 + base);
        assert_eq!(read(&memory, at(GDT_PTR), Width::U16), 0x17);
        assert_eq!(read(&memory, at(GDT_PTR + 2), Width::U64), 0x60 + base);
        assert_eq!(read(&memory, at(START64_FIXUP), Width::U32), 0x180 + base);
        assert_eq!(
            read(&memory, at(MAIN_ENTRY), Width::U64),
            HV_ENTRY_LINK + (LOAD_BASE - LINK_BASE)
        );
        for i in 0..4u64 {
            assert_eq!(
                read(&memory, at(PDPT) + 8 * i, Width::U64),
                0x3083 + (i << 30) + base
            );
        }

        // Everything that is not a fixup is copied as is.
        let code = memory.hpa_slice(trampoline.base(), IMAGE_SIZE).unwrap();
        assert_eq!(&code[0x30..0x80], &load[0x30..0x80]);
        assert_eq!(&code[0x120..], &load[0x120..]);
    }

    #[test]
    fn test_real_mode_jump_decodes_to_fixup_target() {
        let load = load_image();

        for ram_end in [0x9_fc00, 0x8_0000, 0x2_3456] {
            let mut memory = low_memory(ram_end);
            let trampoline =
                Trampoline::prepare(&mut memory, &image(&load), relocation()).unwrap();
            let base = trampoline.base().as_u64();

            let cs = read(&memory, base + FIXUP_CS as u64, Width::U16);
            let ip = read(&memory, base + FIXUP_IP as u64, Width::U16);

            assert!(ip < 0x10);
            assert_eq!((cs << 4) + ip, base + FIXUP_TARGET as u64);
            assert_eq!(
                trampoline.offset_of(TrampolineSymbol::FixupTarget),
                FIXUP_TARGET as u64
            );
        }
    }

    #[test]
    fn test_trampoline_is_below_1mb() {
        let load = load_image();
        let mut memory = RamRegion::new(PAddr::from(0u64), _1MB as usize);

        let trampoline = Trampoline::prepare(&mut memory, &image(&load), relocation()).unwrap();
        assert!(trampoline.base().as_u64() + trampoline.size() <= MEM_1M);
    }

    #[test]
    fn test_allocation_failure() {
        let load = load_image();
        let mut e820 = E820Map::new();
        e820.add(0x1000, 0x1000, E820Type::Reserved);
        let mut memory = RamRegion::with_e820(PAddr::from(0u64), _1MB as usize, e820);

        let result = Trampoline::prepare(&mut memory, &image(&load), relocation());
        assert!(matches!(result, Err(TrampolineError::AllocationFailed { size: 0x200 })));
    }

    #[test]
    fn test_truncated_image() {
        let load = load_image();
        let mut memory = low_memory(0x9_fc00);

        let result = Trampoline::prepare(&mut memory, &image(&load[..0x100]), relocation());
        assert!(matches!(result, Err(TrampolineError::ImageTruncated { .. })));
    }

    #[test]
    fn test_swapped_image_markers() {
        let load = load_image();
        let mut memory = low_memory(0x9_fc00);
        let image = TrampolineImage::new(
            &load,
            relocation().runtime_addr(IMAGE_SIZE as u64),
            relocation().runtime_addr(0),
            symbols(),
        );

        assert_eq!(image.size(), None);
        let result = Trampoline::prepare(&mut memory, &image, relocation());
        assert!(matches!(result, Err(TrampolineError::InvalidImage { .. })));
        assert_eq!(memory.e820().free_ram(), 0x9_fc00 - 0x1000);
    }

    #[test]
    fn test_fixup_outside_of_image() {
        let load = load_image();
        let mut memory = low_memory(0x9_fc00);

        let mut symbols = symbols();
        symbols.main_entry = relocation().runtime_addr(IMAGE_SIZE as u64 - 4);
        let image = TrampolineImage::new(
            &load,
            relocation().runtime_addr(0),
            relocation().runtime_addr(IMAGE_SIZE as u64),
            symbols,
        );

        let result = Trampoline::prepare(&mut memory, &image, relocation());
        assert!(matches!(
            result,
            Err(TrampolineError::FixupOutOfBounds { name: "main_entry", .. })
        ));
    }

    #[test]
    fn test_symbol_access() {
        let load = load_image();
        let mut memory = low_memory(0x9_fc00);
        let trampoline = Trampoline::prepare(&mut memory, &image(&load), relocation()).unwrap();

        assert_eq!(
            trampoline.read_sym(&memory, TrampolineSymbol::MainEntry).unwrap(),
            HV_ENTRY_LINK + relocation().delta()
        );

        trampoline
            .write_sym(&mut memory, TrampolineSymbol::SecondaryCpuStack, 0xdead_beef)
            .unwrap();
        assert_eq!(
            trampoline
                .read_sym(&memory, TrampolineSymbol::SecondaryCpuStack)
                .unwrap(),
            0xdead_beef
        );
        assert_eq!(
            read(&memory, trampoline.base().as_u64() + SECONDARY_CPU_STACK as u64, Width::U64),
            0xdead_beef
        );
    }

    #[test]
    fn test_write_stack_sym() {
        let load = load_image();
        let mut memory = low_memory(0x9_fc00);
        let trampoline = Trampoline::prepare(&mut memory, &image(&load), relocation()).unwrap();
        let stacks = StackArea::new(0x4100_0000, 0x2000, 4);

        for pcpu_id in 1..4 {
            let first = trampoline
                .write_stack_sym(&mut memory, &stacks, pcpu_id)
                .unwrap();
            let second = trampoline
                .write_stack_sym(&mut memory, &stacks, pcpu_id)
                .unwrap();
            let region = stacks.stack_region(pcpu_id).unwrap();

            assert_eq!(first, second);
            assert_eq!(first % crate::config::CPU_STACK_ALIGN, 0);
            assert_eq!(first, (region.end - 1) & !(crate::config::CPU_STACK_ALIGN - 1));
            assert_eq!(
                trampoline
                    .read_sym(&memory, TrampolineSymbol::SecondaryCpuStack)
                    .unwrap(),
                first
            );
        }

        assert!(matches!(
            trampoline.write_stack_sym(&mut memory, &stacks, 4),
            Err(TrampolineError::NoSuchStack { pcpu_id: 4 })
        ));
    }

    #[test]
    fn test_boot_trampoline_is_prepared_once() {
        let load = load_image();
        let mut memory = low_memory(0x9_fc00);
        let stacks = StackArea::new(0x4100_0000, 0x2000, 2);

        assert!(matches!(
            read_trampoline_sym(&memory, TrampolineSymbol::MainEntry),
            Err(TrampolineError::NotPrepared)
        ));
        assert!(trampoline_start16_paddr().is_none());

        let base = prepare_trampoline(&mut memory, &image(&load), relocation()).unwrap();
        assert_eq!(trampoline_start16_paddr(), Some(base));

        let result = prepare_trampoline(&mut memory, &image(&load), relocation());
        assert!(matches!(result, Err(TrampolineError::AlreadyPrepared { .. })));
        assert_eq!(trampoline_start16_paddr(), Some(base));

        let top = write_trampoline_stack_sym(&mut memory, &stacks, 1).unwrap();
        assert_eq!(
            read_trampoline_sym(&memory, TrampolineSymbol::SecondaryCpuStack).unwrap(),
            top
        );

        write_trampoline_sym(&mut memory, TrampolineSymbol::SecondaryCpuStack, 0).unwrap();
        assert_eq!(
            read_trampoline_sym(&memory, TrampolineSymbol::SecondaryCpuStack).unwrap(),
            0
        );
    }
}
