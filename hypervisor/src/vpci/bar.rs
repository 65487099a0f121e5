//! Guest programming of the Base Address Registers of a virtual device.
//!
//! ## BAR sizing
//!
//! To size a BAR, software writes all ones and reads back the register. Only
//! the address bits the device decodes stick, together with the read-only
//! attribute bits. That readback value (`mask | type_bits`) is the sizing
//! sentinel, and a BAR holding it is not mapped anywhere.
//!
//! ## Validation
//!
//! - An I/O BAR of a passthrough device has to keep the host's port range.
//!   Any other value is refused with a #GP and leaves the BAR unmapped.
//! - A memory BAR has to be inside of the MMIO window of the vPCI root and
//!   aligned to its size. Violations are only reported, the base is still
//!   used.

use crate::{
    config::PCI_BAR_COUNT,
    utils::paging::mem_aligned_check,
    vm::vcpu::Vcpu,
    vpci::{
        vdev::PciVdev, InvalidBarSnafu, MmioResources, PioBarNotIdentitySnafu, VpciError,
    },
};
use bitflags::bitflags;
use snafu::prelude::*;

/// Address bits of an I/O BAR.
pub const IO_MASK: u32 = !0x3;

/// Address bits of a memory BAR.
pub const MEM_MASK: u32 = !0xf;

/// Port numbers are 16 bits wide.
const IO_PORT_MASK: u64 = 0xffff;

pub const PCI_BASE_ADDRESS_0: usize = 0x10;

pub const fn pci_bar_offset(idx: usize) -> usize {
    PCI_BASE_ADDRESS_0 + 4 * idx
}

/// BAR index of a configuration space offset, if it is one of the BAR
/// registers.
pub const fn pci_bar_index(offset: usize) -> Option<usize> {
    if offset >= PCI_BASE_ADDRESS_0 && offset < pci_bar_offset(PCI_BAR_COUNT) {
        Some((offset - PCI_BASE_ADDRESS_0) / 4)
    } else {
        None
    }
}

bitflags! {
    /// Read-only attribute bits in the low bits of a BAR.
    pub struct BarFlags: u32 {
        const IO_SPACE = 1 << 0;
        const MEM_TYPE_64 = 1 << 2;
        const PREFETCH = 1 << 3;
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum BarKind {
    /// Not implemented by the device.
    #[default]
    Reserved,
    Io,
    Mem32,
    /// Low half of a 64-bit memory BAR.
    Mem64Lo,
    /// High half of a 64-bit memory BAR. Only holds address bits.
    Mem64Hi,
}

/// The state of a single BAR register.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PciVbar {
    pub kind: BarKind,
    /// Size of the decoded range, a power of two.
    pub size: u64,
    /// Address bits of this register the guest can program.
    pub mask: u32,
    /// Attribute bits the guest can't change.
    pub type_bits: u32,
    /// Base currently programmed by the guest, 0 when unmapped.
    pub base_gpa: u64,
    /// Base on the host, for passthrough devices.
    pub base_hpa: u64,
}

impl PciVbar {
    /// An I/O BAR decoding `size` ports.
    pub fn io(size: u64, base_hpa: u64) -> Self {
        Self {
            kind: BarKind::Io,
            size,
            mask: !(size as u32).wrapping_sub(1) & IO_MASK,
            type_bits: BarFlags::IO_SPACE.bits(),
            base_gpa: 0,
            base_hpa,
        }
    }

    pub fn mem32(size: u64, base_hpa: u64, prefetchable: bool) -> Self {
        let mut flags = BarFlags::empty();
        flags.set(BarFlags::PREFETCH, prefetchable);

        Self {
            kind: BarKind::Mem32,
            size,
            mask: !(size as u32).wrapping_sub(1) & MEM_MASK,
            type_bits: flags.bits(),
            base_gpa: 0,
            base_hpa,
        }
    }

    /// The two registers of a 64-bit memory BAR, low half first.
    pub fn mem64(size: u64, base_hpa: u64, prefetchable: bool) -> [Self; 2] {
        let mut flags = BarFlags::MEM_TYPE_64;
        flags.set(BarFlags::PREFETCH, prefetchable);

        let address_mask = !size.wrapping_sub(1);
        let lo = Self {
            kind: BarKind::Mem64Lo,
            size,
            mask: address_mask as u32 & MEM_MASK,
            type_bits: flags.bits(),
            base_gpa: 0,
            base_hpa,
        };
        let hi = Self {
            kind: BarKind::Mem64Hi,
            mask: (address_mask >> 32) as u32,
            type_bits: 0,
            ..lo
        };

        [lo, hi]
    }

    /// The value of the register while it is being sized.
    pub const fn sentinel(&self) -> u32 {
        self.mask | self.type_bits
    }

    pub fn is_io(&self) -> bool {
        self.kind == BarKind::Io
    }

    pub fn is_mem(&self) -> bool {
        matches!(self.kind, BarKind::Mem32 | BarKind::Mem64Lo)
    }
}

/// What a BAR write did to the guest mapping of the BAR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BarUpdate {
    /// BAR is unmapped (sizing or partially programmed 64-bit BAR).
    Unmapped,
    Mapped(u64),
    /// A passthrough I/O BAR was moved away from the host ports. The BAR is
    /// unmapped and a #GP is pending.
    PioRejected,
    /// The base is outside of the MMIO window or misaligned, but it was
    /// taken anyway.
    OutOfWindow(u64),
}

impl PciVdev {
    /// Emulates a guest write of `value` to BAR `idx`.
    ///
    /// `vcpu` is the processor that performed the write. It receives the #GP
    /// if a passthrough I/O BAR is reprogrammed.
    pub fn write_vbar(
        &mut self, idx: usize, value: u32, res: &MmioResources, vcpu: Option<&mut Vcpu>,
    ) -> Result<BarUpdate, VpciError> {
        let bdf = self.bdf();
        let vbar = *self.vbar(idx).context(InvalidBarSnafu { bdf, idx })?;

        let mut bar = value & vbar.mask;
        let base_idx = match vbar.kind {
            BarKind::Mem64Hi => idx.checked_sub(1).context(InvalidBarSnafu { bdf, idx })?,
            BarKind::Io => {
                bar |= vbar.type_bits & !IO_MASK;
                idx
            }
            _ => {
                bar |= vbar.type_bits & !MEM_MASK;
                idx
            }
        };

        self.cfg_mut().write(pci_bar_offset(idx), 4, bar);

        Ok(self.update_vbar_base(base_idx, res, vcpu))
    }

    /// Recomputes the guest base of BAR `idx` from the configuration space.
    pub fn update_vbar_base(
        &mut self, idx: usize, res: &MmioResources, vcpu: Option<&mut Vcpu>,
    ) -> BarUpdate {
        let vbar = match self.vbar(idx) {
            Some(vbar) => *vbar,
            None => return BarUpdate::Unmapped,
        };

        let lo = self.cfg().read(pci_bar_offset(idx), 4);
        let mut base = 0u64;

        if vbar.kind != BarKind::Reserved && lo != vbar.sentinel() {
            base = u64::from(lo & vbar.mask);

            if vbar.kind == BarKind::Mem64Lo {
                let hi = self.cfg().read(pci_bar_offset(idx + 1), 4);

                match self.vbar(idx + 1) {
                    Some(vbar_hi) if hi != vbar_hi.mask => base |= u64::from(hi) << 32,
                    _ => base = 0,
                }
            }

            if vbar.is_io() {
                base &= IO_PORT_MASK;
            }
        }

        let mut update = if base == 0 {
            BarUpdate::Unmapped
        } else {
            BarUpdate::Mapped(base)
        };

        if base != 0 {
            if vbar.is_io() && self.is_passthrough() {
                if u64::from(lo & IO_MASK) != vbar.base_hpa {
                    log::error!(
                        "{}: PIO BAR{} ({:#x}) can't be reprogrammed away from {:#x}",
                        self.bdf(),
                        idx,
                        lo & IO_MASK,
                        vbar.base_hpa
                    );
                    if let Some(vcpu) = vcpu {
                        vcpu.inject_gp(0);
                    }

                    base = 0;
                    update = BarUpdate::PioRejected;
                }
            } else if vbar.is_mem() {
                if !res.is_mem_bar_base_valid(base) {
                    log::error!(
                        "{}: programming MMIO BAR{} base {:#x} outside of the MMIO window",
                        self.bdf(),
                        idx,
                        base
                    );
                    update = BarUpdate::OutOfWindow(base);
                }

                if !mem_aligned_check(base, vbar.size) {
                    log::error!(
                        "{}: MMIO BAR{} base {:#x} isn't aligned to its size {:#x}",
                        self.bdf(),
                        idx,
                        base,
                        vbar.size
                    );
                    update = BarUpdate::OutOfWindow(base);
                }
            }
        }

        if let Some(vbar) = self.vbar_mut(idx) {
            vbar.base_gpa = base;
        }

        update
    }

    /// Checks that every I/O BAR of a passthrough device is identity mapped.
    pub fn check_pt_dev_pio_bars(&self) -> Result<(), VpciError> {
        if !self.is_passthrough() {
            return Ok(());
        }

        for (idx, vbar) in self.vbars().iter().enumerate() {
            if vbar.is_io() && vbar.base_gpa != vbar.base_hpa {
                log::error!(
                    "{}: PIO BAR{} isn't identity mapped (gpa {:#x}, hpa {:#x})",
                    self.bdf(),
                    idx,
                    vbar.base_gpa,
                    vbar.base_hpa
                );

                return PioBarNotIdentitySnafu {
                    bdf: self.bdf(),
                    idx,
                    hpa: vbar.base_hpa,
                    gpa: vbar.base_gpa,
                }
                .fail();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpci::{bdf::PciBdf, vdev::PciPdev, MmioWindow};

    const BDF: PciBdf = PciBdf::from_value(0x0010);

    fn resources() -> MmioResources {
        MmioResources {
            res32: MmioWindow::new(0xe000_0000, 0xefff_ffff),
            res64: MmioWindow::new(0x40_0000_0000, 0x7f_ffff_ffff),
        }
    }

    fn passthrough() -> PciVdev {
        let [lo, hi] = PciVbar::mem64(0x10_0000, 0x4_0000_0000, true);
        let bars = [
            PciVbar::mem32(0x1000, 0xfe00_0000, false),
            PciVbar::io(0x20, 0xc000),
            lo,
            hi,
        ];

        PciVdev::passthrough(PciPdev::new(BDF, &bars))
    }

    #[test]
    fn test_masks() {
        let io = PciVbar::io(0x20, 0);
        assert_eq!(io.mask, 0xffff_ffe0);
        assert_eq!(io.sentinel(), 0xffff_ffe1);

        let mem = PciVbar::mem32(0x1000, 0, true);
        assert_eq!(mem.sentinel(), 0xffff_f008);

        let [lo, hi] = PciVbar::mem64(0x2_0000_0000, 0, false);
        assert_eq!((lo.mask, lo.type_bits), (0, 0x4));
        assert_eq!(hi.mask, 0xffff_fffe);

        assert_eq!(pci_bar_index(0x18), Some(2));
        assert_eq!(pci_bar_index(0x28), None);
    }

    #[test]
    fn test_pio_bar_identity() {
        let mut vdev = passthrough();
        let mut vcpu = Vcpu::new(0, 0);

        assert_eq!(vdev.vbar(1).unwrap().base_gpa, 0xc000);
        assert!(vdev.check_pt_dev_pio_bars().is_ok());

        // Moving the ports is refused.
        let update = vdev.write_vbar(1, 0xd000, &resources(), Some(&mut vcpu));
        assert_eq!(update.unwrap(), BarUpdate::PioRejected);
        assert_eq!(vdev.vbar(1).unwrap().base_gpa, 0);
        assert!(vcpu.take_pending_event().is_some());

        let error = vdev.check_pt_dev_pio_bars().unwrap_err();
        assert!(matches!(error, VpciError::PioBarNotIdentity { idx: 1, .. }));
        assert_eq!(error.errno(), -5);

        // Writing the host ports back restores the mapping.
        let update = vdev.write_vbar(1, 0xc000, &resources(), Some(&mut vcpu));
        assert_eq!(update.unwrap(), BarUpdate::Mapped(0xc000));
        assert_eq!(vdev.vbar(1).unwrap().base_gpa, 0xc000);
        assert_eq!(vdev.read_vcfg(pci_bar_offset(1), 4), 0xc001);
        assert!(vcpu.take_pending_event().is_none());
        assert!(vdev.check_pt_dev_pio_bars().is_ok());
    }

    #[test]
    fn test_pio_bar_upper_bits_are_rejected() {
        let mut vdev = passthrough();

        let update = vdev.write_vbar(1, 0x1_c000, &resources(), None);
        assert_eq!(update.unwrap(), BarUpdate::PioRejected);
        assert_eq!(vdev.vbar(1).unwrap().base_gpa, 0);
    }

    #[test]
    fn test_sizing_unmaps_bar() {
        let mut vdev = passthrough();
        let mut vcpu = Vcpu::new(0, 0);

        for idx in 0..3 {
            let update = vdev.write_vbar(idx, !0, &resources(), Some(&mut vcpu));
            assert_eq!(update.unwrap(), BarUpdate::Unmapped);
            assert_eq!(vdev.vbar(idx).unwrap().base_gpa, 0);
            assert_eq!(vdev.read_vcfg(pci_bar_offset(idx), 4), vdev.vbar(idx).unwrap().sentinel());
        }

        assert_eq!(vdev.read_vcfg(pci_bar_offset(0), 4), 0xffff_f000);
        assert!(vcpu.pending_event().is_none());
    }

    #[test]
    fn test_mem32_bar() {
        let mut vdev = passthrough();

        let update = vdev.write_vbar(0, 0xe000_1000, &resources(), None);
        assert_eq!(update.unwrap(), BarUpdate::Mapped(0xe000_1000));
        assert_eq!(vdev.vbar(0).unwrap().base_gpa, 0xe000_1000);

        // The base is used even though it is outside of the window.
        let update = vdev.write_vbar(0, 0xd000_0000, &resources(), None);
        assert_eq!(update.unwrap(), BarUpdate::OutOfWindow(0xd000_0000));
        assert_eq!(vdev.vbar(0).unwrap().base_gpa, 0xd000_0000);

        // Window end is inclusive.
        let window = resources().res32;
        assert!(window.contains(0xefff_ffff));
        assert!(!window.contains(0xf000_0000));
    }

    #[test]
    fn test_misaligned_mem_bar() {
        let bar = PciVbar {
            kind: BarKind::Mem32,
            size: 0x1_0000,
            mask: 0xffff_f000,
            ..PciVbar::default()
        };
        let mut vdev = PciVdev::new(BDF, &[bar]);

        let update = vdev.write_vbar(0, 0xe000_8000, &resources(), None);
        assert_eq!(update.unwrap(), BarUpdate::OutOfWindow(0xe000_8000));
        assert_eq!(vdev.vbar(0).unwrap().base_gpa, 0xe000_8000);
    }

    #[test]
    fn test_mem64_bar() {
        let mut vdev = passthrough();

        // Low half first, while the high half is still sized.
        vdev.write_vbar(3, !0, &resources(), None).unwrap();
        let update = vdev.write_vbar(2, 0x0010_0000, &resources(), None);
        assert_eq!(update.unwrap(), BarUpdate::Unmapped);
        assert_eq!(vdev.read_vcfg(pci_bar_offset(2), 4), 0x0010_000c);

        let update = vdev.write_vbar(3, 0x40, &resources(), None);
        assert_eq!(update.unwrap(), BarUpdate::Mapped(0x40_0010_0000));
        assert_eq!(vdev.vbar(2).unwrap().base_gpa, 0x40_0010_0000);
        assert_eq!(vdev.read_vcfg(pci_bar_offset(3), 4), 0x40);

        // Below 4G the 32-bit window is used.
        let update = vdev.write_vbar(3, 0, &resources(), None);
        assert_eq!(update.unwrap(), BarUpdate::OutOfWindow(0x0010_0000));
    }

    #[test]
    fn test_invalid_index() {
        let mut vdev = passthrough();

        let error = vdev
            .write_vbar(PCI_BAR_COUNT, 0, &resources(), None)
            .unwrap_err();
        assert!(matches!(error, VpciError::InvalidBar { idx: PCI_BAR_COUNT, .. }));
        assert_eq!(error.errno(), -22);
    }

    #[test]
    fn test_emulated_io_bar_is_not_checked() {
        let mut vdev = PciVdev::new(BDF, &[PciVbar::io(0x10, 0)]);
        let mut vcpu = Vcpu::new(0, 0);

        let update = vdev.write_vbar(0, 0x1_e010, &resources(), Some(&mut vcpu));
        assert_eq!(update.unwrap(), BarUpdate::Mapped(0xe010));
        assert!(vcpu.pending_event().is_none());
        assert!(vdev.check_pt_dev_pio_bars().is_ok());
    }
}
