use crate::{
    config::PCI_BAR_COUNT,
    vpci::{
        bar::{pci_bar_offset, BarKind, PciVbar, IO_MASK},
        bdf::PciBdf,
        cfg::PciCfgSpace,
    },
};
use tinyvec::ArrayVec;

/// A physical PCI function owned by the host.
#[derive(Debug, Clone)]
pub struct PciPdev {
    pub bdf: PciBdf,
    /// The BARs as the host programmed them (`base_hpa`).
    pub bars: ArrayVec<[PciVbar; PCI_BAR_COUNT]>,
}

impl PciPdev {
    /// BARs beyond the sixth are ignored.
    pub fn new(bdf: PciBdf, bars: &[PciVbar]) -> Self {
        Self {
            bdf,
            bars: bars.iter().take(PCI_BAR_COUNT).copied().collect(),
        }
    }
}

/// A PCI function as the guest sees it.
pub struct PciVdev {
    bdf: PciBdf,
    cfg: PciCfgSpace,
    vbars: [PciVbar; PCI_BAR_COUNT],
    pdev: Option<PciPdev>,
}

impl PciVdev {
    /// Creates an emulated function. All BARs start unmapped with only their
    /// attribute bits set, missing BARs are reserved.
    pub fn new(bdf: PciBdf, bars: &[PciVbar]) -> Self {
        let mut vbars = [PciVbar::default(); PCI_BAR_COUNT];
        for (vbar, bar) in vbars.iter_mut().zip(bars) {
            *vbar = PciVbar { base_gpa: 0, ..*bar };
        }

        let mut cfg = PciCfgSpace::new();
        for (idx, vbar) in vbars.iter().enumerate() {
            cfg.write(pci_bar_offset(idx), 4, vbar.type_bits);
        }

        Self {
            bdf,
            cfg,
            vbars,
            pdev: None,
        }
    }

    /// Creates the guest view of a passthrough function. I/O BARs are
    /// identity mapped to the host ports right away, memory BARs are left to
    /// the guest.
    pub fn passthrough(pdev: PciPdev) -> Self {
        let mut vdev = Self::new(pdev.bdf, &pdev.bars);

        for idx in 0..PCI_BAR_COUNT {
            let vbar = &mut vdev.vbars[idx];
            if vbar.kind != BarKind::Io {
                continue;
            }

            let bar = (vbar.base_hpa as u32 & vbar.mask) | (vbar.type_bits & !IO_MASK);
            vbar.base_gpa = vbar.base_hpa;
            vdev.cfg.write(pci_bar_offset(idx), 4, bar);
        }

        log::debug!("{}: passthrough vdev created", vdev.bdf);
        vdev.pdev = Some(pdev);

        vdev
    }

    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn pdev(&self) -> Option<&PciPdev> {
        self.pdev.as_ref()
    }

    pub fn is_passthrough(&self) -> bool {
        self.pdev.is_some()
    }

    pub fn vbars(&self) -> &[PciVbar] {
        &self.vbars
    }

    pub fn vbar(&self, idx: usize) -> Option<&PciVbar> {
        self.vbars.get(idx)
    }

    pub(crate) fn vbar_mut(&mut self, idx: usize) -> Option<&mut PciVbar> {
        self.vbars.get_mut(idx)
    }

    pub(crate) fn cfg(&self) -> &PciCfgSpace {
        &self.cfg
    }

    pub(crate) fn cfg_mut(&mut self) -> &mut PciCfgSpace {
        &mut self.cfg
    }

    /// Reads the configuration space without any side effects.
    pub fn read_vcfg(&self, offset: usize, bytes: usize) -> u32 {
        self.cfg.read(offset, bytes)
    }

    /// Writes the configuration space without any side effects. BARs have to
    /// be programmed with [`PciVdev::write_vbar`].
    pub fn write_vcfg(&mut self, offset: usize, bytes: usize, value: u32) {
        self.cfg.write(offset, bytes, value)
    }
}
