use crate::{
    vm::vcpu::Vcpu,
    vpci::{bar::BarUpdate, bdf::PciBdf, MmioResources, Vpci, VpciError},
};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;

pub mod events;
pub mod vcpu;

/// Value read from the configuration space of a function that doesn't
/// exist.
pub const PCI_CFG_ABSENT: u32 = 0xffff_ffff;

pub struct Vm {
    vm_id: u16,
    /// The vcpus of this VM, indexed by the physical cpu they run on.
    vcpus: HashMap<u16, Vcpu, FnvBuildHasher>,
    vpci: Vpci,
}

impl Vm {
    pub fn new(vm_id: u16, res: MmioResources) -> Self {
        Self {
            vm_id,
            vcpus: HashMap::with_hasher(FnvBuildHasher::default()),
            vpci: Vpci::new(res),
        }
    }

    pub fn vm_id(&self) -> u16 {
        self.vm_id
    }

    /// Adds a vcpu. Returns the vcpu that was previously running on the same
    /// physical cpu.
    pub fn add_vcpu(&mut self, vcpu: Vcpu) -> Option<Vcpu> {
        log::trace!("vm {}: vcpu {} on pcpu {}", self.vm_id, vcpu.vcpu_id(), vcpu.pcpu_id());
        self.vcpus.insert(vcpu.pcpu_id(), vcpu)
    }

    /// The vcpu of this VM running on `pcpu_id`.
    pub fn vcpu_from_pid(&mut self, pcpu_id: u16) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(&pcpu_id)
    }

    pub fn vpci(&self) -> &Vpci {
        &self.vpci
    }

    pub fn vpci_mut(&mut self) -> &mut Vpci {
        &mut self.vpci
    }

    /// Handles a guest write to a BAR, issued on `pcpu_id`.
    pub fn write_vbar(
        &mut self, bdf: PciBdf, idx: usize, value: u32, pcpu_id: u16,
    ) -> Result<BarUpdate, VpciError> {
        let vcpu = self.vcpus.get_mut(&pcpu_id);
        self.vpci.write_vbar(bdf, idx, value, vcpu)
    }

    pub fn pci_cfg_read(&self, bdf: PciBdf, offset: usize, bytes: usize) -> u32 {
        self.vpci
            .read_cfg(bdf, offset, bytes)
            .unwrap_or(PCI_CFG_ABSENT)
    }

    pub fn pci_cfg_write(
        &mut self, bdf: PciBdf, offset: usize, bytes: usize, value: u32, pcpu_id: u16,
    ) -> Result<(), VpciError> {
        let vcpu = self.vcpus.get_mut(&pcpu_id);
        self.vpci.write_cfg(bdf, offset, bytes, value, vcpu)
    }
}
