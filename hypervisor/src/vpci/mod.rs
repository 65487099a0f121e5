//! Virtual PCI root of a VM.
//!
//! The root owns the virtual devices of a VM in a small hash index keyed by
//! their bdf, and the MMIO windows guest memory BARs have to be placed in.

use crate::{
    config::{MAX_PCI_DEV_NUM, VDEV_LIST_HASHBITS},
    utils::paging::_4GB,
    vm::vcpu::Vcpu,
    vpci::{
        bar::{pci_bar_index, BarUpdate},
        bdf::PciBdf,
        vdev::PciVdev,
    },
};
use alloc::vec::Vec;
use core::hash::Hasher;
use fnv::FnvHasher;
use snafu::prelude::*;

pub mod bar;
pub mod bdf;
pub mod cfg;
pub mod vdev;

const EIO: i32 = 5;
const ENODEV: i32 = 19;
const EEXIST: i32 = 17;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum VpciError {
    #[snafu(display("{}: PIO BAR{} is not identity mapped (hpa {:#x}, gpa {:#x})", bdf, idx, hpa, gpa))]
    PioBarNotIdentity { bdf: PciBdf, idx: usize, hpa: u64, gpa: u64 },

    #[snafu(display("{}: BAR{} does not exist", bdf, idx))]
    InvalidBar { bdf: PciBdf, idx: usize },

    #[snafu(display("{}: no such device", bdf))]
    NoSuchDevice { bdf: PciBdf },

    #[snafu(display("{}: device is already attached", bdf))]
    AlreadyAttached { bdf: PciBdf },

    #[snafu(display("Can't attach more than {} devices", max))]
    TooManyDevices { max: usize },
}

impl VpciError {
    /// The negative errno reported to the device model.
    pub fn errno(&self) -> i32 {
        match self {
            VpciError::PioBarNotIdentity { .. } => -EIO,
            VpciError::InvalidBar { .. } => -EINVAL,
            VpciError::NoSuchDevice { .. } => -ENODEV,
            VpciError::AlreadyAttached { .. } => -EEXIST,
            VpciError::TooManyDevices { .. } => -ENOSPC,
        }
    }
}

/// A range of guest physical addresses. `end` is inclusive.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MmioWindow {
    pub start: u64,
    pub end: u64,
}

impl MmioWindow {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, address: u64) -> bool {
        self.start <= address && address <= self.end
    }
}

/// The MMIO windows below and above 4 GiB.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MmioResources {
    pub res32: MmioWindow,
    pub res64: MmioWindow,
}

impl MmioResources {
    pub fn window_for(&self, base: u64) -> &MmioWindow {
        if base < _4GB {
            &self.res32
        } else {
            &self.res64
        }
    }

    pub fn is_mem_bar_base_valid(&self, base: u64) -> bool {
        self.window_for(base).contains(base)
    }
}

const VDEV_BUCKETS: usize = 1 << VDEV_LIST_HASHBITS;

pub(crate) fn bucket_index(bdf: PciBdf) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write_u16(bdf.value());

    hasher.finish() as usize & (VDEV_BUCKETS - 1)
}

pub struct Vpci {
    res: MmioResources,
    buckets: [Vec<PciVdev>; VDEV_BUCKETS],
    count: usize,
}

impl Vpci {
    pub fn new(res: MmioResources) -> Self {
        Self {
            res,
            buckets: core::array::from_fn(|_| Vec::new()),
            count: 0,
        }
    }

    pub fn resources(&self) -> &MmioResources {
        &self.res
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn attach(&mut self, vdev: PciVdev) -> Result<(), VpciError> {
        let bdf = vdev.bdf();

        ensure!(self.find(bdf).is_none(), AlreadyAttachedSnafu { bdf });
        ensure!(
            self.count < MAX_PCI_DEV_NUM,
            TooManyDevicesSnafu {
                max: MAX_PCI_DEV_NUM
            }
        );

        log::debug!("vpci: attaching {}", bdf);
        self.buckets[bucket_index(bdf)].push(vdev);
        self.count += 1;

        Ok(())
    }

    pub fn detach(&mut self, bdf: PciBdf) -> Option<PciVdev> {
        let bucket = &mut self.buckets[bucket_index(bdf)];
        let position = bucket.iter().position(|vdev| vdev.bdf() == bdf)?;

        log::debug!("vpci: detaching {}", bdf);
        self.count -= 1;

        Some(bucket.remove(position))
    }

    pub fn find(&self, bdf: PciBdf) -> Option<&PciVdev> {
        self.buckets[bucket_index(bdf)]
            .iter()
            .find(|vdev| vdev.bdf() == bdf)
    }

    pub fn find_mut(&mut self, bdf: PciBdf) -> Option<&mut PciVdev> {
        self.buckets[bucket_index(bdf)]
            .iter_mut()
            .find(|vdev| vdev.bdf() == bdf)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PciVdev> {
        self.buckets.iter().flatten()
    }

    /// Programs BAR `idx` of the device at `bdf`.
    pub fn write_vbar(
        &mut self, bdf: PciBdf, idx: usize, value: u32, vcpu: Option<&mut Vcpu>,
    ) -> Result<BarUpdate, VpciError> {
        let vdev = self.buckets[bucket_index(bdf)]
            .iter_mut()
            .find(|vdev| vdev.bdf() == bdf)
            .context(NoSuchDeviceSnafu { bdf })?;

        vdev.write_vbar(idx, value, &self.res, vcpu)
    }

    /// Guest configuration read. `None` if there is no device at `bdf`.
    pub fn read_cfg(&self, bdf: PciBdf, offset: usize, bytes: usize) -> Option<u32> {
        self.find(bdf).map(|vdev| vdev.read_vcfg(offset, bytes))
    }

    /// Guest configuration write.
    ///
    /// Dword writes to a BAR register program the BAR. Narrower writes to a
    /// BAR register are dropped.
    pub fn write_cfg(
        &mut self, bdf: PciBdf, offset: usize, bytes: usize, value: u32, vcpu: Option<&mut Vcpu>,
    ) -> Result<(), VpciError> {
        ensure!(self.find(bdf).is_some(), NoSuchDeviceSnafu { bdf });

        match pci_bar_index(offset) {
            Some(idx) if bytes == 4 && offset % 4 == 0 => {
                self.write_vbar(bdf, idx, value, vcpu).map(|_| ())
            }
            Some(idx) => {
                log::trace!("{}: dropping {} byte write to BAR{}", bdf, bytes, idx);
                Ok(())
            }
            None => {
                self.find_mut(bdf)
                    .context(NoSuchDeviceSnafu { bdf })?
                    .write_vcfg(offset, bytes, value);
                Ok(())
            }
        }
    }
}
