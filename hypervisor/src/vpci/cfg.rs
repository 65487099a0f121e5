//! Backing store of a virtual device's configuration space.

use crate::config::PCI_CFG_SPACE_SIZE;
use alloc::{boxed::Box, vec};

/// Value returned for reads that are not backed by the buffer, as if no
/// register was decoded.
const UNDECODED: u32 = 0xffff_ffff;

/// The configuration space of a virtual device as a flat little-endian
/// buffer.
///
/// Accesses are 1, 2 or 4 bytes wide (anything else is treated as 4). Word
/// accesses are aligned down to 2 bytes and dword accesses to 4 bytes.
pub struct PciCfgSpace {
    data: Box<[u8]>,
}

impl PciCfgSpace {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; PCI_CFG_SPACE_SIZE].into_boxed_slice(),
        }
    }

    fn window(offset: usize, bytes: usize) -> (usize, usize) {
        match bytes {
            1 => (offset, 1),
            2 => (offset & !1, 2),
            _ => (offset & !3, 4),
        }
    }

    pub fn read(&self, offset: usize, bytes: usize) -> u32 {
        let (at, len) = Self::window(offset, bytes);

        match at.checked_add(len).and_then(|end| self.data.get(at..end)) {
            Some(register) => register
                .iter()
                .rev()
                .fold(0, |value, &byte| (value << 8) | u32::from(byte)),
            None => {
                log::warn!("cfg read of {} bytes at {:#x} is out of range", len, offset);
                UNDECODED
            }
        }
    }

    pub fn write(&mut self, offset: usize, bytes: usize, value: u32) {
        let (at, len) = Self::window(offset, bytes);

        match at.checked_add(len).and_then(|end| self.data.get_mut(at..end)) {
            Some(register) => register.copy_from_slice(&value.to_le_bytes()[..len]),
            None => log::warn!("cfg write of {} bytes at {:#x} is out of range", len, offset),
        }
    }
}
