use bitfield::bitfield;
use core::fmt;

bitfield! {
    /// Bus/device/function triple packed the way it is used for
    /// configuration mechanism #1 and in routing tables.
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PciBdf(u16);
    pub u8, bus, set_bus: 15, 8;  // [8-15]
    pub u8, dev, set_dev: 7, 3;   // [3-7]
    pub u8, func, set_func: 2, 0; // [0-2]
}

impl PciBdf {
    pub fn new(bus: u8, dev: u8, func: u8) -> Self {
        let mut bdf = PciBdf(0);
        bdf.set_bus(bus);
        bdf.set_dev(dev);
        bdf.set_func(func);

        bdf
    }

    pub const fn from_value(value: u16) -> Self {
        PciBdf(value)
    }

    pub const fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus(), self.dev(), self.func())
    }
}

impl fmt::Debug for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PciBdf({})", self)
    }
}
