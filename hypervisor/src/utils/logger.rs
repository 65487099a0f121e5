use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Base port of the first legacy serial controller.
pub const COM1: u16 = 0x3f8;

/// Line status register offset and its "transmitter holding register empty"
/// bit.
const LSR: u16 = 5;
const LSR_THRE: u8 = 1 << 5;

/// Polled 8250/16550 serial port.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    fn write_byte(&mut self, byte: u8) {
        unsafe {
            while x86::io::inb(self.base + LSR) & LSR_THRE == 0 {
                core::hint::spin_loop();
            }
            x86::io::outb(self.base, byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }

        Ok(())
    }
}

/// Logger writing one `LEVEL - message` line per record into `W`.
pub struct HvLogger<W: Write + Send> {
    sink: Mutex<W>,
}

impl<W: Write + Send> HvLogger<W> {
    pub const fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner()
    }
}

impl<W: Write + Send> Log for HvLogger<W> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(self.sink.lock(), "{} - {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: HvLogger<SerialPort> = HvLogger::new(SerialPort::new(COM1));

/// Installs the serial logger. Only the first call has an effect.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}
