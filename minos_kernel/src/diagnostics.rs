//! Log sinks: everything goes to the serial port, the important part also
//! to the screen.

use core::fmt::Write;

use log;

pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut com1 = crate::globals::COM1.lock();
            let lvl_char = level_prefix(record.level());
            writeln!(com1, "[{}] {}", lvl_char, record.args()).unwrap_or(());
        }
    }

    fn flush(&self) {}
}

pub struct VgaLogger;

impl log::Log for VgaLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut vga_out = crate::vga::writer();
            let lvl_char = level_prefix(record.level());
            writeln!(vga_out, "[{}] {}", lvl_char, record.args()).unwrap_or(());
        }
    }

    fn flush(&self) {}
}

pub struct FanOutLogger<A, B>(pub A, pub B);

impl<A: log::Log, B: log::Log> log::Log for FanOutLogger<A, B> {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.0.enabled(metadata) || self.1.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        self.0.log(record);
        self.1.log(record);
    }

    fn flush(&self) {
        self.0.flush();
        self.1.flush();
    }
}

static LOGGER: FanOutLogger<SerialLogger, VgaLogger> = FanOutLogger(SerialLogger, VgaLogger);

/// Install the fan-out logger. Harmless when called twice.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Debug))
        .unwrap_or(());
}

fn level_prefix(level: log::Level) -> char {
    match level {
        log::Level::Trace => 'T',
        log::Level::Debug => 'D',
        log::Level::Info => 'I',
        log::Level::Warn => 'W',
        log::Level::Error => 'E',
    }
}
