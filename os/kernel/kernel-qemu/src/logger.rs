use crate::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log::Log` implementation over the QEMU debug port.
///
/// Level filtering happens through `log::set_max_level`, so the logger
/// itself is a zero-sized static and installation needs no allocation.
pub struct QemuLogger;

static LOGGER: QemuLogger = QemuLogger;

impl QemuLogger {
    /// Install the logger and set the maximum level. Call once during
    /// early init, before the memory subsystems start reporting.
    ///
    /// # Errors
    /// [`SetLoggerError`] when another logger is already installed.
    pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // "[LEVEL] target: message", one line per record.
        qemu_trace!("[{}] {}: {}\n", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        // Nothing buffered.
    }
}
