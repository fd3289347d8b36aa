//! Kernel logging facility
//!
//! Routes the `log` crate's macros to the serial port. Debug builds log at
//! `Debug`, release builds at `Info`.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// The logger [`init`] installs.
pub static LOGGER: Logger = Logger::new();

/// Serializes whole lines so messages from interrupt handlers do not
/// interleave with the line being printed.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// A logger with nothing printed yet.
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    /// Anything at or below the global maximum level.
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message".
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // Handlers log too; the line being printed must not be
            // interrupted while the lock is held.
            #[cfg(all(target_arch = "x86", target_os = "none"))]
            let _irq = crate::sync::InterruptGuard::new(&crate::hal::x86::X86Hardware);
            let _guard = self.inner.lock();
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    /// Lines are written out whole, nothing is buffered.
    fn flush(&self) {}
}

/// Level installed by [`init`]: `Debug` with debug assertions, `Info`
/// otherwise.
pub fn max_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Installs [`LOGGER`]. Returns `false` if another logger got there first,
/// in which case that one stays in charge.
pub fn init() -> bool {
    match log::set_logger(&LOGGER) {
        Ok(()) => {
            log::set_max_level(max_level());
            true
        }
        Err(_) => false,
    }
}
