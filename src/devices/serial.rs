//! Serial port interface for UART 16550 communication.
//!
//! On bare metal text goes to COM1; host builds print to stdout so the
//! same log lines show up under `cargo test -- --nocapture`.

#[cfg(target_os = "none")]
mod uart {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    use crate::constants::ports::SERIAL_PORT;

    lazy_static! {
        /// The first serial port (COM1), initialized on first access.
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }
}

#[cfg(target_os = "none")]
pub use uart::SERIAL1;

/// Writes to COM1 with interrupts held off. Used by the print macros.
#[doc(hidden)]
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;

    use crate::{hal::x86::X86Hardware, sync::InterruptGuard};

    // An interrupt handler that logs must not find the port locked by the
    // code it interrupted.
    let _irq = InterruptGuard::new(&X86Hardware);
    // A failed write has nowhere left to be reported.
    let _ = SERIAL1.lock().write_fmt(args);
}

/// Host stand-in for the serial port: stdout.
#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(args: ::core::fmt::Arguments) {
    std::print!("{}", args);
}

/// Prints formatted text to the serial port.
///
/// # Examples
/// ```
/// kestrel::serial_print!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
///
/// # Examples
/// ```
/// kestrel::serial_println!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
