#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod devices;
pub mod error;
pub mod hal;
pub mod init;
pub mod interrupts;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod sync;
pub mod timer;

pub use devices::serial;
pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelConfig};

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

/// Sleeps between interrupts forever, handing each one to the kernel.
pub fn idle_loop<H: hal::Hardware>(kernel: &Kernel<H>) -> ! {
    kernel.enable_interrupts();
    loop {
        if let Some(vector) = kernel.hw().halt() {
            kernel.deliver(vector);
        }
    }
}
