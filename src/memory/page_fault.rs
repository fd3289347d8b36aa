//! Page fault decoding and the boot-time fault policy.

use core::fmt;

use x86_64::structures::idt::PageFaultErrorCode;

use crate::{
    error::KernelError, hal::Hardware, interrupts::frame::InterruptFrame, kernel::Kernel,
    memory::VirtAddr,
};

/// What the CPU reported about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultInfo {
    pub address: VirtAddr,
    /// The page was present (protection violation) rather than missing.
    pub present: bool,
    pub write: bool,
    pub user: bool,
}

impl PageFaultInfo {
    pub fn new(address: VirtAddr, error_code: u32) -> Self {
        let code = PageFaultErrorCode::from_bits_truncate(u64::from(error_code));
        PageFaultInfo {
            address,
            present: code.contains(PageFaultErrorCode::PROTECTION_VIOLATION),
            write: code.contains(PageFaultErrorCode::CAUSED_BY_WRITE),
            user: code.contains(PageFaultErrorCode::USER_MODE),
        }
    }
}

impl fmt::Display for PageFaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {} ({}, {}, {} mode)",
            self.address,
            if self.present {
                "protection violation"
            } else {
                "page not present"
            },
            if self.write { "write" } else { "read" },
            if self.user { "user" } else { "supervisor" },
        )
    }
}

/// Vector 14. No demand paging: every fault is fatal.
pub fn page_fault_handler<H: Hardware>(kernel: &Kernel<H>, frame: &mut InterruptFrame) {
    let info = PageFaultInfo::new(kernel.hw().fault_address(), frame.error_code);
    kernel.fatal(KernelError::PageFault(info));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits_decode_independently() {
        let addr = VirtAddr::new(0xDEAD_B000);
        let info = PageFaultInfo::new(addr, 0b111);
        assert!(info.present && info.write && info.user);

        let info = PageFaultInfo::new(addr, 0b010);
        assert!(!info.present && info.write && !info.user);

        let info = PageFaultInfo::new(addr, 0);
        assert!(!info.present && !info.write && !info.user);
    }

    #[test]
    fn display_names_the_facts() {
        let info = PageFaultInfo::new(VirtAddr::new(0x1000), 0b101);
        assert_eq!(
            alloc::format!("{info}"),
            "page fault at 0x00001000 (protection violation, read, user mode)"
        );
    }
}
