//! Hardware abstraction layer.
//!
//! Everything the core needs from the CPU goes through [`Hardware`]: port
//! I/O, the interrupt flag, paging control registers, the TLB and the IDT
//! register. The bare-metal kernel uses [`x86::X86Hardware`]; host builds
//! use [`sim::SimulatedHardware`], which records every access so the core
//! can be tested without a machine.

#[cfg(not(target_os = "none"))]
pub mod sim;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

use crate::{constants::ports::IO_WAIT_PORT, memory::PhysAddr, memory::VirtAddr};

/// Base and limit handed to `lidt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u32,
}

pub trait Hardware: Send + Sync {
    fn read_port8(&self, port: u16) -> u8;
    fn read_port16(&self, port: u16) -> u16;
    fn read_port32(&self, port: u16) -> u32;
    fn write_port8(&self, port: u16, value: u8);
    fn write_port16(&self, port: u16, value: u16);
    fn write_port32(&self, port: u16, value: u32);

    /// Short delay between PIC/PIT programming steps.
    fn io_wait(&self) {
        self.write_port8(IO_WAIT_PORT, 0);
    }

    fn interrupts_enabled(&self) -> bool;
    fn enable_interrupts(&self);
    fn disable_interrupts(&self);

    /// Halts until the next interrupt.
    ///
    /// Returns a vector the caller must dispatch itself when the platform
    /// cannot deliver interrupts asynchronously. Real hardware always
    /// returns `None`: the interrupt has already been serviced by the time
    /// `hlt` retires.
    fn halt(&self) -> Option<u8>;

    /// Stops the CPU for good. Used for fatal errors.
    fn halt_forever(&self) -> ! {
        loop {
            self.disable_interrupts();
            let _ = self.halt();
        }
    }

    /// Loads `directory` into CR3 and sets CR0.PG.
    fn load_page_directory(&self, directory: PhysAddr);

    /// Drops the TLB entry for one page.
    fn invalidate_page(&self, address: VirtAddr);

    /// Faulting linear address of the last page fault (CR2).
    fn fault_address(&self) -> VirtAddr;

    fn load_idt(&self, pointer: DescriptorTablePointer);

    /// Entry stub the IDT gate for `vector` should point at, if the
    /// platform provides one.
    fn isr_stub_address(&self, vector: u8) -> Option<u32>;

    /// Physical address of a kernel object at `ptr`.
    fn physical_address_of(&self, ptr: *const u8) -> PhysAddr;
}
