//! 32-bit x86 implementation of [`Hardware`].

use core::arch::asm;

use super::{DescriptorTablePointer, Hardware};
use crate::{
    interrupts::stubs,
    memory::{PhysAddr, VirtAddr},
};

const EFLAGS_IF: u32 = 1 << 9;
const CR0_PG: u32 = 1 << 31;

/// The running CPU. Zero-sized; every method is a few instructions.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Hardware;

impl X86Hardware {
    pub const fn new() -> Self {
        X86Hardware
    }
}

impl Hardware for X86Hardware {
    fn read_port8(&self, port: u16) -> u8 {
        let value: u8;
        unsafe {
            asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn read_port16(&self, port: u16) -> u16 {
        let value: u16;
        unsafe {
            asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn read_port32(&self, port: u16) -> u32 {
        let value: u32;
        unsafe {
            asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn write_port8(&self, port: u16, value: u8) {
        unsafe {
            asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
        }
    }

    fn write_port16(&self, port: u16, value: u16) {
        unsafe {
            asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags));
        }
    }

    fn write_port32(&self, port: u16, value: u32) {
        unsafe {
            asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags));
        }
    }

    fn interrupts_enabled(&self) -> bool {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
        }
        eflags & EFLAGS_IF != 0
    }

    fn enable_interrupts(&self) {
        unsafe {
            asm!("sti", options(nomem, nostack));
        }
    }

    fn disable_interrupts(&self) {
        unsafe {
            asm!("cli", options(nomem, nostack));
        }
    }

    fn halt(&self) -> Option<u8> {
        unsafe {
            asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        None
    }

    fn load_page_directory(&self, directory: PhysAddr) {
        unsafe {
            asm!(
                "mov cr3, {dir}",
                "mov {tmp}, cr0",
                "or {tmp}, {pg}",
                "mov cr0, {tmp}",
                dir = in(reg) directory.as_u32(),
                tmp = out(reg) _,
                pg = const CR0_PG,
                options(nostack, preserves_flags),
            );
        }
    }

    fn invalidate_page(&self, address: VirtAddr) {
        unsafe {
            asm!("invlpg [{}]", in(reg) address.as_u32(), options(nostack, preserves_flags));
        }
    }

    fn fault_address(&self) -> VirtAddr {
        let cr2: u32;
        unsafe {
            asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        VirtAddr::new(cr2)
    }

    fn load_idt(&self, pointer: DescriptorTablePointer) {
        #[repr(C, packed)]
        struct Idtr {
            limit: u16,
            base: u32,
        }

        let idtr = Idtr {
            limit: pointer.limit,
            base: pointer.base,
        };
        unsafe {
            asm!("lidt [{}]", in(reg) &idtr, options(readonly, nostack, preserves_flags));
        }
    }

    fn isr_stub_address(&self, vector: u8) -> Option<u32> {
        stubs::stub_address(vector)
    }

    fn physical_address_of(&self, ptr: *const u8) -> PhysAddr {
        // The kernel runs identity mapped.
        PhysAddr::new(ptr as u32)
    }
}
