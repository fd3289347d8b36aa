//! Interrupt Descriptor Table.
//!
//! 256 eight-byte gate descriptors in the 32-bit protected mode layout.
//! Vectors without an installed gate stay all-zero, which the CPU reads as
//! not present.

use alloc::boxed::Box;
use core::mem::size_of;

use bitflags::bitflags;
use x86_64::PrivilegeLevel;

use crate::{
    constants::idt::IDT_ENTRIES,
    hal::{DescriptorTablePointer, Hardware},
};

bitflags! {
    /// Type and attribute byte of a gate descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GateFlags: u8 {
        const PRESENT = 0x80;
        /// Descriptor privilege level (bits 5-6).
        const DPL = 0x60;
        /// 32-bit interrupt gate; clears IF on entry.
        const INTERRUPT_GATE = 0x0E;
        /// 32-bit trap gate; leaves IF alone.
        const TRAP_GATE = 0x0F;
    }
}

impl GateFlags {
    /// Present 32-bit interrupt gate callable from `privilege`.
    pub fn interrupt_gate(privilege: PrivilegeLevel) -> Self {
        GateFlags::PRESENT
            | GateFlags::INTERRUPT_GATE
            | GateFlags::from_bits_retain((privilege as u8) << 5)
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_u16(u16::from((self.bits() & GateFlags::DPL.bits()) >> 5))
    }
}

#[derive(Clone, Copy, Default)]
#[repr(C, packed)]
pub struct IdtEntry {
    base_low: u16,
    selector: u16,
    reserved: u8,
    flags: u8,
    base_high: u16,
}

impl IdtEntry {
    pub const fn missing() -> Self {
        IdtEntry {
            base_low: 0,
            selector: 0,
            reserved: 0,
            flags: 0,
            base_high: 0,
        }
    }

    pub fn new(handler: u32, selector: u16, flags: GateFlags) -> Self {
        IdtEntry {
            base_low: handler as u16,
            selector,
            reserved: 0,
            flags: flags.bits(),
            base_high: (handler >> 16) as u16,
        }
    }

    pub fn handler(&self) -> u32 {
        u32::from(self.base_low) | (u32::from(self.base_high) << 16)
    }

    pub fn selector(&self) -> u16 {
        self.selector
    }

    pub fn flags(&self) -> GateFlags {
        GateFlags::from_bits_retain(self.flags)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(GateFlags::PRESENT)
    }
}

impl core::fmt::Debug for IdtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdtEntry")
            .field("handler", &format_args!("{:#010x}", self.handler()))
            .field("selector", &format_args!("{:#06x}", self.selector()))
            .field("flags", &self.flags())
            .finish()
    }
}

pub struct InterruptDescriptorTable {
    entries: Box<[IdtEntry; IDT_ENTRIES]>,
}

impl Default for InterruptDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptDescriptorTable {
    pub fn new() -> Self {
        InterruptDescriptorTable {
            entries: Box::new([IdtEntry::missing(); IDT_ENTRIES]),
        }
    }

    /// Zeroes every gate.
    pub fn clear(&mut self) {
        self.entries.fill(IdtEntry::missing());
    }

    /// The single writer of gate descriptors.
    pub fn set_gate(&mut self, vector: u8, handler: u32, selector: u16, flags: GateFlags) {
        self.entries[usize::from(vector)] = IdtEntry::new(handler, selector, flags);
    }

    pub fn entry(&self, vector: u8) -> IdtEntry {
        self.entries[usize::from(vector)]
    }

    pub fn present_vectors(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(|v| self.entry(*v).is_present())
    }

    /// `lidt` operand for this table.
    pub fn pointer<H: Hardware + ?Sized>(&self, hw: &H) -> DescriptorTablePointer {
        DescriptorTablePointer {
            limit: (IDT_ENTRIES * size_of::<IdtEntry>() - 1) as u16,
            base: hw
                .physical_address_of(self.entries.as_ptr() as *const u8)
                .as_u32(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_eight_bytes() {
        assert_eq!(size_of::<IdtEntry>(), 8);
    }

    #[test]
    fn handler_address_is_split() {
        let entry = IdtEntry::new(
            0x0010_2030,
            0x08,
            GateFlags::interrupt_gate(PrivilegeLevel::Ring0),
        );
        assert_eq!(entry.handler(), 0x0010_2030);
        assert_eq!(entry.selector(), 0x08);
        assert_eq!(entry.flags().bits(), 0x8E);
    }

    #[test]
    fn user_gates_carry_ring_three() {
        let flags = GateFlags::interrupt_gate(PrivilegeLevel::Ring3);
        assert_eq!(flags.bits(), 0xEE);
        assert_eq!(flags.privilege(), PrivilegeLevel::Ring3);
    }

    #[test]
    fn new_table_has_no_present_gates() {
        let mut idt = InterruptDescriptorTable::new();
        assert_eq!(idt.present_vectors().count(), 0);
        idt.set_gate(3, 0x1234, 0x08, GateFlags::interrupt_gate(PrivilegeLevel::Ring0));
        assert!(idt.entry(3).is_present());
        idt.clear();
        assert!(!idt.entry(3).is_present());
    }
}
