//! Interrupt Descriptor Table configuration.

pub const IDT_ENTRIES: usize = 256;

/// Vectors 0-31 are CPU exceptions.
pub const EXCEPTION_VECTORS: u8 = 32;

/// Remapped base of the master PIC (IRQ 0-7).
pub const PIC_1_OFFSET: u8 = 32;
/// Remapped base of the slave PIC (IRQ 8-15).
pub const PIC_2_OFFSET: u8 = 40;
pub const IRQ_LINES: u8 = 16;

/// Vector number assigned to the timer interrupt.
pub const TIMER_VECTOR: u8 = 32;
pub const DOUBLE_FAULT_VECTOR: u8 = 8;
pub const PAGE_FAULT_VECTOR: u8 = 14;
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Kernel code segment selector (GDT index 1, ring 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
