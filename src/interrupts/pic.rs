//! The cascaded 8259 programmable interrupt controllers.
//!
//! After [`Pics::init`] IRQ 0-7 arrive on vectors 32-39 and IRQ 8-15 on
//! 40-47, clear of the CPU exception range. Every line starts masked;
//! drivers unmask the ones they serve.

use core::fmt;

use crate::{
    constants::{
        idt::{IRQ_LINES, PIC_1_OFFSET, PIC_2_OFFSET},
        ports::{PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA},
    },
    error::{KernelError, KernelResult},
    hal::Hardware,
};

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const CMD_END_OF_INTERRUPT: u8 = 0x20;
const CMD_READ_IRR: u8 = 0x0A;
const CMD_READ_ISR: u8 = 0x0B;

/// The slave hangs off master line 2.
const CASCADE_LINE: u8 = 2;
const ALL_MASKED: u8 = 0xFF;

/// A hardware interrupt line, 0-15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Irq(u8);

impl Irq {
    pub const TIMER: Irq = Irq(0);
    pub const KEYBOARD: Irq = Irq(1);

    pub fn new(line: u8) -> KernelResult<Self> {
        if line < IRQ_LINES {
            Ok(Irq(line))
        } else {
            Err(KernelError::InvalidIrqLine(Irq(line)))
        }
    }

    /// The line behind a remapped vector, if the vector is in 32-47.
    pub fn from_vector(vector: u8) -> Option<Self> {
        vector
            .checked_sub(PIC_1_OFFSET)
            .filter(|line| *line < IRQ_LINES)
            .map(Irq)
    }

    pub fn line(self) -> u8 {
        self.0
    }

    pub fn vector(self) -> u8 {
        PIC_1_OFFSET + self.0
    }

    fn is_slave(self) -> bool {
        self.0 >= 8
    }
}

impl fmt::Display for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Master and slave controller with cached mask registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pics {
    master_mask: u8,
    slave_mask: u8,
}

impl Default for Pics {
    fn default() -> Self {
        Self::new()
    }
}

impl Pics {
    pub const fn new() -> Self {
        Pics {
            master_mask: ALL_MASKED,
            slave_mask: ALL_MASKED,
        }
    }

    /// Runs the ICW1-ICW4 sequence on both controllers, then masks every
    /// line.
    pub fn init<H: Hardware + ?Sized>(&mut self, hw: &H) {
        hw.write_port8(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        hw.io_wait();
        hw.write_port8(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        hw.io_wait();

        hw.write_port8(PIC1_DATA, PIC_1_OFFSET);
        hw.io_wait();
        hw.write_port8(PIC2_DATA, PIC_2_OFFSET);
        hw.io_wait();

        hw.write_port8(PIC1_DATA, 1 << CASCADE_LINE);
        hw.io_wait();
        hw.write_port8(PIC2_DATA, CASCADE_LINE);
        hw.io_wait();

        hw.write_port8(PIC1_DATA, ICW4_8086);
        hw.io_wait();
        hw.write_port8(PIC2_DATA, ICW4_8086);
        hw.io_wait();

        self.disable(hw);
    }

    /// Acknowledges `irq`. Lines on the slave need both controllers told,
    /// slave first.
    pub fn end_of_interrupt<H: Hardware + ?Sized>(&self, hw: &H, irq: Irq) {
        if irq.is_slave() {
            hw.write_port8(PIC2_COMMAND, CMD_END_OF_INTERRUPT);
        }
        hw.write_port8(PIC1_COMMAND, CMD_END_OF_INTERRUPT);
    }

    pub fn set_mask<H: Hardware + ?Sized>(&mut self, hw: &H, irq: Irq) {
        if irq.is_slave() {
            self.slave_mask |= 1 << (irq.0 - 8);
        } else {
            self.master_mask |= 1 << irq.0;
        }
        self.write_masks(hw);
    }

    pub fn clear_mask<H: Hardware + ?Sized>(&mut self, hw: &H, irq: Irq) {
        if irq.is_slave() {
            self.slave_mask &= !(1 << (irq.0 - 8));
            // Slave lines only reach the CPU through the cascade line.
            self.master_mask &= !(1 << CASCADE_LINE);
        } else {
            self.master_mask &= !(1 << irq.0);
        }
        self.write_masks(hw);
    }

    pub fn is_masked(&self, irq: Irq) -> bool {
        self.masks() & (1 << irq.0) != 0
    }

    /// Combined mask register, slave in the high byte.
    pub fn masks(&self) -> u16 {
        u16::from(self.master_mask) | (u16::from(self.slave_mask) << 8)
    }

    /// Interrupt request register: lines raised but not yet serviced.
    pub fn read_irr<H: Hardware + ?Sized>(&self, hw: &H) -> u16 {
        self.read_register(hw, CMD_READ_IRR)
    }

    /// In-service register: lines being serviced.
    pub fn read_isr<H: Hardware + ?Sized>(&self, hw: &H) -> u16 {
        self.read_register(hw, CMD_READ_ISR)
    }

    /// Masks every line on both controllers.
    pub fn disable<H: Hardware + ?Sized>(&mut self, hw: &H) {
        self.master_mask = ALL_MASKED;
        self.slave_mask = ALL_MASKED;
        self.write_masks(hw);
    }

    fn read_register<H: Hardware + ?Sized>(&self, hw: &H, command: u8) -> u16 {
        hw.write_port8(PIC1_COMMAND, command);
        hw.write_port8(PIC2_COMMAND, command);
        u16::from(hw.read_port8(PIC1_COMMAND)) | (u16::from(hw.read_port8(PIC2_COMMAND)) << 8)
    }

    fn write_masks<H: Hardware + ?Sized>(&self, hw: &H) {
        hw.write_port8(PIC1_DATA, self.master_mask);
        hw.write_port8(PIC2_DATA, self.slave_mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{constants::ports::IO_WAIT_PORT, hal::sim::SimulatedHardware};
    use alloc::vec::Vec;

    #[test]
    fn init_remaps_and_masks_everything() {
        let hw = SimulatedHardware::new();
        let mut pics = Pics::new();
        pics.init(&hw);

        let writes: Vec<_> = hw
            .port_writes()
            .into_iter()
            .filter(|w| w.port != IO_WAIT_PORT)
            .map(|w| (w.port, w.value))
            .collect();
        assert_eq!(
            writes,
            [
                (PIC1_COMMAND, 0x11),
                (PIC2_COMMAND, 0x11),
                (PIC1_DATA, 0x20),
                (PIC2_DATA, 0x28),
                (PIC1_DATA, 0x04),
                (PIC2_DATA, 0x02),
                (PIC1_DATA, 0x01),
                (PIC2_DATA, 0x01),
                (PIC1_DATA, 0xFF),
                (PIC2_DATA, 0xFF),
            ]
        );
        assert_eq!(hw.writes_to(IO_WAIT_PORT).len(), 8);
    }

    #[test]
    fn slave_eoi_goes_to_both_controllers() {
        let hw = SimulatedHardware::new();
        let pics = Pics::new();
        pics.end_of_interrupt(&hw, Irq::new(12).unwrap());
        let writes: Vec<_> = hw.port_writes().into_iter().map(|w| w.port).collect();
        assert_eq!(writes, [PIC2_COMMAND, PIC1_COMMAND]);

        hw.clear_port_writes();
        pics.end_of_interrupt(&hw, Irq::TIMER);
        assert_eq!(hw.writes_to(PIC1_COMMAND), [0x20]);
        assert!(hw.writes_to(PIC2_COMMAND).is_empty());
    }

    #[test]
    fn masks_are_cached_and_written() {
        let hw = SimulatedHardware::new();
        let mut pics = Pics::new();
        pics.clear_mask(&hw, Irq::TIMER);
        assert_eq!(hw.read_port8(PIC1_DATA), 0xFE);
        assert!(!pics.is_masked(Irq::TIMER));

        pics.clear_mask(&hw, Irq::new(9).unwrap());
        assert_eq!(pics.masks(), 0xFDFA);
        pics.set_mask(&hw, Irq::TIMER);
        assert!(pics.is_masked(Irq::TIMER));
    }

    #[test]
    fn vectors_map_to_lines() {
        assert_eq!(Irq::from_vector(32), Some(Irq::TIMER));
        assert_eq!(Irq::from_vector(47).map(Irq::line), Some(15));
        assert_eq!(Irq::from_vector(48), None);
        assert_eq!(Irq::from_vector(14), None);
        assert_eq!(Irq::new(16), Err(KernelError::InvalidIrqLine(Irq(16))));
    }

    #[test]
    fn register_reads_issue_ocw3() {
        let hw = SimulatedHardware::new();
        let pics = Pics::new();
        pics.read_isr(&hw);
        assert_eq!(hw.writes_to(PIC1_COMMAND), [0x0B]);
        assert_eq!(hw.writes_to(PIC2_COMMAND), [0x0B]);
    }
}
