use core::fmt;

use crate::{
    constants::{idt::KERNEL_CODE_SELECTOR, processes::INITIAL_EFLAGS},
    interrupts::frame::InterruptFrame,
};

/// CPU state of a process that is not running.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cr3: u32,
}

impl Context {
    /// Fresh context that starts at `entry` on an empty stack with
    /// interrupts enabled.
    pub fn new(entry: u32, stack_top: u32, cr3: u32) -> Self {
        Context {
            eip: entry,
            esp: stack_top,
            ebp: stack_top,
            eflags: INITIAL_EFLAGS,
            cr3,
            ..Default::default()
        }
    }

    /// Captures the interrupted registers. `cr3` is left alone: every
    /// process shares the kernel directory.
    pub fn save_from(&mut self, frame: &InterruptFrame) {
        self.eax = frame.eax;
        self.ebx = frame.ebx;
        self.ecx = frame.ecx;
        self.edx = frame.edx;
        self.esi = frame.esi;
        self.edi = frame.edi;
        self.ebp = frame.ebp;
        self.esp = frame.esp;
        self.eip = frame.eip;
        self.eflags = frame.eflags;
    }

    /// Writes this context into `frame` so the interrupt returns into it.
    pub fn load_into(&self, frame: &mut InterruptFrame) {
        frame.eax = self.eax;
        frame.ebx = self.ebx;
        frame.ecx = self.ecx;
        frame.edx = self.edx;
        frame.esi = self.esi;
        frame.edi = self.edi;
        frame.ebp = self.ebp;
        frame.esp = self.esp;
        frame.eip = self.eip;
        frame.eflags = self.eflags;
        frame.cs = KERNEL_CODE_SELECTOR.into();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Context {{ eax: {:#x}, ebx: {:#x}, ecx: {:#x}, edx: {:#x}, esi: {:#x}, edi: {:#x}, \
             ebp: {:#x}, esp: {:#x}, eip: {:#x}, eflags: {:#x}, cr3: {:#x} }}",
            self.eax,
            self.ebx,
            self.ecx,
            self.edx,
            self.esi,
            self.edi,
            self.ebp,
            self.esp,
            self.eip,
            self.eflags,
            self.cr3
        )
    }
}
