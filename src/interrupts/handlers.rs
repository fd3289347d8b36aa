//! Vector to handler routing.

use crate::{
    constants::idt::{EXCEPTION_VECTORS, IDT_ENTRIES},
    error::KernelError,
    hal::Hardware,
    interrupts::frame::InterruptFrame,
    kernel::Kernel,
};

/// Handlers run with interrupts off and may rewrite `frame`; the stub
/// resumes whatever the frame describes when they return.
pub type HandlerFn<H> = fn(&Kernel<H>, &mut InterruptFrame);

pub enum InterruptHandler<H: Hardware> {
    Unhandled,
    Registered(HandlerFn<H>),
}

// Derives would demand `H: Copy`.
impl<H: Hardware> Clone for InterruptHandler<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hardware> Copy for InterruptHandler<H> {}

impl<H: Hardware> core::fmt::Debug for InterruptHandler<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InterruptHandler::Unhandled => f.write_str("Unhandled"),
            InterruptHandler::Registered(handler) => {
                write!(f, "Registered({:p})", *handler as *const ())
            }
        }
    }
}

/// One slot per vector. Registering replaces whatever was there.
pub struct HandlerRegistry<H: Hardware> {
    handlers: [InterruptHandler<H>; IDT_ENTRIES],
}

impl<H: Hardware> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hardware> HandlerRegistry<H> {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: [InterruptHandler::Unhandled; IDT_ENTRIES],
        }
    }

    /// Returns `true` if a previous handler was replaced.
    pub fn register(&mut self, vector: u8, handler: HandlerFn<H>) -> bool {
        let previous = core::mem::replace(
            &mut self.handlers[usize::from(vector)],
            InterruptHandler::Registered(handler),
        );
        matches!(previous, InterruptHandler::Registered(_))
    }

    pub fn unregister(&mut self, vector: u8) {
        self.handlers[usize::from(vector)] = InterruptHandler::Unhandled;
    }

    pub fn get(&self, vector: u8) -> InterruptHandler<H> {
        self.handlers[usize::from(vector)]
    }

    pub fn is_registered(&self, vector: u8) -> bool {
        matches!(self.get(vector), InterruptHandler::Registered(_))
    }
}

const EXCEPTION_NAMES: [&str; EXCEPTION_VECTORS as usize] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

/// Human-readable name of a CPU exception vector.
pub fn exception_name(vector: u8) -> Option<&'static str> {
    EXCEPTION_NAMES.get(usize::from(vector)).copied()
}

/// Vector 8. The CPU could not deliver an earlier fault; nothing to resume.
pub fn double_fault_handler<H: Hardware>(kernel: &Kernel<H>, frame: &mut InterruptFrame) {
    kernel.fatal(KernelError::DoubleFault(frame.error_code));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimulatedHardware;

    fn first(_: &Kernel<SimulatedHardware>, frame: &mut InterruptFrame) {
        frame.eax = 1;
    }

    fn second(_: &Kernel<SimulatedHardware>, frame: &mut InterruptFrame) {
        frame.eax = 2;
    }

    #[test]
    fn registry_starts_unhandled() {
        let registry = HandlerRegistry::<SimulatedHardware>::new();
        assert!((0..=u8::MAX).all(|v| !registry.is_registered(v)));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = HandlerRegistry::<SimulatedHardware>::new();
        assert!(!registry.register(33, first));
        assert!(registry.register(33, second));
        assert!(matches!(
            registry.get(33),
            InterruptHandler::Registered(h) if h as usize == second as usize
        ));
        registry.unregister(33);
        assert!(!registry.is_registered(33));
    }

    #[test]
    fn exceptions_have_names() {
        assert_eq!(exception_name(14), Some("Page Fault"));
        assert_eq!(exception_name(8), Some("Double Fault"));
        assert_eq!(exception_name(32), None);
    }
}
