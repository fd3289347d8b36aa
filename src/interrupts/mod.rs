//! Interrupt routing: IDT, PIC and the handler registry.
//!
//! Every vector enters the kernel through [`Kernel::dispatch`]. IRQs are
//! acknowledged at the PIC before their handler runs; the handler itself is
//! copied out of the registry so the registry lock is not held while it
//! runs.

pub mod frame;
pub mod handlers;
pub mod idt;
pub mod pic;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod stubs;

use log::{info, warn};
use x86_64::PrivilegeLevel;

use crate::{
    constants::idt::{
        DOUBLE_FAULT_VECTOR, EXCEPTION_VECTORS, IRQ_LINES, KERNEL_CODE_SELECTOR, PAGE_FAULT_VECTOR,
        PIC_1_OFFSET,
    },
    error::{KernelError, KernelResult},
    hal::Hardware,
    kernel::Kernel,
    memory::page_fault::page_fault_handler,
    sync::InterruptGuard,
};

use frame::InterruptFrame;
use handlers::{double_fault_handler, exception_name, HandlerFn, InterruptHandler};
use idt::GateFlags;
use pic::Irq;

impl<H: Hardware> Kernel<H> {
    /// Zeroes the IDT, installs gates for the 32 exceptions and 16 IRQs,
    /// remaps the PICs and loads the table.
    pub fn idt_init(&self) {
        let hw = &self.hw;
        {
            let mut idt = self.idt.lock(hw);
            idt.clear();
            for vector in 0..EXCEPTION_VECTORS + IRQ_LINES {
                if let Some(stub) = hw.isr_stub_address(vector) {
                    idt.set_gate(
                        vector,
                        stub,
                        KERNEL_CODE_SELECTOR,
                        GateFlags::interrupt_gate(PrivilegeLevel::Ring0),
                    );
                }
            }
            hw.load_idt(idt.pointer(hw));
        }
        self.pic.lock(hw).init(hw);
        info!(
            "IDT loaded, PIC remapped to vectors {}-{}",
            PIC_1_OFFSET,
            PIC_1_OFFSET + IRQ_LINES - 1
        );
    }

    /// Raw gate setter. Prefer [`Kernel::install_gate`].
    pub fn idt_set_gate(&self, vector: u8, handler: u32, selector: u16, flags: GateFlags) {
        self.idt.lock(&self.hw).set_gate(vector, handler, selector, flags);
    }

    /// Points the gate for `vector` at the platform stub, e.g. the system
    /// call trap at 0x80 with ring 3 access.
    pub fn install_gate(&self, vector: u8, privilege: PrivilegeLevel) -> KernelResult<()> {
        let stub = self
            .hw
            .isr_stub_address(vector)
            .ok_or(KernelError::UnhandledInterrupt {
                vector,
                error_code: 0,
            })?;
        self.idt_set_gate(
            vector,
            stub,
            KERNEL_CODE_SELECTOR,
            GateFlags::interrupt_gate(privilege),
        );
        Ok(())
    }

    /// Sets or replaces the handler for `vector`.
    pub fn register_interrupt_handler(&self, vector: u8, handler: HandlerFn<H>) {
        if self.handlers.lock(&self.hw).register(vector, handler) {
            log::debug!("interrupt {}: handler replaced", vector);
        }
    }

    /// Installs the fatal double fault and page fault handlers.
    pub(crate) fn register_fault_handlers(&self) {
        self.register_interrupt_handler(DOUBLE_FAULT_VECTOR, double_fault_handler::<H>);
        self.register_interrupt_handler(PAGE_FAULT_VECTOR, page_fault_handler::<H>);
    }

    /// Common entry for every vector.
    pub fn dispatch(&self, frame: &mut InterruptFrame) {
        let vector = frame.vector();
        if let Some(irq) = Irq::from_vector(vector) {
            self.pic.lock(&self.hw).end_of_interrupt(&self.hw, irq);
        }

        let handler = self.handlers.lock(&self.hw).get(vector);
        match handler {
            InterruptHandler::Registered(handler) => handler(self, frame),
            InterruptHandler::Unhandled => {
                let err = KernelError::UnhandledInterrupt {
                    vector,
                    error_code: frame.error_code,
                };
                match exception_name(vector) {
                    Some(name) => warn!("{} [{}]", err, name),
                    None => warn!("{}", err),
                }
            }
        }
    }

    /// Dispatches a vector the platform handed back from `halt` instead of
    /// delivering it through the IDT. Runs with interrupts off, as an
    /// interrupt gate would.
    pub fn deliver(&self, vector: u8) {
        let _irq = InterruptGuard::new(&self.hw);
        let mut frame = InterruptFrame::new(vector, 0);
        self.dispatch(&mut frame);
    }

    /// Lets `irq` through to the CPU.
    pub fn enable_irq(&self, irq: Irq) {
        self.pic.lock(&self.hw).clear_mask(&self.hw, irq);
    }

    pub fn disable_irq(&self, irq: Irq) {
        self.pic.lock(&self.hw).set_mask(&self.hw, irq);
    }

    /// Unmasks the line behind a remapped IRQ vector.
    pub fn enable_irq_vector(&self, vector: u8) -> KernelResult<()> {
        let irq = Irq::from_vector(vector).ok_or(KernelError::InvalidIrq(vector))?;
        self.enable_irq(irq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::{
            idt::{SYSCALL_VECTOR, TIMER_VECTOR},
            ports::{PIC1_COMMAND, PIC2_COMMAND},
        },
        hal::sim::SimulatedHardware,
        kernel::tests::test_kernel,
    };

    fn mark(_: &Kernel<SimulatedHardware>, frame: &mut InterruptFrame) {
        frame.eax = 0xAAAA;
    }

    fn mark_again(_: &Kernel<SimulatedHardware>, frame: &mut InterruptFrame) {
        frame.eax = 0xBBBB;
    }

    #[test]
    fn idt_init_installs_exactly_48_gates() {
        let kernel = test_kernel();
        kernel.idt_init();
        let idt = kernel.idt.lock(kernel.hw());
        let present: alloc::vec::Vec<u8> = idt.present_vectors().collect();
        assert_eq!(present, (0..48).collect::<alloc::vec::Vec<u8>>());
        assert_eq!(idt.entry(0).selector(), KERNEL_CODE_SELECTOR);
        assert_eq!(idt.entry(5).handler(), kernel.hw().isr_stub_address(5).unwrap());
        assert_eq!(kernel.hw().loaded_idt().map(|p| p.limit), Some(2047));
    }

    #[test]
    fn idt_init_leaves_interrupts_off() {
        let kernel = test_kernel();
        kernel.idt_init();
        assert!(!kernel.hw().interrupts_enabled());
    }

    #[test]
    fn dispatch_runs_the_latest_handler() {
        let kernel = test_kernel();
        kernel.register_interrupt_handler(0x21, mark);
        kernel.register_interrupt_handler(0x21, mark_again);
        let mut frame = InterruptFrame::new(0x21, 0);
        kernel.dispatch(&mut frame);
        assert_eq!(frame.eax, 0xBBBB);
    }

    #[test]
    fn irqs_are_acknowledged_before_the_handler() {
        fn check(kernel: &Kernel<SimulatedHardware>, _: &mut InterruptFrame) {
            assert_eq!(kernel.hw().writes_to(PIC2_COMMAND), [0x20]);
            assert_eq!(kernel.hw().writes_to(PIC1_COMMAND), [0x20]);
        }
        let kernel = test_kernel();
        kernel.register_interrupt_handler(PIC_1_OFFSET + 10, check);
        kernel.dispatch(&mut InterruptFrame::new(PIC_1_OFFSET + 10, 0));
    }

    #[test]
    fn exceptions_are_not_acknowledged() {
        let kernel = test_kernel();
        kernel.register_interrupt_handler(3, mark);
        kernel.dispatch(&mut InterruptFrame::new(3, 0));
        assert!(kernel.hw().writes_to(PIC1_COMMAND).is_empty());
    }

    #[test]
    fn unhandled_vectors_are_survivable() {
        let kernel = test_kernel();
        let mut frame = InterruptFrame::new(0x55, 0);
        kernel.dispatch(&mut frame);
        kernel.dispatch(&mut InterruptFrame::new(TIMER_VECTOR + 1, 0));
        assert_eq!(frame, InterruptFrame::new(0x55, 0));
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn page_faults_are_fatal() {
        let kernel = test_kernel();
        kernel.register_fault_handlers();
        kernel
            .hw()
            .set_fault_address(crate::memory::VirtAddr::new(0xDEAD_0000));
        kernel.dispatch(&mut InterruptFrame::new(PAGE_FAULT_VECTOR, 0b10));
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn double_faults_are_fatal() {
        let kernel = test_kernel();
        kernel.register_fault_handlers();
        kernel.dispatch(&mut InterruptFrame::new(DOUBLE_FAULT_VECTOR, 0));
    }

    #[test]
    fn syscall_gate_is_ring_three() {
        let kernel = test_kernel();
        kernel.idt_init();
        kernel.install_gate(SYSCALL_VECTOR, PrivilegeLevel::Ring3).unwrap();
        let entry = kernel.idt.lock(kernel.hw()).entry(SYSCALL_VECTOR);
        assert!(entry.is_present());
        assert_eq!(entry.flags().privilege(), PrivilegeLevel::Ring3);
    }

    #[test]
    fn deliver_runs_with_interrupts_off() {
        fn check(kernel: &Kernel<SimulatedHardware>, _: &mut InterruptFrame) {
            assert!(!kernel.hw().interrupts_enabled());
        }
        let kernel = test_kernel();
        kernel.hw().enable_interrupts();
        kernel.register_interrupt_handler(0x30, check);
        kernel.deliver(0x30);
        assert!(kernel.hw().interrupts_enabled());
    }

    #[test]
    fn irq_vectors_unmask_their_line() {
        let kernel = test_kernel();
        kernel.enable_irq_vector(PIC_1_OFFSET + 1).unwrap();
        assert!(!kernel.pic.lock(kernel.hw()).is_masked(Irq::KEYBOARD));
        assert_eq!(
            kernel.enable_irq_vector(3),
            Err(KernelError::InvalidIrq(3))
        );
    }
}
