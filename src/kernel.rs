//! The kernel context.
//!
//! Every piece of shared kernel state lives in one [`Kernel`] value, each
//! behind an [`IrqMutex`] so it can be touched from both normal and
//! interrupt context. Subsystems add their operations to `Kernel` in their
//! own modules.

use alloc::boxed::Box;

use log::{error, info};

use crate::{
    constants::{
        memory::{DEFAULT_MEMORY_FRAMES, HEAP_SIZE},
        timer::{DEFAULT_FREQUENCY, TIME_SLICE_TICKS},
    },
    error::{KernelError, KernelResult},
    hal::Hardware,
    interrupts::{handlers::HandlerRegistry, idt::InterruptDescriptorTable, pic::Pics},
    memory::{frame_allocator::FrameAllocator, heap::KernelAllocator, paging::Paging},
    processes::scheduler::ProcessTable,
    sync::IrqMutex,
    timer::Timer,
};

#[cfg(all(target_arch = "x86", target_os = "none"))]
/// The running kernel. Set once during boot, before interrupts are enabled.
pub static KERNEL: spin::Once<Kernel<crate::hal::x86::X86Hardware>> = spin::Once::new();

/// Boot-time tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical frames tracked when no memory map is available.
    pub memory_frames: usize,
    /// Size of the kmalloc arena in bytes.
    pub heap_size: usize,
    /// PIT interrupt rate in Hz.
    pub timer_frequency: u32,
    /// Timer ticks per scheduling round.
    pub time_slice: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            memory_frames: DEFAULT_MEMORY_FRAMES,
            heap_size: HEAP_SIZE,
            timer_frequency: DEFAULT_FREQUENCY,
            time_slice: TIME_SLICE_TICKS,
        }
    }
}

/// Whatever serves `kmalloc`.
pub type KernelHeap = Box<dyn KernelAllocator + Send>;

/// The kernel core: every subsystem's state, each behind its own
/// interrupt-safe lock.
pub struct Kernel<H: Hardware> {
    pub(crate) hw: H,
    pub(crate) config: KernelConfig,
    /// Physical frame bitmap.
    pub(crate) frames: IrqMutex<FrameAllocator>,
    /// The kmalloc arena.
    pub(crate) heap: IrqMutex<KernelHeap>,
    pub(crate) paging: IrqMutex<Paging>,
    pub(crate) idt: IrqMutex<InterruptDescriptorTable>,
    /// Rust handlers per vector.
    pub(crate) handlers: IrqMutex<HandlerRegistry<H>>,
    pub(crate) pic: IrqMutex<Pics>,
    /// Tick count and the timer callback.
    pub(crate) timer: IrqMutex<Timer>,
    pub(crate) processes: IrqMutex<ProcessTable>,
}

impl<H: Hardware> Kernel<H> {
    /// Assembles a kernel around already built memory allocators. Nothing is
    /// touched on the hardware until [`Kernel::init`].
    pub fn new(hw: H, config: KernelConfig, frames: FrameAllocator, heap: KernelHeap) -> Self {
        let paging = Paging::new(&hw);
        Kernel {
            config,
            frames: IrqMutex::new(frames),
            heap: IrqMutex::new(heap),
            paging: IrqMutex::new(paging),
            idt: IrqMutex::new(InterruptDescriptorTable::new()),
            handlers: IrqMutex::new(HandlerRegistry::new()),
            pic: IrqMutex::new(Pics::new()),
            timer: IrqMutex::new(Timer::new(config.time_slice)),
            processes: IrqMutex::new(ProcessTable::new()),
            hw,
        }
    }

    /// The platform the kernel runs on.
    pub fn hw(&self) -> &H {
        &self.hw
    }

    /// Settings the kernel was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Brings up the core in dependency order. Interrupts stay disabled;
    /// call [`Kernel::enable_interrupts`] once the caller is ready for them.
    pub fn init(&self) -> KernelResult<()> {
        self.memory_init();
        self.idt_init();
        self.register_fault_handlers();
        self.pit_init(self.config.timer_frequency);
        self.process_init()?;
        info!("kernel core initialized");
        Ok(())
    }

    /// Lets the CPU take interrupts.
    pub fn enable_interrupts(&self) {
        self.hw.enable_interrupts();
    }

    /// Reports an unrecoverable error and stops the machine.
    pub fn fatal(&self, err: KernelError) -> ! {
        error!("FATAL: {}", err);
        self.hw.disable_interrupts();
        self.hw.halt_forever()
    }
}

#[cfg(not(target_os = "none"))]
mod simulated {
    use alloc::{boxed::Box, vec};

    use super::{Kernel, KernelConfig};
    use crate::{
        hal::sim::SimulatedHardware,
        memory::{frame_allocator::FrameAllocator, heap::BumpAllocator, VirtAddr},
    };

    /// Where the simulated kmalloc arena appears, inside the identity map.
    const SIM_HEAP_BASE: u32 = 0x0020_0000;

    impl Kernel<SimulatedHardware> {
        /// A kernel on a fresh simulated machine.
        pub fn simulated(config: KernelConfig) -> Self {
            let arena = Box::leak(vec![0u8; config.heap_size].into_boxed_slice());
            let heap = BumpAllocator::new(arena, VirtAddr::new(SIM_HEAP_BASE));
            Kernel::new(
                SimulatedHardware::new(),
                config,
                FrameAllocator::new(config.memory_frames),
                Box::new(heap),
            )
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        constants::{idt::TIMER_VECTOR, memory::IDENTITY_MAPPED_PAGES},
        hal::sim::SimulatedHardware,
        processes::process::Pid,
    };

    pub(crate) fn test_kernel() -> Kernel<SimulatedHardware> {
        Kernel::simulated(KernelConfig {
            memory_frames: 4096,
            heap_size: 64 * 1024,
            ..KernelConfig::default()
        })
    }

    #[test]
    fn init_brings_up_every_subsystem() {
        let kernel = test_kernel();
        kernel.init().unwrap();

        assert!(kernel.hw().paging_enabled());
        assert!(kernel.hw().loaded_idt().is_some());
        assert!(kernel.handlers.lock(kernel.hw()).is_registered(TIMER_VECTOR));
        assert_eq!(kernel.get_timer_info().frequency, 100);
        assert_eq!(kernel.process_get_current(), Some(Pid::KERNEL));
        assert!(kernel.frames.lock(kernel.hw()).used_frames() >= IDENTITY_MAPPED_PAGES as usize);
        assert!(!kernel.hw().interrupts_enabled());

        kernel.enable_interrupts();
        assert!(kernel.hw().interrupts_enabled());
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn fatal_errors_halt() {
        test_kernel().fatal(KernelError::OutOfFrames);
    }

    #[test]
    fn default_config_matches_constants() {
        let config = KernelConfig::default();
        assert_eq!(config.heap_size, 1024 * 1024);
        assert_eq!(config.timer_frequency, 100);
        assert_eq!(config.time_slice, 10);
    }
}
