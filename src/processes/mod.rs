pub mod process;
pub mod registers;
pub mod scheduler;

use log::{info, warn};

use crate::{
    constants::processes::KERNEL_STACK_SIZE,
    error::{KernelError, KernelResult},
    hal::Hardware,
    interrupts::frame::InterruptFrame,
    kernel::Kernel,
};

use process::{KernelStack, Pid, ProcessState, PCB};

impl<H: Hardware> Kernel<H> {
    fn kernel_cr3(&self) -> u32 {
        self.paging
            .lock(&self.hw)
            .kernel_directory()
            .physical_address()
            .as_u32()
    }

    fn allocate_kernel_stack(&self) -> KernelStack {
        KernelStack::new(self.kmalloc(KERNEL_STACK_SIZE as usize))
    }

    /// Adopts the boot context as pid 0.
    pub fn process_init(&self) -> KernelResult<Pid> {
        let stack = self.allocate_kernel_stack();
        let cr3 = self.kernel_cr3();
        let pid = self.processes.lock(&self.hw).init(stack, cr3)?;
        info!("process table ready, kernel is pid {}", pid);
        Ok(pid)
    }

    /// Creates a Ready process that starts executing at `entry` with its
    /// own kernel stack. A full table is reported before any stack is
    /// allocated, since the heap never takes memory back.
    pub fn process_create(&self, name: &str, entry: u32) -> KernelResult<Pid> {
        if self.processes.lock(&self.hw).is_full() {
            return Err(KernelError::ProcessTableFull);
        }
        let stack = self.allocate_kernel_stack();
        let cr3 = self.kernel_cr3();
        let pid = self
            .processes
            .lock(&self.hw)
            .create(name, entry, stack, cr3)?;
        info!("created process {} '{}' at {:#x}", pid, name, entry);
        Ok(pid)
    }

    /// Makes `next` the running process. `frame` is the interrupted CPU
    /// state: it is saved into the outgoing PCB and replaced with `next`'s
    /// context. Interrupts stay off for the whole exchange.
    pub fn process_switch(&self, next: Option<Pid>, frame: &mut InterruptFrame) -> KernelResult<bool> {
        self.processes.lock(&self.hw).switch(next, frame)
    }

    /// Round-robin step. Returns whether a switch happened.
    pub fn process_schedule(&self, frame: &mut InterruptFrame) -> bool {
        match self.processes.lock(&self.hw).schedule(frame) {
            Ok(switched) => switched,
            Err(err) => {
                warn!("scheduler: {}", err);
                false
            }
        }
    }

    /// Removes `pid` and frees its kernel stack.
    ///
    /// Terminating the last process other than the kernel leaves only pid 0
    /// to run.
    pub fn process_terminate(&self, pid: Pid) -> KernelResult<()> {
        let stack = self.processes.lock(&self.hw).terminate(pid)?;
        self.kfree(stack.base);
        info!("terminated process {}", pid);
        Ok(())
    }

    pub fn process_get_current(&self) -> Option<Pid> {
        self.processes.lock(&self.hw).current()
    }

    /// Snapshot of a process control block.
    pub fn process(&self, pid: Pid) -> Option<PCB> {
        self.processes.lock(&self.hw).get(pid).copied()
    }

    pub fn set_process_state(&self, pid: Pid, state: ProcessState) -> KernelResult<()> {
        self.processes.lock(&self.hw).set_state(pid, state)
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock(&self.hw).len()
    }

    /// Whether a time slice expiring now should run the scheduler.
    pub fn should_schedule(&self) -> bool {
        let table = self.processes.lock(&self.hw);
        table.len() > 1 || table.reload_pending()
    }

    pub fn print_process_table(&self) {
        let table = self.processes.lock(&self.hw);
        info!("Process Table Contents:");
        if table.is_empty() {
            info!("No processes found");
            return;
        }
        for pcb in table.iter() {
            info!(
                "PID {} '{}': {:?}, EIP: {:#x}, ESP: {:#x}, stack {}+{:#x}",
                pcb.pid,
                pcb.name,
                pcb.state,
                pcb.context.eip,
                pcb.context.esp,
                pcb.kernel_stack.base,
                pcb.kernel_stack.size
            );
        }
    }
}
