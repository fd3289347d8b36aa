//! The process table and round-robin scheduling.
//!
//! PCBs live in a map keyed by pid; the ready ring is a bounded list of
//! pids, newest first, so the boot process sits at the tail. The scheduler
//! walks the ring starting after the current process and wraps around.

use alloc::collections::BTreeMap;

use arrayvec::ArrayVec;
use log::debug;

use crate::{
    constants::processes::MAX_PROCESSES,
    error::{KernelError, KernelResult},
    interrupts::frame::InterruptFrame,
    processes::{
        process::{KernelStack, Pid, ProcessState, PCB},
        registers::Context,
    },
};

pub struct ProcessTable {
    processes: BTreeMap<Pid, PCB>,
    ring: ArrayVec<Pid, MAX_PROCESSES>,
    current: Option<Pid>,
    next_pid: u32,
    /// Set when the running process was terminated: the live registers
    /// belong to nobody, so the next switch must not save them.
    reload_current: bool,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub const fn new() -> Self {
        ProcessTable {
            processes: BTreeMap::new(),
            ring: ArrayVec::new_const(),
            current: None,
            next_pid: 0,
            reload_current: false,
        }
    }

    /// Registers the boot context as pid 0, already running.
    pub fn init(&mut self, kernel_stack: KernelStack, cr3: u32) -> KernelResult<Pid> {
        if self.processes.contains_key(&Pid::KERNEL) {
            return Ok(Pid::KERNEL);
        }
        let context = Context::new(0, kernel_stack.top(), cr3);
        let pid = self.insert("kernel", context, kernel_stack)?;
        if let Some(pcb) = self.processes.get_mut(&pid) {
            pcb.state = ProcessState::Running;
        }
        self.current = Some(pid);
        Ok(pid)
    }

    /// Adds a Ready process that will start at `entry` on `kernel_stack`.
    pub fn create(
        &mut self,
        name: &str,
        entry: u32,
        kernel_stack: KernelStack,
        cr3: u32,
    ) -> KernelResult<Pid> {
        let context = Context::new(entry, kernel_stack.top(), cr3);
        self.insert(name, context, kernel_stack)
    }

    fn insert(&mut self, name: &str, context: Context, stack: KernelStack) -> KernelResult<Pid> {
        let pid = Pid::new(self.next_pid);
        self.ring
            .try_insert(0, pid)
            .map_err(|_| KernelError::ProcessTableFull)?;
        self.next_pid += 1;
        self.processes.insert(pid, PCB::new(pid, name, context, stack));
        Ok(pid)
    }

    /// Saves the interrupted process into its PCB and loads `next` into
    /// `frame`. Returns `false` without touching anything when there is
    /// nothing to switch to.
    pub fn switch(&mut self, next: Option<Pid>, frame: &mut InterruptFrame) -> KernelResult<bool> {
        let Some(next) = next else {
            return Ok(false);
        };
        if !self.processes.contains_key(&next) {
            return Err(KernelError::NoSuchProcess(next));
        }
        if self.current == Some(next) && !self.reload_current {
            return Ok(false);
        }

        let reload = core::mem::take(&mut self.reload_current);
        if let Some(outgoing) = self.current.filter(|pid| *pid != next) {
            if let Some(pcb) = self.processes.get_mut(&outgoing) {
                if !reload {
                    pcb.context.save_from(frame);
                }
                if pcb.state == ProcessState::Running {
                    pcb.state = ProcessState::Ready;
                }
            }
        }

        let Some(pcb) = self.processes.get_mut(&next) else {
            return Err(KernelError::NoSuchProcess(next));
        };
        pcb.state = ProcessState::Running;
        pcb.context.load_into(frame);
        self.current = Some(next);
        debug!("switched to process {} ({})", next, pcb.name);
        Ok(true)
    }

    /// Round robin: the first Ready process after the current one.
    pub fn next_ready(&self) -> Option<Pid> {
        let current = self.current?;
        let position = self.ring.iter().position(|pid| *pid == current)?;
        let len = self.ring.len();
        (1..len)
            .map(|offset| self.ring[(position + offset) % len])
            .find(|pid| self.state(*pid) == Some(ProcessState::Ready))
    }

    /// Switches to the next Ready process, if any. After the running process
    /// was terminated, the process that took over is loaded instead.
    pub fn schedule(&mut self, frame: &mut InterruptFrame) -> KernelResult<bool> {
        if self.reload_current {
            return self.switch(self.current, frame);
        }
        self.switch(self.next_ready(), frame)
    }

    /// Removes `pid` and hands back its stack for freeing. If it was
    /// running, the ring head (the newest process) takes over.
    pub fn terminate(&mut self, pid: Pid) -> KernelResult<KernelStack> {
        if pid == Pid::KERNEL {
            return Err(KernelError::ProtectedProcess(pid));
        }
        let pcb = self
            .processes
            .remove(&pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        self.ring.retain(|p| *p != pid);

        if self.current == Some(pid) {
            self.current = self.ring.first().copied();
            if let Some(head) = self.current {
                if let Some(head) = self.processes.get_mut(&head) {
                    head.state = ProcessState::Running;
                }
                self.reload_current = true;
            }
        }
        Ok(pcb.kernel_stack)
    }

    /// No room for another process.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn set_state(&mut self, pid: Pid, state: ProcessState) -> KernelResult<()> {
        let pcb = self
            .processes
            .get_mut(&pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        pcb.state = state;
        Ok(())
    }

    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        self.processes.get(&pid).map(|pcb| pcb.state)
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn get(&self, pid: Pid) -> Option<&PCB> {
        self.processes.get(&pid)
    }

    /// Processes in the ring, whatever their state.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Whether the next scheduling point must load the current process.
    pub fn reload_pending(&self) -> bool {
        self.reload_current
    }

    /// PCBs in ring order.
    pub fn iter(&self) -> impl Iterator<Item = &PCB> + '_ {
        self.ring.iter().filter_map(|pid| self.processes.get(pid))
    }
}
