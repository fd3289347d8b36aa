use core::fmt;

use arrayvec::ArrayString;

use crate::{
    constants::processes::{KERNEL_STACK_SIZE, PROCESS_NAME_LEN},
    memory::VirtAddr,
    processes::registers::Context,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// The boot context. Never terminated.
    pub const KERNEL: Pid = Pid(0);

    pub const fn new(pid: u32) -> Self {
        Pid(pid)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    /// Reserved for I/O waits; nothing moves processes in or out of it yet.
    Blocked,
    Terminated,
}

/// A process's private kernel stack, carved from the kernel heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    pub base: VirtAddr,
    pub size: u32,
}

impl KernelStack {
    pub fn new(base: VirtAddr) -> Self {
        KernelStack {
            base,
            size: KERNEL_STACK_SIZE,
        }
    }

    /// Initial stack pointer; the stack grows down from here.
    pub fn top(&self) -> u32 {
        self.base.as_u32() + self.size
    }
}

pub type ProcessName = ArrayString<PROCESS_NAME_LEN>;

/// Process control block.
#[derive(Debug, Clone, Copy)]
pub struct PCB {
    pub pid: Pid,
    pub name: ProcessName,
    pub state: ProcessState,
    pub context: Context,
    pub kernel_stack: KernelStack,
}

impl PCB {
    pub fn new(pid: Pid, name: &str, context: Context, kernel_stack: KernelStack) -> Self {
        PCB {
            pid,
            name: truncate_name(name),
            state: ProcessState::Ready,
            context,
            kernel_stack,
        }
    }
}

/// Keeps at most `PROCESS_NAME_LEN - 1` bytes, cut on a char boundary.
fn truncate_name(name: &str) -> ProcessName {
    let mut end = name.len().min(PROCESS_NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = ProcessName::new();
    truncated.push_str(&name[..end]);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_are_truncated() {
        let name = truncate_name("a-process-name-that-is-much-too-long");
        assert_eq!(name.len(), 31);
        assert_eq!(&name[..], "a-process-name-that-is-much-too");
    }

    #[test]
    fn truncation_respects_utf8() {
        let name = truncate_name("ééééééééééééééééé");
        assert_eq!(name.len(), 30);
    }

    #[test]
    fn stack_top_is_base_plus_size() {
        let stack = KernelStack::new(VirtAddr::new(0x0020_0000));
        assert_eq!(stack.top(), 0x0020_1000);
    }
}
