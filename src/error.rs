//! Kernel error taxonomy.
//!
//! Every fallible core operation reports through [`KernelError`]. How the
//! caller reacts is decided by [`KernelError::severity`]:
//!
//! | Severity      | Reaction                                         |
//! |---------------|--------------------------------------------------|
//! | `Fatal`       | report, disable interrupts, halt forever         |
//! | `Recoverable` | report a diagnostic and keep running             |
//! | `Silent`      | no effect and no output                          |

use thiserror::Error;

use crate::{
    interrupts::pic::Irq,
    memory::{
        frame_allocator::FrameIndex,
        page_fault::PageFaultInfo,
        VirtAddr,
    },
    processes::process::Pid,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Recoverable,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("out of memory: no free physical frame")]
    OutOfFrames,
    #[error("kernel heaps were already handed out")]
    HeapsTaken,
    #[error("kernel heap exhausted: requested {requested} bytes, {remaining} left")]
    HeapExhausted { requested: usize, remaining: usize },
    #[error("frame {0} is outside physical memory")]
    FrameOutOfRange(FrameIndex),
    #[error("frame {0} is not allocated")]
    FrameNotAllocated(FrameIndex),
    #[error("virtual address {0} is not mapped")]
    Unmapped(VirtAddr),
    #[error("address {0} is outside the kernel heap")]
    NotHeapAddress(VirtAddr),
    #[error("{0}")]
    PageFault(PageFaultInfo),
    #[error("double fault (error code {0:#x})")]
    DoubleFault(u32),
    #[error("unhandled interrupt {vector} (error code {error_code})")]
    UnhandledInterrupt { vector: u8, error_code: u32 },
    #[error("no IRQ line behind vector {0}")]
    InvalidIrq(u8),
    #[error("IRQ {0} is not a valid PIC line")]
    InvalidIrqLine(Irq),
    #[error("no process with pid {0}")]
    NoSuchProcess(Pid),
    #[error("process table is full")]
    ProcessTableFull,
    #[error("process {0} cannot be terminated")]
    ProtectedProcess(Pid),
}

impl KernelError {
    pub fn severity(&self) -> Severity {
        match self {
            KernelError::OutOfFrames
            | KernelError::HeapsTaken
            | KernelError::HeapExhausted { .. }
            | KernelError::PageFault(_)
            | KernelError::DoubleFault(_) => Severity::Fatal,
            KernelError::FrameNotAllocated(_) => Severity::Silent,
            KernelError::FrameOutOfRange(_)
            | KernelError::Unmapped(_)
            | KernelError::NotHeapAddress(_)
            | KernelError::UnhandledInterrupt { .. }
            | KernelError::InvalidIrq(_)
            | KernelError::InvalidIrqLine(_)
            | KernelError::NoSuchProcess(_)
            | KernelError::ProcessTableFull
            | KernelError::ProtectedProcess(_) => Severity::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
