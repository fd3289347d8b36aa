use crate::constants::{idt::KERNEL_CODE_SELECTOR, processes::INITIAL_EFLAGS};

/// Register state saved by the common interrupt stub.
///
/// Field order mirrors the stack: `pusha` output first, then the vector and
/// error code pushed by the per-vector stub, then what the CPU pushed.
/// `esp` holds the interrupted stack pointer; the stub resumes on whatever
/// stack `esp` names when the handler returns, which is how a context
/// switch takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

impl InterruptFrame {
    /// A frame as if `vector` had interrupted kernel code.
    pub fn new(vector: u8, error_code: u32) -> Self {
        InterruptFrame {
            vector: vector.into(),
            error_code,
            cs: KERNEL_CODE_SELECTOR.into(),
            eflags: INITIAL_EFLAGS,
            ..Default::default()
        }
    }

    pub fn vector(&self) -> u8 {
        self.vector as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_the_stub() {
        assert_eq!(offset_of!(InterruptFrame, esp), 12);
        assert_eq!(offset_of!(InterruptFrame, vector), 32);
        assert_eq!(offset_of!(InterruptFrame, eip), 40);
        assert_eq!(offset_of!(InterruptFrame, cs), 44);
        assert_eq!(offset_of!(InterruptFrame, eflags), 48);
        assert_eq!(size_of::<InterruptFrame>(), 52);
    }
}
