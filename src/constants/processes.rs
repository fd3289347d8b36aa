pub const MAX_PROCESSES: usize = 64;
pub const KERNEL_STACK_SIZE: u32 = 4096;
pub const PROCESS_NAME_LEN: usize = 32;

/// IF set plus the always-one bit 1.
pub const INITIAL_EFLAGS: u32 = 0x202;
