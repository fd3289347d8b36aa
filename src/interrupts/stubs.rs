//! Per-vector entry stubs and the common interrupt path.
//!
//! Each stub pushes a dummy error code when the CPU does not supply one,
//! then the vector number, and jumps to `isr_common`. The common path saves
//! the general registers with `pusha`, hands the frame to
//! [`kernel_interrupt_entry`] on a 16-byte aligned stack, and resumes on the stack named by the frame's
//! `esp` slot by building an `iret` frame there.

use core::{arch::global_asm, ptr::addr_of};

use crate::{
    constants::idt::SYSCALL_VECTOR,
    interrupts::frame::InterruptFrame,
    kernel::KERNEL,
};

/// Vectors 0-47 have stubs in `isr_stub_table`.
const TABLE_STUBS: usize = 48;

global_asm!(
    r#"
.altmacro

.macro isr_stub n
isr_stub_\n:
    .if (\n == 8) || (\n == 10) || (\n == 11) || (\n == 12) || (\n == 13) || (\n == 14) || (\n == 17) || (\n == 21) || (\n == 29) || (\n == 30)
    .else
    push 0
    .endif
    push \n
    jmp isr_common
.endm

.macro isr_stub_entry n
    .long isr_stub_\n
.endm

.section .text
.set i, 0
.rept 48
    isr_stub %i
    .set i, i + 1
.endr
isr_stub 128

isr_common:
    pusha
    add dword ptr [esp + 12], 20
    cld
    mov ebx, esp
    and esp, -16
    sub esp, 12
    push ebx
    call kernel_interrupt_entry
    mov esp, ebx

    mov eax, [esp + 12]
    sub eax, 12
    mov ecx, [esp + 40]
    mov [eax], ecx
    mov ecx, [esp + 44]
    mov [eax + 4], ecx
    mov ecx, [esp + 48]
    mov [eax + 8], ecx
    mov [esp + 12], eax

    popa
    mov esp, [esp - 20]
    iretd

.section .rodata
.balign 4
.global isr_stub_table
isr_stub_table:
.set i, 0
.rept 48
    isr_stub_entry %i
    .set i, i + 1
.endr

.global isr_syscall_stub
isr_syscall_stub:
    .long isr_stub_128

.noaltmacro
.section .text
"#
);

extern "C" {
    static isr_stub_table: [u32; TABLE_STUBS];
    static isr_syscall_stub: u32;
}

/// Address of the entry stub for `vector`, if one exists.
pub fn stub_address(vector: u8) -> Option<u32> {
    // Both tables are immutable data emitted by the assembler above.
    let table = unsafe { &*addr_of!(isr_stub_table) };
    match vector {
        SYSCALL_VECTOR => Some(unsafe { *addr_of!(isr_syscall_stub) }),
        v => table.get(usize::from(v)).copied(),
    }
}

/// Called by `isr_common` with interrupts disabled.
#[no_mangle]
extern "C" fn kernel_interrupt_entry(frame: *mut InterruptFrame) {
    // The frame lives on the interrupted stack for the duration of the call.
    let frame = unsafe { &mut *frame };
    if let Some(kernel) = KERNEL.get() {
        kernel.dispatch(frame);
    }
}
