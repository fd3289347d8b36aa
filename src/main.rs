#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use core::{
        arch::global_asm,
        sync::atomic::{AtomicU64, Ordering},
    };

    use kestrel::{
        hal::{x86::X86Hardware, Hardware},
        idle_loop,
        kernel::KERNEL,
        serial_println,
        timer::TimerInfo,
    };
    use log::{error, info};

    // Multiboot v1 header, a boot stack and a flat GDT: code 0x08, data 0x10.
    global_asm!(
        r#"
.set MULTIBOOT_MAGIC, 0x1BADB002
.set MULTIBOOT_FLAGS, 0x00000003

.section .multiboot, "a"
.balign 4
.long MULTIBOOT_MAGIC
.long MULTIBOOT_FLAGS
.long -(MULTIBOOT_MAGIC + MULTIBOOT_FLAGS)

.section .bss, "aw", @nobits
.balign 16
boot_stack_bottom:
.skip 16384
boot_stack_top:

.section .rodata
.balign 8
boot_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF
    .quad 0x00CF92000000FFFF
boot_gdt_pointer:
    .word boot_gdt_pointer - boot_gdt - 1
    .long boot_gdt

.section .text
.global _start
_start:
    cli
    mov esp, offset boot_stack_top
    mov esi, eax
    mov edi, ebx
    lgdt [boot_gdt_pointer]
    push 0x08
    push offset boot_reload_segments
    retf
boot_reload_segments:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax
    sub esp, 8
    push edi
    push esi
    call kmain
boot_hang:
    cli
    hlt
    jmp boot_hang
"#
    );

    static SECONDS: AtomicU64 = AtomicU64::new(0);

    fn heartbeat(info: &TimerInfo) {
        if info.frequency != 0 && info.ticks % u64::from(info.frequency) == 0 {
            SECONDS.fetch_add(1, Ordering::Relaxed);
        }
    }

    extern "C" fn demo_process() -> ! {
        let Some(kernel) = KERNEL.get() else {
            X86Hardware.halt_forever()
        };
        loop {
            kernel.sleep_ms(1000);
            info!(
                "demo: {} s since boot, uptime {} ms",
                SECONDS.load(Ordering::Relaxed),
                kernel.get_uptime_ms()
            );
        }
    }

    #[no_mangle]
    extern "C" fn kmain(magic: u32, info_addr: u32) -> ! {
        let kernel = kestrel::init::init(magic, info_addr);
        kernel.register_timer_callback(heartbeat);

        let memory = kernel.memory_info();
        info!(
            "memory: {} KiB total, {} KiB used, {} KiB free, heap {}/{} bytes",
            memory.total_bytes / 1024,
            memory.used_bytes / 1024,
            memory.free_bytes / 1024,
            memory.heap_used,
            memory.heap_size
        );

        if let Err(err) = kernel.process_create("demo", demo_process as usize as u32) {
            error!("could not start demo process: {}", err);
        }
        kernel.print_process_table();

        idle_loop(kernel)
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("Kernel panic: {}", info);
        X86Hardware.disable_interrupts();
        X86Hardware.halt_forever()
    }
}

/// Boots the core on a simulated machine and lets it run for a moment.
#[cfg(not(target_os = "none"))]
fn main() {
    use kestrel::{Kernel, KernelConfig};
    use log::info;

    kestrel::logging::init();

    let kernel = Kernel::simulated(KernelConfig::default());
    if let Err(err) = kernel.init() {
        kernel.fatal(err);
    }
    kernel.enable_interrupts();

    for (name, entry) in [("worker-a", 0x0010_0000), ("worker-b", 0x0010_1000)] {
        if let Err(err) = kernel.process_create(name, entry) {
            info!("could not create {}: {}", name, err);
        }
    }

    kernel.hw().set_timer_running(true);
    kernel.sleep_ms(250);
    kernel.hw().set_timer_running(false);

    let timer = kernel.get_timer_info();
    let memory = kernel.memory_info();
    info!(
        "{} ticks at {} Hz, uptime {} ms, current process {:?}",
        timer.ticks,
        timer.frequency,
        timer.uptime_ms,
        kernel.process_get_current()
    );
    info!(
        "memory: {} KiB used of {} KiB, heap {}/{} bytes",
        memory.used_bytes / 1024,
        memory.total_bytes / 1024,
        memory.heap_used,
        memory.heap_size
    );
    kernel.print_process_table();
}
