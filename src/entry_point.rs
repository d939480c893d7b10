//! Kernel entry point: the Multiboot2 header, the tiny protected-mode
//! `_start` stub that sets up a stack and calls into Rust, and the
//! top-level `kernel_main` that brings up every subsystem in dependency
//! order: heap, then boot-info parsing, then the frame allocator, the
//! RAM disk, the trap/interrupt tables, and finally the first task.

#![feature(custom_test_frameworks)]
#![test_runner(pebble_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![no_std]
#![no_main]

use core::arch::global_asm;
use core::panic::PanicInfo;

use pebble_kernel::config::{PAGE_SIZE, USER_MEM_START};
use pebble_kernel::{arch, boot, mm, ramdisk, task};

/// The Multiboot2 header GRUB's bootloader scans for in the first 32 KiB of
/// the image (placed in its own linker-script section, `.multiboot_header`,
/// right at the start of the load image), followed by `_start`: sets up a
/// small kernel stack, preserves the Multiboot2 magic (`EAX`) and boot-info
/// pointer (`EBX`) as `kernel_main`'s two cdecl arguments, and calls in.
/// The header is embedded directly via `global_asm!` rather than assembled
/// from a separate `.s` file, so there's no extra build step before linking.
global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8
multiboot_header_start:
    .long 0xe85250d6                                      // magic
    .long 0                                               // architecture: i386
    .long multiboot_header_end - multiboot_header_start   // header length
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))
    // end tag
    .word 0
    .word 0
    .long 8
multiboot_header_end:

.section .text
.global _start
.extern kernel_main
_start:
    mov esp, offset boot_stack_top
    push ebx
    push eax
    call kernel_main
    // kernel_main never returns; hlt forever if it somehow does.
1:
    hlt
    jmp 1b

.section .bss
.align 16
boot_stack_bottom:
    .skip 16384
boot_stack_top:
"#
);

const KERNEL_WINDOW_FRAMES: u32 = USER_MEM_START / PAGE_SIZE as u32;

/// Brings up every subsystem in dependency order: the
/// kernel heap first (everything below allocates), then the Multiboot2
/// boot record, the frame allocator, the RAM disk, the trap/IDT plumbing,
/// and finally `task::bootstrap`, which builds the idle/init tasks, turns
/// on paging, starts the timer, and never returns.
///
/// # Safety
/// Called exactly once, by `_start`, with the exact `magic`/`info_addr`
/// values the Multiboot2-compliant loader placed in `EAX`/`EBX`.
#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
    // SAFETY: must run before anything else allocates; the heap range is
    // reserved, unmapped-by-anyone-else memory per `mm::heap::init`'s contract.
    unsafe { mm::heap::init() };

    // SAFETY: `magic`/`info_addr` come straight from `_start`'s arguments,
    // which came straight from the bootloader's `EAX`/`EBX`, per contract.
    let boot_info = unsafe { boot::parse(magic, info_addr) };

    mm::frame_allocator::init(&boot_info.usable_regions, KERNEL_WINDOW_FRAMES);
    ramdisk::init(boot_info.modules);

    // SAFETY: runs once, before interrupts are enabled (enabled later,
    // inside `task::bootstrap`, only after every gate below is installed).
    unsafe { arch::init() };

    #[cfg(test)]
    test_main();

    task::bootstrap("hello")
}

/// Panic handler for the non-test kernel binary: reports the panic over
/// the serial line (visible even if the VGA console is in a bad state) and
/// halts. Kernel-mode invariant violations are fatal: there is no recovery
/// path, so the only thing left to do is report and stop.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pebble_kernel::serial_println!("KERNEL PANIC: {info}");
    pebble_kernel::println!("KERNEL PANIC: {info}");
    pebble_kernel::hlt_loop()
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pebble_kernel::test_panic_handler(info)
}
