//! Pebble: a small educational x86 (32-bit, uniprocessor, protected-mode)
//! operating-system kernel.
//!
//! This crate supplies THE CORE — task/thread lifecycle, a virtual-memory
//! manager with copy-on-write and on-demand backing, a preemptive scheduler
//! with spinlocks and counting semaphores, IDT/ISR plumbing, an ELF loader,
//! a page-fault dispatcher, and the fixed syscall ABI that ties them
//! together. The boot loader handoff, device drivers, and user-mode
//! programs are external collaborators; this crate only specifies the
//! narrow contracts where they touch the core.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

pub mod arch;
pub mod boot;
pub mod config;
pub mod console;
pub mod elf;
pub mod error;
pub mod fault;
pub mod keyboard;
pub mod mm;
pub mod ramdisk;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod timer;

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Generates a standalone Multiboot2-bootable `_start` for an integration
/// test binary under `tests/`: the same header `entry_point.rs` embeds, a
/// small dedicated stack, and a call into the `test_main` the
/// `#![reexport_test_harness_main]` attribute generates. Test binaries that
/// need no boot-info/frame-allocator/IDT bring-up (most of them — they
/// exercise in-process kernel data structures, not a live boot) invoke this
/// instead of duplicating the asm `entry_point.rs` carries.
#[macro_export]
macro_rules! multiboot_test_entry {
    () => {
        core::arch::global_asm!(
            r#"
.section .multiboot_header, "aw"
.align 8
multiboot_header_start:
    .long 0xe85250d6
    .long 0
    .long multiboot_header_end - multiboot_header_start
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))
    .word 0
    .word 0
    .long 8
multiboot_header_end:

.section .text
.global _start
_start:
    mov esp, offset test_stack_top
    call test_entry_main
1:
    hlt
    jmp 1b

.section .bss
.align 16
test_stack_bottom:
    .skip 16384
test_stack_top:
"#
        );

        /// # Safety
        /// Reached only from this macro's `_start` asm, once, at boot.
        #[unsafe(no_mangle)]
        extern "C" fn test_entry_main() -> ! {
            test_main();
            $crate::hlt_loop()
        }
    };
}

/// Test entry point for `cargo test` (unit tests linked into this lib).
#[cfg(test)]
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    test_main();
    hlt_loop()
}

/// Defines possible exit codes for QEMU's `isa-debug-exit` device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// A successful test run.
    Success = 0x10,
    /// A failed test run.
    Failure = 0x11,
}

/// Exits QEMU with `exit_code` by writing to the `isa-debug-exit` I/O port
/// configured in `.cargo/config.toml`'s runner and `tools/run_qemu.sh`.
pub fn exit_qemu(exit_code: QemuExitCode) {
    // SAFETY: `QEMU_EXIT_PORT` is the fixed `isa-debug-exit` port this
    // kernel's QEMU invocation always configures; writing to it under real
    // hardware (no such device present) would simply be a no-op I/O write.
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") QEMU_EXIT_PORT,
            in("al") exit_code as u8,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Halts the CPU in a loop with interrupts enabled, so pending interrupts
/// (the timer, keyboard) still fire. Used once `kernel_main` has nothing
/// left to do on this path (it never returns from `task::bootstrap` in
/// practice, but panics and test harnesses land here).
pub fn hlt_loop() -> ! {
    loop {
        // SAFETY: `hlt` is always safe to execute; it just suspends the CPU
        // until the next interrupt.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

/// Panic handler used when this crate is built under `cargo test`: reports
/// failure over the serial line and exits QEMU with a failure code rather
/// than looping forever, so the test runner doesn't hang.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);
    hlt_loop()
}

/// Panic handler for `cargo test` builds of this library.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

/// Custom test runner for `no_std` unit/integration testing: runs every
/// `#[test_case]` via the `Testable` trait below, then exits QEMU
/// successfully since reaching this point means none of them panicked.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

/// Wraps a `#[test_case]` fn so the runner can print its name before and
/// `[ok]` after it returns without panicking.
pub trait Testable {
    /// Runs the test, printing its name and result over the serial line.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}
