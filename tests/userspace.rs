//! Checks the user-mode memory layout and syscall trap vector the ELF
//! loader and the GDT/IDT setup both depend on agreeing on.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(pebble_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use pebble_kernel::config::{
    PAGE_SIZE, SYSCALL_INTERRUPT_VECTOR, USER_MEM_START, USER_STACK_TOP,
};
use pebble_kernel::serial_println;

pebble_kernel::multiboot_test_entry!();

/// The user window, the kernel window, and the downward-growing user stack
/// must all be page-aligned and ordered correctly, or the VMM's range
/// bookkeeping (`mm::address_space`) and the ELF loader would disagree
/// about what's available to a freshly exec'd task.
#[test_case]
fn test_user_memory_layout_is_consistent() {
    assert_eq!(
        USER_MEM_START % PAGE_SIZE as u32,
        0,
        "USER_MEM_START must be page-aligned.",
    );

    assert_eq!(
        USER_STACK_TOP % PAGE_SIZE as u32,
        0,
        "USER_STACK_TOP must be page-aligned.",
    );

    assert!(
        USER_MEM_START < USER_STACK_TOP,
        "the user window must sit below the top of the downward-growing stack.",
    );

    serial_println!("[ok] user memory layout is consistent");
}

/// The `int 0x80` gate `arch::idt` installs as an interrupt (not trap) gate
/// must match the vector user-mode code traps through (see
/// `user_programs/hello`).
#[test_case]
fn test_syscall_interrupt_vector_is_0x80() {
    assert_eq!(
        SYSCALL_INTERRUPT_VECTOR, 0x80,
        "syscall interrupt vector must be 0x80.",
    );
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pebble_kernel::test_panic_handler(info)
}
