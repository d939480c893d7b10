//! Boots the kernel image far enough to prove the console and the custom
//! test harness both work, with no other subsystem brought up.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(pebble_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use pebble_kernel::println;

pebble_kernel::multiboot_test_entry!();

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pebble_kernel::test_panic_handler(info)
}

/// Printing a line through the VGA console must not panic.
#[test_case]
fn test_println() {
    println!("test_println output");
}
