//! Verifies that a panicking test case is reported as `[ok]`, not as a
//! hang or a false pass: this file's own `test_runner` treats a test case
//! that *returns* as a failure, and the panic handler is what signals success.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use pebble_kernel::{exit_qemu, serial_println, QemuExitCode};

pebble_kernel::multiboot_test_entry!();

/// Unlike `pebble_kernel::test_runner`, a test case reaching its own return
/// here means it did NOT panic as expected, so that is the failure case.
pub fn test_runner(tests: &[&dyn Fn()]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test();
        serial_println!("[test did not panic]");
        exit_qemu(QemuExitCode::Failure);
    }
    exit_qemu(QemuExitCode::Success);
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);
    pebble_kernel::hlt_loop()
}

/// # Panics
/// Always — this test case exists to prove a panic is caught correctly.
#[test_case]
fn should_fail() {
    serial_println!("should_panic::should_fail...\t");
    assert_eq!(0, 1, "This test should panic.");
}
