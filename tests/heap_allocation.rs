//! Tests for heap allocation in a `no_std` environment using the kernel's
//! own global allocator.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(pebble_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::arch::global_asm;
use core::panic::PanicInfo;

use pebble_kernel::mm::heap::{self, HEAP_SIZE};

global_asm!(
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
/// Reached only from this file's `_start` asm, once, at boot. The kernel
/// window is identity-mapped by GRUB's initial page tables before paging is
/// enabled, so the heap range is already usable without mapping it first.
#[unsafe(no_mangle)]
extern "C" fn test_entry_main() -> ! {
    // SAFETY: first and only call, before any alloc-dependent code runs.
    unsafe { heap::init() };
    test_main();
    pebble_kernel::hlt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    pebble_kernel::test_panic_handler(info)
}

#[test_case]
fn when_creating_simple_allocation_then_memory_is_allocated() {
    let heap_value_1 = Box::new(41);
    let heap_value_2 = Box::new(42);

    assert_eq!(*heap_value_1, 41);
    assert_eq!(*heap_value_2, 42);
}

#[test_case]
fn when_creating_large_vec_then_memory_is_allocated() {
    let mut vec = Vec::new();
    for i in 0..1000 {
        vec.push(i);
    }
    assert_eq!(vec.iter().sum::<u64>(), (0..1000).sum());
}

#[test_case]
fn when_many_boxes_are_allocated_then_memory_is_allocated() {
    for i in 0..HEAP_SIZE {
        let x = Box::new(i);
        assert_eq!(*x, i);
    }
}
