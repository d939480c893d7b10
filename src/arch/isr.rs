//! Common ISR save/restore stub and per-vector trampolines.
//!
//! Every fault, the timer IRQ, the keyboard IRQ, and the syscall trap enter
//! through one of the small per-vector stubs below, which push a uniform
//! `(error_code, vector)` pair and fall into the shared assembly stub. The
//! shared stub saves the full register set in a canonical `TrapFrame`
//! layout, loads the kernel data segments, and calls `dispatch` with a
//! pointer to that frame — matching the "uniform `(packet, idx) -> status`
//! function" the component contract asks for, just built as one dispatch
//! function over `TrapFrame` instead of per-entry trampolines patched at
//! runtime.

use core::arch::naked_asm;

use crate::arch::gdt::KERNEL_DATA_SELECTOR;
use crate::config::{KEYBOARD_INTERRUPT_VECTOR, SYSCALL_INTERRUPT_VECTOR, TIMER_INTERRUPT_VECTOR};
use crate::{fault, syscall};

/// Register/segment state saved by the common stub, plus the
/// hardware-pushed fault frame. Field order matches push order so the
/// struct can be read straight off the kernel stack.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Present only when the trap crossed a privilege level (ring 3 -> 0).
    pub user_esp: u32,
    pub user_ss: u32,
}

/// Dispatches a fully-saved trap. Called by the shared assembly stub; never
/// called directly from Rust.
extern "C" fn dispatch(frame: *mut TrapFrame) {
    // SAFETY: the assembly stub always passes a pointer to a live `TrapFrame`
    // built on the current kernel stack for the duration of this call.
    let frame = unsafe { &mut *frame };
    match frame.vector {
        14 => fault::handle_page_fault(frame),
        v if v < 32 => fault::handle_other_fault(frame),
        v if v == u32::from(TIMER_INTERRUPT_VECTOR) => crate::timer::on_tick(frame),
        v if v == u32::from(KEYBOARD_INTERRUPT_VECTOR) => crate::keyboard::on_irq(),
        v if v == u32::from(SYSCALL_INTERRUPT_VECTOR) => syscall::dispatch(frame),
        _ => fault::handle_other_fault(frame),
    }
    crate::arch::pic::acknowledge(frame.vector);
}

/// Shared prologue pushed after the vector-specific stub has pushed
/// `error_code` and `vector`: save segments and GPRs, load kernel data
/// segments, pass `esp` (now pointing at the `TrapFrame`) to `dispatch`.
macro_rules! common_prologue {
    () => {
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, {kdata:x}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push esp",
        "call {dispatch}",
        "add esp, 4",
        "jmp {tail}",
    };
}

/// The restore half of every trap return: pop segments and GPRs saved by
/// `common_prologue!`, skip the `(vector, error_code)` pair, `iretd`.
///
/// Shared rather than duplicated per ISR stub so that `task::fork`'s child
/// stack can also land here directly — "returning from a syscall" and
/// "being scheduled in for the first time as a forked child" are the same
/// tail.
///
/// # Safety
/// Reachable only by falling through from `common_prologue!` or by a
/// `context_switch` `ret` into this symbol with a `TrapFrame` already laid
/// out on the stack at the point of entry; never called directly from Rust.
#[unsafe(naked)]
pub unsafe extern "C" fn trap_return_tail() {
    naked_asm!(
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        "add esp, 8",
        "iretd",
    );
}

/// Generates a `#[naked]` entry stub for `$vector`. `$has_err` selects
/// whether the CPU already pushed an error code (faults 8, 10-14, 17) or the
/// stub must push a dummy zero to keep the frame layout uniform.
macro_rules! isr_stub {
    ($name:ident, $vector:literal, has_err) => {
        /// # Safety
        /// Installed as the target of an IDT gate; never called from Rust.
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                common_prologue!(),
                vector = const $vector,
                kdata = const KERNEL_DATA_SELECTOR,
                dispatch = sym dispatch,
                tail = sym trap_return_tail,
            );
        }
    };
    ($name:ident, $vector:literal) => {
        /// # Safety
        /// Installed as the target of an IDT gate; never called from Rust.
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                common_prologue!(),
                vector = const $vector,
                kdata = const KERNEL_DATA_SELECTOR,
                dispatch = sym dispatch,
                tail = sym trap_return_tail,
            );
        }
    };
}

isr_stub!(isr_divide_by_zero, 0);
isr_stub!(isr_debug, 1);
isr_stub!(isr_nmi, 2);
isr_stub!(isr_breakpoint, 3);
isr_stub!(isr_overflow, 4);
isr_stub!(isr_bound_range, 5);
isr_stub!(isr_invalid_opcode, 6);
isr_stub!(isr_device_not_available, 7);
// vector 8, double fault, is deliberately left without an installed gate.
isr_stub!(isr_coprocessor_segment_overrun, 9);
isr_stub!(isr_invalid_tss, 10, has_err);
isr_stub!(isr_segment_not_present, 11, has_err);
isr_stub!(isr_stack_segment_fault, 12, has_err);
isr_stub!(isr_general_protection, 13, has_err);
isr_stub!(isr_page_fault, 14, has_err);
isr_stub!(isr_x87_fp, 16);
isr_stub!(isr_alignment_check, 17, has_err);
isr_stub!(isr_machine_check, 18);
isr_stub!(isr_simd_fp, 19);
isr_stub!(isr_timer, 32);
isr_stub!(isr_keyboard, 33);
isr_stub!(isr_syscall, 0x80);
