//! Architecture-specific plumbing: GDT/TSS, IDT, PIC, and the common ISR
//! stub.

pub mod gdt;
pub mod idt;
pub mod isr;
pub mod pic;

use idt::{Gate, DPL0, DPL3, IDT};

/// Installs every gate this kernel wires: 20 CPU faults minus the
/// deliberately-absent double fault, the timer and keyboard IRQs, and the
/// syscall trap. Loads the IDT and unmasks the PIC lines we use.
///
/// # Safety
/// Must run once during boot, after the GDT/TSS are installed and before
/// interrupts are enabled.
pub unsafe fn init() {
    // SAFETY: called once during boot per function contract; GDT is already
    // loaded so `KERNEL_CODE_SELECTOR` is valid.
    unsafe { gdt::init() };

    {
        let mut idt = IDT.lock();
        macro_rules! fault {
            ($vector:literal, $handler:path) => {
                idt.0[$vector] = Gate::trap_gate($handler as usize as u32, DPL0);
            };
        }
        fault!(0, isr::isr_divide_by_zero);
        fault!(1, isr::isr_debug);
        fault!(2, isr::isr_nmi);
        fault!(3, isr::isr_breakpoint);
        fault!(4, isr::isr_overflow);
        fault!(5, isr::isr_bound_range);
        fault!(6, isr::isr_invalid_opcode);
        fault!(7, isr::isr_device_not_available);
        // 8: double fault — intentionally left without a gate; a second
        // fault before the first is handled triple-faults the machine,
        // which is the loudest possible signal during development.
        fault!(9, isr::isr_coprocessor_segment_overrun);
        fault!(10, isr::isr_invalid_tss);
        fault!(11, isr::isr_segment_not_present);
        fault!(12, isr::isr_stack_segment_fault);
        fault!(13, isr::isr_general_protection);
        fault!(14, isr::isr_page_fault);
        fault!(16, isr::isr_x87_fp);
        fault!(17, isr::isr_alignment_check);
        fault!(18, isr::isr_machine_check);
        fault!(19, isr::isr_simd_fp);

        idt.0[32] = Gate::interrupt_gate(isr::isr_timer as usize as u32, DPL0);
        idt.0[33] = Gate::interrupt_gate(isr::isr_keyboard as usize as u32, DPL0);
        idt.0[0x80] = Gate::interrupt_gate(isr::isr_syscall as usize as u32, DPL3);
    }

    // SAFETY: the gates above are all installed; loading now is safe.
    unsafe { idt::load() };
    // SAFETY: called once during boot, before `sti`.
    unsafe { pic::init() };
}
