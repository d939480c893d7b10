//! Interrupt descriptor table.
//!
//! Two gate kinds: interrupt gates (IRQs disabled on entry — timer,
//! keyboard, syscall) and trap gates (IRQs stay enabled on entry — CPU
//! faults). The flag-bit difference doesn't change whether a fault handler
//! can be preempted; that's still governed by whatever locks it takes.

use core::mem::size_of;

use lazy_static::lazy_static;

use crate::arch::gdt::KERNEL_CODE_SELECTOR;

const GATE_TYPE_INTERRUPT32: u8 = 0xE;
const GATE_TYPE_TRAP32: u8 = 0xF;
const PRESENT: u8 = 0x80;
const DPL_RING0: u8 = 0x00;
const DPL_RING3: u8 = 0x60;

/// One 8-byte IDT gate descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Gate {
    offset_low: u16,
    selector: u16,
    _zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl Gate {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            _zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, gate_type: u8, dpl: u8) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            _zero: 0,
            type_attr: PRESENT | dpl | gate_type,
            offset_high: (handler >> 16) as u16,
        }
    }

    /// IRQs disabled for the duration of the handler (timer, keyboard, syscall trap).
    pub fn interrupt_gate(handler: u32, dpl: u8) -> Self {
        Self::new(handler, GATE_TYPE_INTERRUPT32, dpl)
    }

    /// IRQs remain enabled (CPU faults).
    pub fn trap_gate(handler: u32, dpl: u8) -> Self {
        Self::new(handler, GATE_TYPE_TRAP32, dpl)
    }
}

pub const DPL0: u8 = DPL_RING0;
pub const DPL3: u8 = DPL_RING3;

pub struct Idt(pub [Gate; 256]);

lazy_static! {
    pub static ref IDT: spin::Mutex<Idt> = spin::Mutex::new(Idt([Gate::missing(); 256]));
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Loads the IDT built by `crate::arch::isr::install`.
///
/// # Safety
/// Must only be called after every gate the kernel relies on has been
/// installed; interrupts must stay disabled until `init` returns.
pub unsafe fn load() {
    let idt = IDT.lock();
    let ptr = DescriptorTablePointer {
        limit: (size_of::<Idt>() - 1) as u16,
        base: core::ptr::from_ref(&idt.0) as u32,
    };
    // SAFETY: `ptr` points at the `'static` table behind the lock; `lidt`
    // only installs the table, it does not dereference it.
    unsafe {
        core::arch::asm!("lidt [{0}]", in(reg) &ptr, options(readonly, nostack, preserves_flags));
    }
}
