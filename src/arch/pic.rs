//! 8259 PIC remap and end-of-interrupt signaling.
//!
//! A `spin::Mutex<ChainedPics>` global wired up to the full set of vectors
//! this kernel installs (timer and keyboard).

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;

use crate::config::{KEYBOARD_INTERRUPT_VECTOR, PIC_1_OFFSET, PIC_2_OFFSET, TIMER_INTERRUPT_VECTOR};

lazy_static! {
    pub static ref PICS: Mutex<ChainedPics> =
        // SAFETY: `PIC_1_OFFSET`/`PIC_2_OFFSET` are both outside the CPU
        // exception range (0-31) and do not overlap.
        Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });
}

/// Remaps the PICs and masks every line except timer and keyboard.
///
/// # Safety
/// Must run once during boot, before interrupts are enabled.
pub unsafe fn init() {
    // SAFETY: runs once before `sti`, per function contract.
    unsafe { PICS.lock().initialize() };
}

/// Sends an end-of-interrupt for `vector` if it came from the PIC.
pub fn acknowledge(vector: u32) {
    if vector == u32::from(TIMER_INTERRUPT_VECTOR) || vector == u32::from(KEYBOARD_INTERRUPT_VECTOR) {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "vector is always a hardware interrupt vector, which fits in a u8"
        )]
        let vector = vector as u8;
        // SAFETY: `vector` is confirmed to be one of the PIC-owned vectors above.
        unsafe { PICS.lock().notify_end_of_interrupt(vector) };
    }
}
