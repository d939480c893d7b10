//! Programmable interval timer driver (A-ambient): configures the PIT to
//! fire IRQ0 once per tick and forwards each tick to the scheduler.

use crate::arch::isr::TrapFrame;
use crate::sched;

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
/// Ticks per second the scheduler sees. 100 Hz is the traditional Unix
/// jiffy rate and gives a comfortably coarse `TIME_QUANTUM_TICKS = 1`.
const TARGET_HZ: u32 = 100;
const PIT_CHANNEL_0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

fn outb(port: u16, value: u8) {
    // SAFETY: these are the PIT's documented command/data ports.
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }
}

/// Programs the PIT to `TARGET_HZ` and leaves IRQ0 to be enabled along with
/// the rest of the PIC when interrupts are turned on. Called once from
/// `task::bootstrap`, right before dropping into the idle loop.
pub fn start() {
    let divisor = (PIT_FREQUENCY_HZ / TARGET_HZ) as u16;
    outb(PIT_COMMAND, 0x36); // channel 0, lobyte/hibyte, mode 3 (square wave)
    outb(PIT_CHANNEL_0, (divisor & 0xFF) as u8);
    outb(PIT_CHANNEL_0, (divisor >> 8) as u8);
}

/// Timer ISR handler, called by `arch::isr::dispatch` for vector 32.
pub fn on_tick(_frame: &mut TrapFrame) {
    sched::timer_callback();
}
