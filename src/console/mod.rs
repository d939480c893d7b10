//! Console driver module.
//!
//! Exposes the narrow contract the rest of the kernel is allowed to depend
//! on: a byte writer, a current color setting, and the VGA hardware cursor
//! position. Everything else (scrolling, glyph layout) stays private to
//! this module.

use core::fmt::Write as _;

mod buffer;
mod colors;
mod constants;
#[macro_use]
pub mod macros;
mod writer;

pub use colors::Color;

use constants::{BUFFER_HEIGHT, BUFFER_WIDTH};
use writer::WRITER;

/// CRTC index/data port pair used to read and move the hardware cursor.
const CRTC_INDEX_PORT: u16 = 0x3D4;
const CRTC_DATA_PORT: u16 = 0x3D5;
const CRTC_CURSOR_LOCATION_HIGH: u8 = 0x0E;
const CRTC_CURSOR_LOCATION_LOW: u8 = 0x0F;

/// Runs `f` with maskable interrupts disabled, restoring the previous flag on return.
pub fn without_interrupts<F: FnOnce() -> R, R>(f: F) -> R {
    // SAFETY: single read-modify-write of EFLAGS around a bounded closure; no
    // control-flow escapes the closure before interrupts are restored.
    let was_enabled = unsafe {
        let flags: u32;
        core::arch::asm!("pushfd; pop {}", out(reg) flags, options(nomem, preserves_flags));
        flags & (1 << 9) != 0
    };
    if was_enabled {
        // SAFETY: CLI is always safe on a uniprocessor kernel.
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
    }
    let result = f();
    if was_enabled {
        // SAFETY: re-enabling interrupts we ourselves disabled above.
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
    result
}

/// Writes a byte slice to the console, substituting non-printable bytes.
pub fn write_bytes(bytes: &[u8]) {
    without_interrupts(|| {
        let mut writer = WRITER.lock();
        for &byte in bytes {
            writer.write_byte_checked(byte);
        }
    });
}

/// Sets the foreground/background color used for subsequent writes.
pub fn set_color(foreground: Color, background: Color) {
    without_interrupts(|| {
        WRITER.lock().color_code = colors::ColorCode::new(foreground, background);
    });
}

/// Reads the VGA hardware cursor position as `(row, col)`.
#[must_use]
pub fn cursor_pos() -> (usize, usize) {
    without_interrupts(|| {
        // SAFETY: 0x3D4/0x3D5 are the standard CRTC index/data ports, present
        // on every VGA-compatible text-mode adapter.
        let pos = unsafe {
            outb(CRTC_INDEX_PORT, CRTC_CURSOR_LOCATION_HIGH);
            let high = inb(CRTC_DATA_PORT);
            outb(CRTC_INDEX_PORT, CRTC_CURSOR_LOCATION_LOW);
            let low = inb(CRTC_DATA_PORT);
            (u16::from(high) << 8) | u16::from(low)
        };
        let pos = usize::from(pos);
        (pos / BUFFER_WIDTH, pos % BUFFER_WIDTH)
    })
}

/// Moves the VGA hardware cursor to `(row, col)`, clamped to the buffer geometry.
pub fn set_cursor_pos(row: usize, col: usize) {
    let row = row.min(BUFFER_HEIGHT - 1);
    let col = col.min(BUFFER_WIDTH - 1);
    #[expect(
        clippy::cast_possible_truncation,
        reason = "row*BUFFER_WIDTH+col always fits in a u16 for an 80x25 text buffer"
    )]
    let pos = (row * BUFFER_WIDTH + col) as u16;
    without_interrupts(|| {
        // SAFETY: same CRTC ports as `cursor_pos`, values are pre-clamped above.
        unsafe {
            outb(CRTC_INDEX_PORT, CRTC_CURSOR_LOCATION_HIGH);
            outb(CRTC_DATA_PORT, (pos >> 8) as u8);
            outb(CRTC_INDEX_PORT, CRTC_CURSOR_LOCATION_LOW);
            outb(CRTC_DATA_PORT, (pos & 0xFF) as u8);
        }
    });
}

/// Reads a single byte from an I/O port.
unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    // SAFETY: caller guarantees `port` is a valid I/O port for this operation.
    unsafe { core::arch::asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags)) };
    value
}

/// Writes a single byte to an I/O port.
unsafe fn outb(port: u16, value: u8) {
    // SAFETY: caller guarantees `port` is a valid I/O port for this operation.
    unsafe { core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
}

#[expect(unused_imports, reason = "Used by #[test_case] functions below.")]
use core::fmt::Write;

/// Test that printing many lines will not panic.
#[test_case]
fn test_when_printing_many_lines_should_not_panic() {
    for _ in 0..200 {
        println!("test many print output.");
    }
}

/// Test that a line will be printed on the screen.
/// # Panics
/// Fail if the line is not printed on the screen.
#[test_case]
fn test_when_printing_a_line_should_appear_in_vga_buffer() {
    let line = "Some line that fits on a single line";

    without_interrupts(|| {
        let mut writer = WRITER.lock();

        #[expect(
            clippy::uninlined_format_args,
            reason = "This is a test, we want to use format_args!"
        )]
        writeln!(writer, "\n{}", line).expect("Failed to write line to vga buffer.");
        for (i, c) in line.chars().enumerate() {
            let screen_char = writer.buffer.chars[BUFFER_HEIGHT - 2][i].read();
            assert_eq!(
                char::from(screen_char.ascii_character),
                c,
                "Character mismatch at position {i}.",
            );
        }
    });
}
