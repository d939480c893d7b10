//! Keyboard driver: decodes IRQ1 scancodes via `pc-keyboard` into
//! characters, buffered in a small ring so `getchar`/`readline` can block a
//! thread until input arrives instead of busy-polling the PIC.

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;

use crate::sync::Semaphore;

const KEYBOARD_DATA_PORT: u16 = 0x60;
const RING_CAPACITY: usize = 256;

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> =
        Mutex::new(Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore));
}

struct Ring {
    buf: [u8; RING_CAPACITY],
    head: usize,
    tail: usize,
    len: usize,
}

impl Ring {
    const fn new() -> Self {
        Self {
            buf: [0; RING_CAPACITY],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.len == RING_CAPACITY {
            // Drop the oldest byte rather than block the IRQ handler.
            self.head = (self.head + 1) % RING_CAPACITY;
            self.len -= 1;
        }
        self.buf[self.tail] = byte;
        self.tail = (self.tail + 1) % RING_CAPACITY;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % RING_CAPACITY;
        self.len -= 1;
        Some(byte)
    }
}

static RING: Mutex<Ring> = Mutex::new(Ring::new());
/// Counts bytes currently sitting in `RING`; `getchar` blocks on this rather
/// than spinning, per the same FIFO-wakeup discipline `sync::Semaphore`
/// gives every other blocking call in the kernel.
static AVAILABLE: Semaphore = Semaphore::new(0);

fn inb(port: u16) -> u8 {
    let value: u8;
    // SAFETY: reads the keyboard controller's documented data port.
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Keyboard IRQ handler, called by `arch::isr::dispatch` for vector 33.
pub fn on_irq() {
    let scancode = inb(KEYBOARD_DATA_PORT);
    let mut keyboard = KEYBOARD.lock();
    if let Ok(Some(event)) = keyboard.add_byte(scancode) {
        if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(event) {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).as_bytes() {
                RING.lock().push(*byte);
                AVAILABLE.signal();
            }
        }
    }
}

/// `getchar`: blocks until one byte of decoded keyboard input is
/// available, then returns it.
#[must_use]
pub fn getchar() -> u8 {
    AVAILABLE.wait();
    RING.lock().pop().expect("signaled exactly once per buffered byte")
}

/// Unlinks `thread` from the keyboard's waiter queue if it is currently
/// blocked in `getchar`. Used by `task::task_vanish`'s force-kill walk.
pub fn force_remove(thread: core::ptr::NonNull<crate::sched::Tcb>) {
    AVAILABLE.force_remove(thread);
}

/// `readline`: fills `buf` with bytes up to and including the next
/// `\n`, or until `buf` is full, blocking on each byte via `getchar`.
/// Returns the number of bytes written.
pub fn readline(buf: &mut [u8]) -> usize {
    let mut written = 0;
    while written < buf.len() {
        let byte = getchar();
        buf[written] = byte;
        written += 1;
        if byte == b'\n' {
            break;
        }
    }
    written
}
