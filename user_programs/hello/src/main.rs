//! Minimal user-space program for the RAM disk, run by `task::bootstrap` as
//! the kernel's init task.
//!
//! Runs in ring 3 and talks to the kernel only through `int 0x80`: `EAX`
//! carries the syscall number, `ESI` carries either a scalar argument or a
//! pointer to an in-memory argument packet, and the return value comes back
//! in `EAX`. This crate is a *user* of the kernel ABI, built and linked
//! entirely separately from the kernel itself.

#![no_std]
#![no_main]

use core::arch::asm;
use core::panic::PanicInfo;

mod number {
    pub const PRINT: u32 = 10;
    pub const SET_STATUS: u32 = 19;
    pub const VANISH: u32 = 20;
}

/// `print`'s packet: `{ len, buf }`, both little-endian `u32` words, read by
/// the kernel directly out of user memory (`syscall::sys_print`).
#[repr(C)]
struct PrintPacket {
    len: u32,
    buf: u32,
}

/// Invokes a syscall via `int 0x80`. `esi` is either a scalar argument or a
/// packet pointer, depending on the call.
///
/// # Safety
/// `num` must be a valid syscall number and `esi` must satisfy that call's
/// argument contract (a presently-mapped pointer, or the scalar it expects).
#[inline(always)]
unsafe fn syscall(num: u32, esi: u32) -> i32 {
    let result: u32;
    // SAFETY: caller's contract; `int 0x80` is this kernel's fixed syscall
    // gate (config::SYSCALL_INTERRUPT_VECTOR).
    unsafe {
        asm!(
            "int 0x80",
            inlateout("eax") num => result,
            in("esi") esi,
            options(nostack),
        );
    }
    #[expect(clippy::cast_possible_wrap, reason = "the ABI's negative error codes round-trip through this reinterpretation")]
    let result = result as i32;
    result
}

/// Writes `buf` to the console via `print`.
fn print(buf: &[u8]) {
    let packet = PrintPacket {
        len: buf.len() as u32,
        buf: buf.as_ptr() as u32,
    };
    // SAFETY: `packet` is a local, stack-resident, properly laid out
    // `PrintPacket`; its address is a valid pointer into this task's own
    // mapped stack range.
    unsafe {
        syscall(number::PRINT, (&raw const packet) as u32);
    }
}

/// Records an exit status and terminates the calling thread. Never returns:
/// `vanish` does not hand control back to the caller on success.
fn exit(status: i32) -> ! {
    // SAFETY: `set_status`'s ESI is a plain scalar; `vanish` takes none.
    unsafe {
        syscall(number::SET_STATUS, status as u32);
        syscall(number::VANISH, 0);
    }
    // `vanish` never returns; this is unreachable, kept only to satisfy `-> !`.
    loop {
        // SAFETY: a last-resort spin if the kernel somehow returned.
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }
}

/// Entry point placed at the ELF's `e_entry` by the linker script.
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    print(b"Hello from user space!\n");
    print(b"This message was printed via the print syscall (int 0x80).\n");
    exit(0);
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    print(b"PANIC in user program!\n");
    exit(1);
}
