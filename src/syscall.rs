//! System-call dispatch: a flat, densely-numbered table of
//! `{ arg_check, handler }` pairs, one per call in the "packet in ESI"
//! ABI. `dispatch` reads the call number out of `EAX`, runs the call's
//! `arg_check` against the trap frame, then (on success) the handler; the
//! handler's `i32` return value is written back to `EAX`, matching the
//! convention the rest of the kernel already collapses `KernelError` to
//! (`KernelError::code`).
//!
//! Packet fields are always 4-byte little-endian words read straight out of
//! user memory by address, never through a `#[repr(C)]` struct overlay —
//! the caller is untrusted and every field access goes through
//! [`check_ptr`] first.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::isr::TrapFrame;
use crate::config::{MAX_ARGC, MAX_USER_STRING_LEN};
use crate::console::{self, Color};
use crate::error::{KernelError, Result};
use crate::keyboard;
use crate::ramdisk;
use crate::sched;
use crate::task;

/// Dense syscall numbers, in the ABI table's order.
mod number {
    pub const FORK: usize = 0;
    pub const EXEC: usize = 1;
    pub const WAIT: usize = 2;
    pub const YIELD: usize = 3;
    pub const GETTID: usize = 4;
    pub const NEW_PAGES: usize = 5;
    pub const REMOVE_PAGES: usize = 6;
    pub const SLEEP: usize = 7;
    pub const GETCHAR: usize = 8;
    pub const READLINE: usize = 9;
    pub const PRINT: usize = 10;
    pub const SET_TERM_COLOR: usize = 11;
    pub const SET_CURSOR_POS: usize = 12;
    pub const GET_CURSOR_POS: usize = 13;
    pub const THREAD_FORK: usize = 14;
    pub const GET_TICKS: usize = 15;
    pub const HALT: usize = 16;
    pub const LS: usize = 17;
    pub const TASK_VANISH: usize = 18;
    pub const SET_STATUS: usize = 19;
    pub const VANISH: usize = 20;
    pub const CAS2I_RUNFLAG: usize = 21;
    pub const COUNT: usize = 22;
}

#[derive(Clone, Copy)]
struct SyscallEntry {
    arg_check: fn(&TrapFrame) -> Result<()>,
    handler: fn(&mut TrapFrame) -> i32,
}

/// Dispatches a trapped syscall: looks up `frame.eax` in [`SYSCALL_TABLE`],
/// runs `arg_check` then `handler`, and writes the collapsed result back to
/// `frame.eax`. Called by `arch::isr::dispatch` for vector `0x80`.
pub fn dispatch(frame: &mut TrapFrame) {
    let result = match SYSCALL_TABLE.get(frame.eax as usize) {
        Some(entry) => match (entry.arg_check)(frame) {
            Ok(()) => (entry.handler)(frame),
            Err(err) => err.code(),
        },
        None => KernelError::InvalidSyscall.code(),
    };
    // Reinterpret the bit pattern rather than cast: a negative `result` is
    // an error code the ABI wants as a plain word, not a value to re-range.
    frame.eax = u32::from_ne_bytes(result.to_ne_bytes());
}

fn no_check(_frame: &TrapFrame) -> Result<()> {
    Ok(())
}

/// Validates that `[addr, addr+len)` lies inside one presently-installed
/// range of the calling task's address space.
fn check_ptr(addr: u32, len: u32) -> Result<()> {
    let task = task::current_task();
    // SAFETY: the calling task outlives the syscall that traps into it.
    let present = unsafe { task.as_ref().address_space.lock().range_present(addr, len) };
    if present {
        Ok(())
    } else {
        Err(KernelError::AddressNotPresent)
    }
}

/// Reads one little-endian `u32` packet field. Only called after the
/// surrounding packet range has passed [`check_ptr`].
fn read_u32(addr: u32) -> u32 {
    // SAFETY: caller validated `[addr, addr+4)` via `check_ptr`.
    unsafe { (addr as *const u32).read_unaligned() }
}

/// Writes one little-endian `u32` packet out-field. Only called after the
/// surrounding packet range has passed [`check_ptr`].
fn write_u32(addr: u32, value: u32) {
    // SAFETY: caller validated `[addr, addr+4)` via `check_ptr`.
    unsafe { (addr as *mut u32).write_unaligned(value) };
}

/// Copies a NUL-terminated user string into kernel memory, one byte at a
/// time (so each byte's page gets its own `range_present` check rather than
/// trusting the caller's claimed length), up to `MAX_USER_STRING_LEN`.
fn read_cstr(addr: u32) -> Result<String> {
    let mut bytes = Vec::new();
    for offset in 0..MAX_USER_STRING_LEN {
        let cur = addr + offset;
        check_ptr(cur, 1)?;
        // SAFETY: just validated by `check_ptr`.
        let byte = unsafe { (cur as *const u8).read() };
        if byte == 0 {
            return String::from_utf8(bytes).map_err(|_bad_utf8| KernelError::BadSysParam);
        }
        bytes.push(byte);
    }
    Err(KernelError::BadSysParam)
}

/// Walks a NUL-terminated array of string pointers (`exec`'s `argv`), up to
/// `MAX_ARGC` entries.
fn read_argv(addr: u32) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for index in 0..MAX_ARGC as u32 {
        let slot = addr + index * 4;
        check_ptr(slot, 4)?;
        let ptr = read_u32(slot);
        if ptr == 0 {
            return Ok(out);
        }
        out.push(read_cstr(ptr)?);
    }
    Err(KernelError::BadSysParam)
}

fn color_from_nibble(nibble: u32) -> Color {
    match nibble {
        0 => Color::Black,
        1 => Color::Blue,
        2 => Color::Green,
        3 => Color::Cyan,
        4 => Color::Red,
        5 => Color::Magenta,
        6 => Color::Brown,
        7 => Color::LightGray,
        8 => Color::DarkGray,
        9 => Color::LightBlue,
        10 => Color::LightGreen,
        11 => Color::LightCyan,
        12 => Color::LightRed,
        13 => Color::Pink,
        14 => Color::Yellow,
        _ => Color::White,
    }
}

// --- fork ---

fn sys_fork(frame: &mut TrapFrame) -> i32 {
    #[expect(clippy::cast_possible_wrap, reason = "tids are small kernel pointers, never exceeding i32::MAX")]
    match task::fork(&*frame) {
        Ok(tid) => tid as i32,
        Err(err) => err.code(),
    }
}

// --- exec ---

fn arg_check_exec(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 8)
}

fn sys_exec(frame: &mut TrapFrame) -> i32 {
    let filename_ptr = read_u32(frame.esi);
    let argv_ptr = read_u32(frame.esi + 4);
    let filename = match read_cstr(filename_ptr) {
        Ok(s) => s,
        Err(err) => return err.code(),
    };
    let argv_owned = match read_argv(argv_ptr) {
        Ok(v) => v,
        Err(err) => return err.code(),
    };
    let argv: Vec<&str> = argv_owned.iter().map(String::as_str).collect();
    match task::exec(&filename, &argv) {
        Ok(_entry_and_stack) => 0,
        Err(err) => err.code(),
    }
}

// --- wait ---

fn arg_check_wait(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 4)
}

fn sys_wait(frame: &mut TrapFrame) -> i32 {
    let mut status = 0i32;
    match task::wait(&mut status) {
        #[expect(clippy::cast_sign_loss, reason = "written back as a raw word, not compared")]
        #[expect(clippy::cast_possible_wrap, reason = "tids are small kernel pointers, never exceeding i32::MAX")]
        Ok(tid) => {
            write_u32(frame.esi, status as u32);
            tid as i32
        }
        Err(err) => err.code(),
    }
}

// --- yield ---

fn sys_yield(frame: &mut TrapFrame) -> i32 {
    match task::yield_thread(frame.esi) {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

// --- gettid ---

#[expect(clippy::cast_possible_wrap, reason = "tids are small kernel pointers, never exceeding i32::MAX")]
fn sys_gettid(_frame: &mut TrapFrame) -> i32 {
    task::gettid() as i32
}

// --- new_pages ---

fn arg_check_new_pages(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 8)
}

fn sys_new_pages(frame: &mut TrapFrame) -> i32 {
    let base = read_u32(frame.esi);
    let len = read_u32(frame.esi + 4);
    match task::new_pages(base, len) {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

// --- remove_pages ---

fn sys_remove_pages(frame: &mut TrapFrame) -> i32 {
    match task::remove_pages(frame.esi) {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

// --- sleep ---

fn sys_sleep(frame: &mut TrapFrame) -> i32 {
    task::sleep(frame.esi);
    0
}

// --- getchar ---

fn sys_getchar(_frame: &mut TrapFrame) -> i32 {
    i32::from(keyboard::getchar())
}

// --- readline ---

fn arg_check_readline(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 8)?;
    let len = read_u32(frame.esi);
    let buf = read_u32(frame.esi + 4);
    check_ptr(buf, len)
}

#[expect(clippy::cast_possible_wrap, reason = "a byte count read into a user buffer never exceeds i32::MAX")]
fn sys_readline(frame: &mut TrapFrame) -> i32 {
    let len = read_u32(frame.esi);
    let buf = read_u32(frame.esi + 4);
    if len == 0 {
        return 0;
    }
    // SAFETY: `[buf, buf+len)` was validated present by `arg_check_readline`.
    let slice = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len as usize) };
    keyboard::readline(slice) as i32
}

// --- print ---

fn arg_check_print(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 8)?;
    let len = read_u32(frame.esi);
    let buf = read_u32(frame.esi + 4);
    check_ptr(buf, len)
}

fn sys_print(frame: &mut TrapFrame) -> i32 {
    let len = read_u32(frame.esi);
    let buf = read_u32(frame.esi + 4);
    // SAFETY: `[buf, buf+len)` was validated present by `arg_check_print`.
    let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, len as usize) };
    console::write_bytes(slice);
    0
}

// --- set_term_color ---

fn arg_check_set_term_color(frame: &TrapFrame) -> Result<()> {
    if frame.esi > 0xFF {
        return Err(KernelError::BadSysParam);
    }
    Ok(())
}

fn sys_set_term_color(frame: &mut TrapFrame) -> i32 {
    let foreground = color_from_nibble(frame.esi & 0xF);
    let background = color_from_nibble((frame.esi >> 4) & 0xF);
    console::set_color(foreground, background);
    0
}

// --- set_cursor_pos ---

fn arg_check_set_cursor_pos(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 8)
}

fn sys_set_cursor_pos(frame: &mut TrapFrame) -> i32 {
    let row = read_u32(frame.esi);
    let col = read_u32(frame.esi + 4);
    console::set_cursor_pos(row as usize, col as usize);
    0
}

// --- get_cursor_pos ---

fn arg_check_get_cursor_pos(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 8)?;
    let row_ptr = read_u32(frame.esi);
    let col_ptr = read_u32(frame.esi + 4);
    check_ptr(row_ptr, 4)?;
    check_ptr(col_ptr, 4)
}

#[expect(clippy::cast_possible_truncation, reason = "VGA text-mode coordinates fit comfortably in a u32")]
fn sys_get_cursor_pos(frame: &mut TrapFrame) -> i32 {
    let row_ptr = read_u32(frame.esi);
    let col_ptr = read_u32(frame.esi + 4);
    let (row, col) = console::cursor_pos();
    write_u32(row_ptr, row as u32);
    write_u32(col_ptr, col as u32);
    0
}

// --- thread_fork ---

fn sys_thread_fork(_frame: &mut TrapFrame) -> i32 {
    #[expect(clippy::cast_possible_wrap, reason = "tids are small kernel pointers, never exceeding i32::MAX")]
    match task::thread_fork() {
        Ok(tid) => tid as i32,
        Err(err) => err.code(),
    }
}

// --- get_ticks ---

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    reason = "EAX can only ever carry the low 32 bits of the tick count, reinterpreted as a raw word"
)]
fn sys_get_ticks(_frame: &mut TrapFrame) -> i32 {
    sched::ticks() as u32 as i32
}

// --- halt ---

fn sys_halt(_frame: &mut TrapFrame) -> i32 {
    console::write_bytes(b"system halted\n");
    // SAFETY: intentionally stops the only CPU this kernel ever runs on.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
    loop {
        // SAFETY: halts until the next interrupt, which never arrives since
        // interrupts are disabled above.
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}

// --- ls ---

fn arg_check_ls(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 8)?;
    let size = read_u32(frame.esi);
    let buf = read_u32(frame.esi + 4);
    check_ptr(buf, size)
}

#[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap, reason = "the ramdisk holds far fewer than i32::MAX entries")]
fn sys_ls(frame: &mut TrapFrame) -> i32 {
    let size = read_u32(frame.esi);
    let buf = read_u32(frame.esi + 4);
    let names = ramdisk::list();

    let mut needed = 0usize;
    for name in &names {
        needed += name.len() + 1;
    }
    if needed > size as usize {
        return KernelError::BufferTooSmall.code();
    }

    let mut cursor = buf;
    for name in &names {
        // SAFETY: `[buf, buf+size)` was validated present by `arg_check_ls`,
        // and `needed <= size` above.
        unsafe {
            core::ptr::copy_nonoverlapping(name.as_ptr(), cursor as *mut u8, name.len());
            (((cursor as usize) + name.len()) as *mut u8).write(0);
        }
        cursor += name.len() as u32 + 1;
    }
    names.len() as i32
}

// --- task_vanish ---

fn sys_task_vanish(_frame: &mut TrapFrame) -> i32 {
    task::task_vanish()
}

// --- set_status ---

#[expect(clippy::cast_possible_wrap, reason = "status is a raw word reinterpreted, not compared")]
fn sys_set_status(frame: &mut TrapFrame) -> i32 {
    task::set_status(frame.esi as i32);
    0
}

// --- vanish ---

fn sys_vanish(_frame: &mut TrapFrame) -> i32 {
    task::vanish()
}

// --- cas2i_runflag ---

fn arg_check_cas2i_runflag(frame: &TrapFrame) -> Result<()> {
    check_ptr(frame.esi, 24)?;
    let old_out = read_u32(frame.esi + 4);
    check_ptr(old_out, 4)
}

#[expect(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    reason = "run-flag values are small signed sentinels round-tripped through u32 words"
)]
fn sys_cas2i_runflag(frame: &mut TrapFrame) -> i32 {
    let tid = read_u32(frame.esi);
    let old_out = read_u32(frame.esi + 4);
    let ev1 = read_u32(frame.esi + 8) as i32;
    let nv1 = read_u32(frame.esi + 12) as i32;
    let ev2 = read_u32(frame.esi + 16) as i32;
    let nv2 = read_u32(frame.esi + 20) as i32;
    let mut old = 0i32;
    match task::cas2i_runflag(tid, &mut old, ev1, nv1, ev2, nv2) {
        Ok(()) => {
            write_u32(old_out, old as u32);
            0
        }
        Err(err) => err.code(),
    }
}

static SYSCALL_TABLE: [SyscallEntry; number::COUNT] = {
    let mut table = [SyscallEntry { arg_check: no_check, handler: sys_fork }; number::COUNT];
    table[number::FORK] = SyscallEntry { arg_check: no_check, handler: sys_fork };
    table[number::EXEC] = SyscallEntry { arg_check: arg_check_exec, handler: sys_exec };
    table[number::WAIT] = SyscallEntry { arg_check: arg_check_wait, handler: sys_wait };
    table[number::YIELD] = SyscallEntry { arg_check: no_check, handler: sys_yield };
    table[number::GETTID] = SyscallEntry { arg_check: no_check, handler: sys_gettid };
    table[number::NEW_PAGES] = SyscallEntry { arg_check: arg_check_new_pages, handler: sys_new_pages };
    table[number::REMOVE_PAGES] = SyscallEntry { arg_check: no_check, handler: sys_remove_pages };
    table[number::SLEEP] = SyscallEntry { arg_check: no_check, handler: sys_sleep };
    table[number::GETCHAR] = SyscallEntry { arg_check: no_check, handler: sys_getchar };
    table[number::READLINE] = SyscallEntry { arg_check: arg_check_readline, handler: sys_readline };
    table[number::PRINT] = SyscallEntry { arg_check: arg_check_print, handler: sys_print };
    table[number::SET_TERM_COLOR] = SyscallEntry { arg_check: arg_check_set_term_color, handler: sys_set_term_color };
    table[number::SET_CURSOR_POS] = SyscallEntry { arg_check: arg_check_set_cursor_pos, handler: sys_set_cursor_pos };
    table[number::GET_CURSOR_POS] = SyscallEntry { arg_check: arg_check_get_cursor_pos, handler: sys_get_cursor_pos };
    table[number::THREAD_FORK] = SyscallEntry { arg_check: no_check, handler: sys_thread_fork };
    table[number::GET_TICKS] = SyscallEntry { arg_check: no_check, handler: sys_get_ticks };
    table[number::HALT] = SyscallEntry { arg_check: no_check, handler: sys_halt };
    table[number::LS] = SyscallEntry { arg_check: arg_check_ls, handler: sys_ls };
    table[number::TASK_VANISH] = SyscallEntry { arg_check: no_check, handler: sys_task_vanish };
    table[number::SET_STATUS] = SyscallEntry { arg_check: no_check, handler: sys_set_status };
    table[number::VANISH] = SyscallEntry { arg_check: no_check, handler: sys_vanish };
    table[number::CAS2I_RUNFLAG] = SyscallEntry { arg_check: arg_check_cas2i_runflag, handler: sys_cas2i_runflag };
    table
};
