//! Fault handler: classifies every page fault into KILL, BACK (bring in
//! an on-demand page), COW (copy-on-write private copy), or GROW_STACK
//! (extend the stack range downward by one page), per the decision table in
//! the fault component's contract.
//!
//! General protection and stack-segment faults get their own dedicated,
//! always-fatal handlers rather than being funneled through the page-fault
//! analysis above — a deliberate divergence from the more unified dispatch
//! an ELF-loader-less toy kernel might use, made because neither fault ever
//! carries a recoverable cause in this kernel (no segment-limit tricks, no
//! software TSS switching).

use crate::arch::isr::TrapFrame;
use crate::mm::address_space::phys_window;
use crate::mm::frame_allocator;
use crate::mm::paging::EntryFlags;
use crate::task;

const ERR_PRESENT: u32 = 1 << 0;
const ERR_WRITE: u32 = 1 << 1;
const ERR_USER: u32 = 1 << 2;

const MAX_STACK_GROWTH_PAGES: u32 = 256;

fn read_cr2() -> u32 {
    let value: u32;
    // SAFETY: reads a control register, no side effect.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Vector 14: page fault.
pub fn handle_page_fault(frame: &mut TrapFrame) {
    let fault_addr = read_cr2();
    let from_user = frame.error_code & ERR_USER != 0;
    let is_write = frame.error_code & ERR_WRITE != 0;
    let protection_violation = frame.error_code & ERR_PRESENT != 0;

    if !from_user {
        panic!(
            "page fault in kernel mode at {fault_addr:#010x} (eip {:#010x}, error {:#x})",
            frame.eip, frame.error_code
        );
    }

    let task = task::current_task();
    // SAFETY: `task` is the live current task, valid for the duration of
    // this fault handler (it cannot be torn down while one of its own
    // threads is trapped in the kernel).
    let task_ref = unsafe { task.as_ref() };
    let mut address_space = task_ref.address_space.lock();

    if address_space.get_range(fault_addr).is_none() {
        drop(address_space);
        if try_grow_stack(task_ref, fault_addr) {
            return;
        }
        task::kill_current("page fault outside any mapped range");
    }

    if !protection_violation {
        // BACK: the range is installed but this page has never been
        // touched. `new_pages` and lazily-stacked ranges land here.
        if address_space.back_page(fault_addr & !0xFFF).is_err() {
            drop(address_space);
            task::kill_current("out of memory backing a page");
        }
        return;
    }

    if is_write {
        let entry = address_space.get_pte(fault_addr);
        let writable_already = entry.is_some_and(|e| e.is_writable());
        if writable_already {
            // Nothing to do: a second CPU would race here, but this kernel
            // has exactly one.
            return;
        }
        if address_space.is_address_ro(fault_addr) {
            drop(address_space);
            task::kill_current("write to a read-only page");
        }
        let Some(frame_num) = entry.and_then(|e| e.frame()) else {
            drop(address_space);
            task::kill_current("write fault with no backing frame");
        };
        let page_addr = fault_addr & !0xFFF;
        if frame_allocator::refcount(frame_num) > 1 {
            // COW: the frame is still shared with another address space;
            // split off a private copy.
            if copy_on_write(&mut address_space, page_addr, frame_num).is_err() {
                drop(address_space);
                task::kill_current("out of memory resolving a copy-on-write fault");
            }
            return;
        }
        // The other COW sibling already split away; this side is the sole
        // remaining owner, so just flip its own PTE writable in place.
        let flags = entry.expect("frame() returned Some above").flags() | EntryFlags::WRITABLE;
        address_space.set_pte(page_addr, frame_num, flags);
    } else {
        drop(address_space);
        task::kill_current("page fault with no recoverable cause");
    }
}

fn copy_on_write(address_space: &mut crate::mm::AddressSpace, page_addr: u32, old_frame: u32) -> crate::error::Result<()> {
    let new_frame = frame_allocator::alloc_user_frame()?;
    phys_window::copy_frame(old_frame, new_frame);
    let pte = address_space.get_pte(page_addr).expect("page present by construction");
    let flags = pte.flags() | EntryFlags::WRITABLE;
    address_space.set_pte(page_addr, new_frame, flags);
    frame_allocator::release(old_frame);
    Ok(())
}

/// GROW_STACK: if `fault_addr` is exactly one page below the task's current
/// stack range and within the growth ceiling, extends the stack down by one
/// page and backs it. Returns whether growth happened.
fn try_grow_stack(task_ref: &task::Task, fault_addr: u32) -> bool {
    let mut address_space = task_ref.address_space.lock();
    let Some(stack) = address_space.segments.stack else {
        return false;
    };
    let page_addr = fault_addr & !0xFFF;
    if page_addr != stack.start - crate::config::PAGE_SIZE as u32 {
        return false;
    }
    let grown_pages = (crate::config::USER_STACK_TOP - page_addr) / crate::config::PAGE_SIZE as u32;
    if grown_pages > MAX_STACK_GROWTH_PAGES {
        return false;
    }
    let Ok(new_range) = address_space.install_range(page_addr, crate::config::PAGE_SIZE as u32) else {
        return false;
    };
    if address_space.back_page(new_range.start).is_err() {
        return false;
    }
    address_space.segments.stack = Some(crate::mm::address_space::VmRange {
        start: new_range.start,
        len: stack.len + crate::config::PAGE_SIZE as u32,
    });
    true
}

/// Every other fault vector (divide-by-zero, invalid opcode, general
/// protection, stack-segment, etc.): always fatal. User-mode faults kill
/// the offending thread; kernel-mode faults are a kernel bug and panic.
pub fn handle_other_fault(frame: &mut TrapFrame) {
    let from_user = frame.cs & 0x3 != 0;
    if !from_user {
        panic!(
            "unhandled fault {} in kernel mode at eip {:#010x} (error {:#x})",
            frame.vector, frame.eip, frame.error_code
        );
    }
    task::kill_current("unhandled CPU exception");
}
