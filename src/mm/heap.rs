//! Kernel heap.
//!
//! The kernel window is identity-mapped at boot (see `task::bootstrap`), so
//! rather than mapping heap pages lazily through a page-table abstraction,
//! this heap lives at a fixed physical/virtual range inside that
//! already-present mapping and only needs its bytes reserved from the frame
//! allocator before `ALLOCATOR.lock().init(...)` runs.

use linked_list_allocator::LockedHeap;

use crate::config::PAGE_SIZE;

/// Start address of the kernel heap, inside the kernel window.
pub const HEAP_START: usize = 0x0020_0000;
/// Size of the kernel heap in bytes.
pub const HEAP_SIZE: usize = 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initializes the kernel heap. Must run once, after the kernel window
/// identity mapping covers `[HEAP_START, HEAP_START + HEAP_SIZE)` and before
/// any `alloc`-dependent code (the task/VMM layers) runs.
///
/// # Safety
/// Must be called exactly once; the heap range must not overlap any other
/// reserved region (kernel image, frame table, RAM-disk modules).
pub unsafe fn init() {
    assert!(
        HEAP_START % PAGE_SIZE == 0,
        "heap start must be page-aligned"
    );
    // SAFETY: `HEAP_START..HEAP_START+HEAP_SIZE` lies inside the kernel
    // window, which is identity-mapped present+writable before this runs,
    // per function contract.
    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    }
}
