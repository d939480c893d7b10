//! Physical-frame allocator: a refcounted frame table above the
//! kernel window.
//!
//! Walks the boot-supplied memory map once at startup, the same way a bump
//! frame allocator would, but keeps a refcount per frame instead of only a
//! high-water mark, since frames can be shared copy-on-write across tasks.

use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};

/// Frames below this index are part of the kernel window: permanently,
/// identity-mapped, never tracked individually.
static mut KERNEL_WINDOW_FRAMES: u32 = 0;

struct FrameTable {
    /// Refcount per managed frame, indexed by `frame_number - KERNEL_WINDOW_FRAMES`.
    refcounts: Vec<u32>,
    base_frame: u32,
    next_scan: usize,
}

static FRAME_TABLE: spin::Mutex<Option<FrameTable>> = spin::Mutex::new(None);

/// Initializes the frame table from a list of `(base_frame, frame_count)`
/// usable regions reported by the boot adapter, reserving everything
/// below `kernel_window_frames`.
pub fn init(usable_regions: &[(u32, u32)], kernel_window_frames: u32) {
    // SAFETY: single-threaded boot-time initialization, before any other
    // code reads `KERNEL_WINDOW_FRAMES`.
    unsafe {
        KERNEL_WINDOW_FRAMES = kernel_window_frames;
    }
    let top = usable_regions
        .iter()
        .map(|&(base, count)| base + count)
        .max()
        .unwrap_or(kernel_window_frames);
    let base_frame = kernel_window_frames;
    let count = top.saturating_sub(base_frame) as usize;
    let mut refcounts = Vec::new();
    refcounts.resize(count, 0);
    *FRAME_TABLE.lock() = Some(FrameTable {
        refcounts,
        base_frame,
        next_scan: 0,
    });
}

/// Allocates a free frame, setting its refcount to 1.
pub fn alloc_user_frame() -> Result<u32> {
    let mut guard = FRAME_TABLE.lock();
    let table = guard.as_mut().expect("frame allocator not initialized");
    let len = table.refcounts.len();
    for i in 0..len {
        let idx = (table.next_scan + i) % len;
        if table.refcounts[idx] == 0 {
            table.refcounts[idx] = 1;
            table.next_scan = (idx + 1) % len;
            return Ok(table.base_frame + idx as u32);
        }
    }
    Err(KernelError::OutOfMemory)
}

/// Increments a frame's refcount. The caller must already hold a reference.
pub fn acquire(frame: u32) {
    let mut guard = FRAME_TABLE.lock();
    let table = guard.as_mut().expect("frame allocator not initialized");
    let idx = (frame - table.base_frame) as usize;
    table.refcounts[idx] += 1;
}

/// Decrements a frame's refcount, freeing it when it reaches zero.
///
/// # Panics
/// Panics if the refcount would go negative: a contract violation by the caller.
pub fn release(frame: u32) {
    let mut guard = FRAME_TABLE.lock();
    let table = guard.as_mut().expect("frame allocator not initialized");
    let idx = (frame - table.base_frame) as usize;
    assert!(table.refcounts[idx] > 0, "frame refcount underflow");
    table.refcounts[idx] -= 1;
}

/// Current refcount of `frame`, for diagnostics and tests (P3).
#[must_use]
pub fn refcount(frame: u32) -> u32 {
    let guard = FRAME_TABLE.lock();
    let table = guard.as_ref().expect("frame allocator not initialized");
    table.refcounts[(frame - table.base_frame) as usize]
}

/// Converts a frame number to its physical base address.
#[must_use]
pub const fn frame_to_phys(frame: u32) -> u32 {
    frame * PAGE_SIZE as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn alloc_then_release_returns_frame_to_free_pool() {
        init(&[(256, 64)], 256);
        let f1 = alloc_user_frame().expect("alloc should succeed");
        assert_eq!(refcount(f1), 1, "fresh allocation has refcount 1");
        release(f1);
        assert_eq!(refcount(f1), 0, "released frame returns to refcount 0");
    }

    #[test_case]
    fn acquire_increments_shared_refcount() {
        init(&[(256, 64)], 256);
        let f1 = alloc_user_frame().expect("alloc should succeed");
        acquire(f1);
        assert_eq!(refcount(f1), 2, "acquire increments the shared refcount");
        release(f1);
        release(f1);
        assert_eq!(refcount(f1), 0, "two releases balance one alloc + one acquire");
    }
}
