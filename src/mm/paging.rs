//! Page-table entry / page-directory entry bitfields: transparent wrappers
//! around a 32-bit word with typed accessors.

use bitflags::bitflags;

use crate::config::PAGE_SIZE;

bitflags! {
    /// Bits common to both PDEs and PTEs on 32-bit non-PAE paging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Set on a page-directory entry to make it a 4 MiB page (requires
        /// `CR4.PSE`) instead of pointing at a page-table page. Used only
        /// for the kernel-window identity mapping.
        const PAGE_SIZE_4M  = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

const FRAME_ADDR_MASK: u32 = 0xFFFF_F000;

/// A page-directory or page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    pub const fn unused() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        self.flags().contains(EntryFlags::WRITABLE)
    }

    #[must_use]
    pub fn is_user(self) -> bool {
        self.flags().contains(EntryFlags::USER)
    }

    #[must_use]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Physical frame number (the frame's base address divided by `PAGE_SIZE`).
    #[must_use]
    pub fn frame(self) -> Option<u32> {
        self.is_present().then(|| (self.0 & FRAME_ADDR_MASK) / PAGE_SIZE as u32)
    }

    pub fn set(&mut self, frame: u32, flags: EntryFlags) {
        self.0 = (frame * PAGE_SIZE as u32) | flags.bits();
    }

    /// Sets a 4 MiB page-directory entry directly from a physical base
    /// address (already 4 MiB-aligned), rather than a 4 KiB frame number.
    pub fn set_large(&mut self, phys_base: u32, flags: EntryFlags) {
        self.0 = phys_base | (flags | EntryFlags::PAGE_SIZE_4M).bits();
    }

    /// Updates the flag bits while preserving the current frame number,
    /// per C2's `set_range_attrs` contract.
    pub fn set_flags(&mut self, flags: EntryFlags) {
        self.0 = (self.0 & FRAME_ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// 1024-entry page directory or page table, one physical page each.
#[repr(C, align(4096))]
pub struct Table {
    pub entries: [Entry; 1024],
}

impl Table {
    pub const fn empty() -> Self {
        Self {
            entries: [Entry::unused(); 1024],
        }
    }
}

/// Splits a virtual address into `(directory_index, table_index, page_offset)`.
#[must_use]
pub fn split_virtual_address(addr: u32) -> (usize, usize, usize) {
    let dir = (addr >> 22) & 0x3FF;
    let tab = (addr >> 12) & 0x3FF;
    let off = addr & 0xFFF;
    (dir as usize, tab as usize, off as usize)
}

/// Flushes the single TLB entry for `addr`.
pub fn invalidate_tlb(addr: u32) {
    // SAFETY: `invlpg` only ever affects the local CPU's TLB, and only for
    // the supplied linear address.
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) addr, options(nostack, preserves_flags));
    }
}
