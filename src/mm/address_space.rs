//! Per-task address space: page directory, VM-range list, COW and
//! on-demand backing.
//!
//! The kernel window identity-maps only `[0, USER_MEM_START)`; every frame
//! `frame_allocator::alloc_user_frame` ever hands out lives above that
//! boundary by construction (`frame_allocator::init` reserves the window as
//! unmanaged), so a frame number cannot be turned into a dereferenceable
//! kernel pointer directly. Anything that needs to read or write a user
//! frame's bytes goes through `phys_window`: one physical page, shared by
//! every address space, with two PTE slots that get repointed at whichever
//! frame is being visited and torn down right after.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::{PAGE_SIZE, USER_MEM_START};
use crate::error::{KernelError, Result};
use crate::mm::frame_allocator;
use crate::mm::paging::{split_virtual_address, invalidate_tlb, Entry, EntryFlags, Table};

/// A page-aligned logical region of a task's user address space.
#[derive(Debug, Clone, Copy)]
pub struct VmRange {
    pub start: u32,
    pub len: u32,
}

impl VmRange {
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.start + self.len
    }

    #[must_use]
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// Remembered ELF segment extents, used by `is_address_ro` and by `exec`'s
/// fresh-address-space hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentExtents {
    pub text: Option<VmRange>,
    pub rodata: Option<VmRange>,
    pub data: Option<VmRange>,
    pub stack: Option<VmRange>,
}

/// Per-task address space.
pub struct AddressSpace {
    pub page_directory: Box<Table>,
    /// One allocated page-table page per populated directory index.
    page_tables: Vec<(usize, Box<Table>)>,
    pub ranges: Vec<VmRange>,
    pub segments: SegmentExtents,
    pub quota_used: usize,
}

fn round_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

fn round_up(addr: u32) -> u32 {
    round_down(addr + PAGE_SIZE as u32 - 1)
}

impl AddressSpace {
    /// `init`: allocates a fresh page directory, pre-populates the
    /// kernel-window mappings, and attaches the kernel-window sentinel
    /// range. If `parent` is given, the ELF segment extents are copied as
    /// hints (not the page tables themselves — callers that want shared
    /// pages call `share_physical` explicitly, per `fork`'s contract).
    pub fn init(parent: Option<&Self>) -> Self {
        let mut page_directory = Box::new(Table::empty());
        populate_kernel_window(&mut page_directory);

        let kernel_sentinel = VmRange {
            start: 0,
            len: USER_MEM_START,
        };

        Self {
            page_directory,
            page_tables: Vec::new(),
            ranges: alloc::vec![kernel_sentinel],
            segments: parent.map(|p| p.segments).unwrap_or_default(),
            quota_used: 0,
        }
    }

    fn page_table_mut(&mut self, dir_index: usize) -> &mut Table {
        if let Some(pos) = self.page_tables.iter().position(|(i, _)| *i == dir_index) {
            return &mut self.page_tables[pos].1;
        }
        let table = Box::new(Table::empty());
        let phys = core::ptr::from_ref(&*table) as u32;
        self.page_directory.entries[dir_index].set(
            phys / PAGE_SIZE as u32,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        );
        self.page_tables.push((dir_index, table));
        let pos = self.page_tables.len() - 1;
        &mut self.page_tables[pos].1
    }

    fn page_table(&self, dir_index: usize) -> Option<&Table> {
        self.page_tables
            .iter()
            .find(|(i, _)| *i == dir_index)
            .map(|(_, t)| &**t)
    }

    /// `install_range`: round to page boundaries, reject intersection
    /// with the kernel window, allocate page-table pages as needed, install
    /// present+writable+user entries (no frames backed yet).
    pub fn install_range(&mut self, start: u32, len: u32) -> Result<VmRange> {
        let end = round_up(start.saturating_add(len));
        let start = round_down(start);
        if start < USER_MEM_START {
            return Err(KernelError::VmCannotMap);
        }
        let range = VmRange {
            start,
            len: end - start,
        };
        let mut addr = range.start;
        while addr < range.end() {
            let (dir, tab, _) = split_virtual_address(addr);
            let table = self.page_table_mut(dir);
            if !table.entries[tab].is_present() {
                // Installed with no frame yet: caller backs on demand or
                // via `back_all_ranges`.
                table.entries[tab] = Entry::unused();
            }
            addr += PAGE_SIZE as u32;
        }
        self.ranges.push(range);
        Ok(range)
    }

    /// `uninstall_range`: find by exact start, release every present
    /// frame, clear PTEs and flush their TLB lines, drop the range record.
    pub fn uninstall_range(&mut self, start: u32) -> Result<()> {
        let pos = self
            .ranges
            .iter()
            .position(|r| r.start == start)
            .ok_or(KernelError::PageErr)?;
        let range = self.ranges.remove(pos);
        let mut addr = range.start;
        while addr < range.end() {
            let (dir, tab, _) = split_virtual_address(addr);
            if let Some(table) = self.page_tables.iter_mut().find(|(i, _)| *i == dir) {
                let entry = &mut table.1.entries[tab];
                if let Some(frame) = entry.frame() {
                    frame_allocator::release(frame);
                }
                entry.clear();
                invalidate_tlb(addr);
            }
            addr += PAGE_SIZE as u32;
        }
        Ok(())
    }

    /// `set_range_attrs`: apply flag bits to every PTE (and covering
    /// PDE) in `range`, preserving the frame number.
    pub fn set_range_attrs(&mut self, range: VmRange, flags: EntryFlags) {
        let mut addr = range.start;
        while addr < range.end() {
            let (dir, tab, _) = split_virtual_address(addr);
            if let Some(pos) = self.page_tables.iter().position(|(i, _)| *i == dir) {
                let entry = &mut self.page_tables[pos].1.entries[tab];
                if entry.is_present() {
                    entry.set_flags(flags);
                    invalidate_tlb(addr);
                }
            }
            addr += PAGE_SIZE as u32;
        }
    }

    /// `back_all_ranges`: allocate and map a frame for every page of
    /// every non-kernel range.
    pub fn back_all_ranges(&mut self) -> Result<()> {
        let ranges: Vec<VmRange> = self.ranges.iter().copied().filter(|r| r.start != 0).collect();
        for range in ranges {
            let mut addr = range.start;
            while addr < range.end() {
                self.back_page(addr)?;
                addr += PAGE_SIZE as u32;
            }
        }
        Ok(())
    }

    /// `unback_all_ranges`: release every present frame and clear PTEs
    /// for every non-kernel range, without dropping the range records.
    pub fn unback_all_ranges(&mut self) {
        let ranges: Vec<VmRange> = self.ranges.iter().copied().filter(|r| r.start != 0).collect();
        for range in ranges {
            let mut addr = range.start;
            while addr < range.end() {
                let (dir, tab, _) = split_virtual_address(addr);
                if let Some(pos) = self.page_tables.iter().position(|(i, _)| *i == dir) {
                    let entry = &mut self.page_tables[pos].1.entries[tab];
                    if let Some(frame) = entry.frame() {
                        frame_allocator::release(frame);
                    }
                    entry.clear();
                }
                addr += PAGE_SIZE as u32;
            }
        }
    }

    /// Backs a single page with a freshly allocated, zeroed frame, RW+user.
    pub fn back_page(&mut self, addr: u32) -> Result<u32> {
        let frame = frame_allocator::alloc_user_frame()?;
        phys_window::with_frame(frame, |base| {
            // SAFETY: `base` is the window's SRC slot, just mapped
            // present+writable over the frame this call just allocated;
            // nothing else holds a reference to it yet.
            unsafe {
                core::ptr::write_bytes(base, 0, PAGE_SIZE);
            }
        });
        let (dir, tab, _) = split_virtual_address(addr);
        let table = self.page_table_mut(dir);
        table.entries[tab].set(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER);
        invalidate_tlb(addr);
        Ok(frame)
    }

    /// Points the PTE covering `addr` at `frame` with `flags`, without
    /// touching the frame allocator's refcount (the caller arranges that
    /// separately). Used by the page-fault handler's copy-on-write
    /// resolution to install a freshly copied frame.
    pub fn set_pte(&mut self, addr: u32, frame: u32, flags: EntryFlags) {
        let (dir, tab, _) = split_virtual_address(addr);
        let table = self.page_table_mut(dir);
        table.entries[tab].set(frame, flags);
        invalidate_tlb(addr);
    }

    /// `share_physical`: for each page in `range`, acquire the source
    /// frame and write it into the destination's PTE. Caller marks both
    /// sides read-only afterward to enable COW.
    pub fn share_physical(&mut self, src: &Self, range: VmRange) {
        let mut addr = range.start;
        while addr < range.end() {
            let (dir, tab, _) = split_virtual_address(addr);
            if let Some(entry) = src.page_table(dir).map(|t| t.entries[tab]) {
                if let Some(frame) = entry.frame() {
                    frame_allocator::acquire(frame);
                    let table = self.page_table_mut(dir);
                    table.entries[tab].set(frame, entry.flags());
                }
            }
            addr += PAGE_SIZE as u32;
        }
    }

    /// `copy_user_ptes`: makes this address space's user-half
    /// directory entries identical to `src`'s, atomically swapping in a
    /// replacement user map during `exec`.
    pub fn copy_user_ptes(&mut self, src: &Self) {
        let first_user_dir = (USER_MEM_START >> 22) as usize;
        for dir in first_user_dir..1024 {
            if let Some(table) = src.page_table(dir) {
                let dst = self.page_table_mut(dir);
                dst.entries = table.entries;
            }
        }
    }

    /// `free_user_ptes`: releases every user-half page-table page.
    pub fn free_user_ptes(&mut self) {
        let first_user_dir = (USER_MEM_START >> 22) as usize;
        self.page_tables.retain(|(dir, _)| *dir < first_user_dir);
        for dir in first_user_dir..1024 {
            self.page_directory.entries[dir].clear();
        }
    }

    /// `copy_range_list`: rebuilds this address space's user range
    /// list as a deep copy of `src`'s.
    pub fn copy_range_list(&mut self, src: &Self) {
        self.ranges = src.ranges.clone();
    }

    /// `get_pte`.
    #[must_use]
    pub fn get_pte(&self, addr: u32) -> Option<Entry> {
        let (dir, tab, _) = split_virtual_address(addr);
        self.page_table(dir).map(|t| t.entries[tab])
    }

    /// `get_pde`.
    #[must_use]
    pub fn get_pde(&self, addr: u32) -> Entry {
        let (dir, _, _) = split_virtual_address(addr);
        self.page_directory.entries[dir]
    }

    /// `get_range`: the installed range containing `addr`, if any.
    #[must_use]
    pub fn get_range(&self, addr: u32) -> Option<VmRange> {
        self.ranges.iter().copied().find(|r| r.contains(addr))
    }

    /// `range_present`: user-pointer validation over `[addr, addr+len)`.
    #[must_use]
    pub fn range_present(&self, addr: u32, len: u32) -> bool {
        if len == 0 {
            return self.get_range(addr).is_some();
        }
        self.get_range(addr).is_some_and(|r| addr + len <= r.end())
    }

    /// `is_address_ro`: does `addr` lie in the remembered text or
    /// rodata extents?
    #[must_use]
    pub fn is_address_ro(&self, addr: u32) -> bool {
        self.segments.text.is_some_and(|r| r.contains(addr))
            || self.segments.rodata.is_some_and(|r| r.contains(addr))
    }

    /// Writes `bytes` into this address space's already-backed pages at
    /// `addr`, through their physical frames rather than `addr` itself —
    /// correct whether or not this address space is the one currently
    /// loaded in `CR3` (used by `exec` to populate a not-yet-active image
    /// and by `task::fork`'s argv setup).
    pub fn write_bytes(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        let mut written = 0usize;
        while written < bytes.len() {
            let a = addr + written as u32;
            let entry = self.get_pte(a).filter(|e| e.is_present()).ok_or(KernelError::PageErr)?;
            let frame = entry.frame().ok_or(KernelError::PageErr)?;
            let page_off = (a & (PAGE_SIZE as u32 - 1)) as usize;
            let chunk = core::cmp::min(bytes.len() - written, PAGE_SIZE - page_off);
            phys_window::with_frame(frame, |base| {
                // SAFETY: `base` is the window's SRC slot, mapped
                // present+writable over the frame this address space's own
                // page table marks present at `a`, regardless of whether
                // this address space is the one currently loaded in `CR3`;
                // `page_off + chunk <= PAGE_SIZE`.
                unsafe {
                    core::ptr::copy_nonoverlapping(bytes[written..written + chunk].as_ptr(), base.add(page_off), chunk);
                }
            });
            written += chunk;
        }
        Ok(())
    }

    /// Physical address of this address space's page directory, for `CR3`.
    #[must_use]
    pub fn cr3(&self) -> u32 {
        core::ptr::from_ref(&*self.page_directory) as u32
    }

    /// Loads `CR3` with this address space's page directory. Called by the
    /// scheduler on every context switch that crosses a task boundary.
    pub fn load_cr3(&self) {
        let phys = self.cr3();
        // SAFETY: `phys` is the physical address of a fully populated page
        // directory (kernel window always present; user half backed as far
        // as the task has installed).
        unsafe {
            core::arch::asm!("mov cr3, {0}", in(reg) phys, options(nostack, preserves_flags));
        }
    }
}

/// Identity-maps the kernel window (everything below `USER_MEM_START`) as
/// present+writable+global 4 MiB pages, shared verbatim across every
/// address space's top-level directory entries. Requires `CR4.PSE` to be
/// set before paging is enabled (`task::bootstrap`).
///
/// The window's last 4 MiB is the one exception: instead of a single large
/// page it gets a normal page-table-backed directory entry pointing at
/// `phys_window`'s shared table, identity-mapping the same 1024 frames one
/// page at a time except for the two slots `phys_window` reserves for
/// itself.
fn populate_kernel_window(dir: &mut Table) {
    const FOUR_MIB: u32 = 0x0040_0000;
    let covered_dirs = (USER_MEM_START >> 22) as usize;
    for d in 0..covered_dirs {
        if d == phys_window::DIR_INDEX {
            let phys = phys_window::table_phys();
            dir.entries[d].set(phys / PAGE_SIZE as u32, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        } else {
            dir.entries[d].set_large(
                d as u32 * FOUR_MIB,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::GLOBAL,
            );
        }
    }
}

/// A reserved window for touching user-frame contents from kernel code.
///
/// `frame_allocator`'s frames all live above `USER_MEM_START`, outside the
/// kernel window's identity map, so they have no address the kernel can
/// dereference directly. This module carves two PTE slots out of the last
/// page of the kernel window (see `populate_kernel_window`) and repoints
/// them at whichever frame is being read or written, one at a time, behind
/// a lock — the uniprocessor equivalent of the original kernel's
/// `copy_area` and its `SRC_PAGE_MAP_IDX`/`DST_PAGE_MAP_IDX` slots.
pub mod phys_window {
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::{invalidate_tlb, EntryFlags, Table};
    use crate::config::{PAGE_SIZE, USER_MEM_START};
    use crate::sync::IrqSpinlock;

    const FOUR_MIB: u32 = 0x0040_0000;
    pub(super) const DIR_INDEX: usize = (USER_MEM_START >> 22) as usize - 1;
    const SRC_TAB: usize = 1022;
    const DST_TAB: usize = 1023;

    const SRC_VADDR: u32 = DIR_INDEX as u32 * FOUR_MIB + SRC_TAB as u32 * PAGE_SIZE as u32;
    const DST_VADDR: u32 = DIR_INDEX as u32 * FOUR_MIB + DST_TAB as u32 * PAGE_SIZE as u32;

    static WINDOW: IrqSpinlock<Table> = IrqSpinlock::new(Table::empty());
    static IDENTITY_FILLED: AtomicBool = AtomicBool::new(false);

    /// Physical address of the shared window page table. The first caller
    /// (the first `AddressSpace::init`, at boot) also fills in the
    /// identity-mapped half of the table; every later call just reads the
    /// address back, since it's the same static for the life of the kernel.
    pub(super) fn table_phys() -> u32 {
        let mut guard = WINDOW.lock();
        if !IDENTITY_FILLED.swap(true, Ordering::AcqRel) {
            for tab in 0..SRC_TAB {
                let frame = DIR_INDEX as u32 * 1024 + tab as u32;
                guard.entries[tab].set(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::GLOBAL);
            }
        }
        core::ptr::from_ref(&*guard) as u32
    }

    /// Maps `frame` present+writable at the window's SRC slot, runs `f`
    /// with a pointer to its first byte, then unmaps it. Held under
    /// `WINDOW`'s lock throughout, since the slot is one physical PTE
    /// shared by every address space.
    pub fn with_frame<R>(frame: u32, f: impl FnOnce(*mut u8) -> R) -> R {
        let mut guard = WINDOW.lock();
        guard.entries[SRC_TAB].set(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        invalidate_tlb(SRC_VADDR);
        let result = f(SRC_VADDR as *mut u8);
        guard.entries[SRC_TAB].clear();
        invalidate_tlb(SRC_VADDR);
        result
    }

    /// Copies one physical frame's contents into another, mapping both at
    /// once so the copy is a single `memcpy` rather than a staged
    /// round-trip through a kernel buffer.
    pub fn copy_frame(src_frame: u32, dst_frame: u32) {
        let mut guard = WINDOW.lock();
        guard.entries[SRC_TAB].set(src_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        guard.entries[DST_TAB].set(dst_frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        invalidate_tlb(SRC_VADDR);
        invalidate_tlb(DST_VADDR);
        // SAFETY: both slots were just mapped present+writable over
        // distinct, freshly-(re)used physical frames.
        unsafe {
            core::ptr::copy_nonoverlapping(SRC_VADDR as *const u8, DST_VADDR as *mut u8, PAGE_SIZE);
        }
        guard.entries[SRC_TAB].clear();
        guard.entries[DST_TAB].clear();
        invalidate_tlb(SRC_VADDR);
        invalidate_tlb(DST_VADDR);
    }
}
