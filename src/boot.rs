//! Multiboot2 boot adapter: turns the loader-provided boot information
//! structure into the two things the rest of boot-up needs — usable RAM
//! regions for `mm::frame_allocator::init`, and the RAM-disk module table
//! for `ramdisk::init` — and nothing else. Everything GRUB/the Multiboot2
//! spec offers beyond that (ELF section headers, ACPI tags, framebuffer
//! info) is parsed and discarded.

use alloc::string::String;
use alloc::vec::Vec;

use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

use crate::config::PAGE_SIZE;

/// Everything `kernel_main` needs out of the boot handoff.
pub struct BootInfo {
    /// `(start_frame, end_frame)` pairs of RAM marked available by the
    /// firmware/bootloader memory map, in frame numbers.
    pub usable_regions: Vec<(u32, u32)>,
    /// RAM-disk entries: module name paired with its in-memory bytes.
    pub modules: Vec<(String, &'static [u8])>,
}

/// Parses the Multiboot2 info structure at `info_addr` (the value the
/// bootloader left in `EBX`). `magic` is the value left in `EAX`; it is only
/// checked, never otherwise used.
///
/// # Safety
/// `info_addr` must be the physical address of a valid Multiboot2
/// information structure, still resident and unmodified since boot, and
/// `magic` must be the corresponding value the bootloader left in `EAX`.
pub unsafe fn parse(magic: u32, info_addr: u32) -> BootInfo {
    assert_eq!(magic, multiboot2::MAGIC, "not booted via a Multiboot2 loader");

    // SAFETY: caller's contract guarantees `info_addr` addresses a valid,
    // still-resident Multiboot2 info structure.
    let boot_info = unsafe {
        BootInformation::load(info_addr as *const BootInformationHeader).expect("malformed Multiboot2 info structure")
    };

    let usable_regions = boot_info
        .memory_map_tag()
        .expect("bootloader did not provide a memory map tag")
        .memory_areas()
        .iter()
        .filter(|area| area.typ() == MemoryAreaType::Available)
        .map(|area| {
            let start = (area.start_address() as u32) / PAGE_SIZE as u32;
            let end = (area.end_address() as u32) / PAGE_SIZE as u32;
            (start, end)
        })
        .collect();

    let modules = boot_info
        .module_tags()
        .map(|module| {
            let name = String::from(module.name().unwrap_or("<unnamed>"));
            let start = module.start_address() as usize;
            let end = module.end_address() as usize;
            // SAFETY: the bootloader reserves every module's backing pages
            // from the memory map above, so this range stays valid and
            // immutable for the kernel's lifetime.
            let bytes: &'static [u8] = unsafe { core::slice::from_raw_parts(start as *const u8, end - start) };
            (name, bytes)
        })
        .collect();

    BootInfo {
        usable_regions,
        modules,
    }
}
