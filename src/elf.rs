//! ELF loader: validates a 32-bit ELF executable pulled from the
//! RAM disk, installs one `VmRange` per `PT_LOAD` segment plus a fixed-size
//! stack, copies and zero-extends segment bytes, and re-marks read-only
//! segments immutable.
//!
//! Segments are assumed page-aligned in both `p_vaddr` and `p_offset` — true
//! of every binary in `user_programs/`, built with a linker script that pads
//! each `PT_LOAD` segment to a page boundary, so this loader never has to
//! reconcile a segment's first partial page against a neighbor's.

use alloc::vec::Vec;

use crate::config::{DEFAULT_USER_STACK_PAGES, PAGE_SIZE, USER_MEM_START, USER_STACK_TOP};
use crate::error::{KernelError, Result};
use crate::mm::address_space::{AddressSpace, SegmentExtents, VmRange};
use crate::mm::paging::EntryFlags;
use crate::ramdisk;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_32: u8 = 1;
const ELF_DATA_LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_EXEC: u32 = 1;
const PF_WRITE: u32 = 2;

/// Where a freshly loaded image starts executing and where its stack sits.
#[derive(Debug, Clone, Copy)]
pub struct Loaded {
    pub entry: u32,
    pub stack_top: u32,
}

#[derive(Clone, Copy)]
struct ProgramHeader {
    kind: u32,
    offset: u32,
    vaddr: u32,
    filesz: u32,
    memsz: u32,
    flags: u32,
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(KernelError::NotAnElf)
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(KernelError::NotAnElf)
}

/// Validates the ELF header and returns the entry point plus every program
/// header entry, in file order.
fn parse_headers(image: &[u8]) -> Result<(u32, Vec<ProgramHeader>)> {
    if image.len() < 52 || image[0..4] != ELF_MAGIC {
        return Err(KernelError::NotAnElf);
    }
    if image[4] != ELF_CLASS_32 || image[5] != ELF_DATA_LSB {
        return Err(KernelError::NotAnElf);
    }
    if read_u16(image, 16)? != ET_EXEC || read_u16(image, 18)? != EM_386 {
        return Err(KernelError::NotAnElf);
    }
    let entry = read_u32(image, 24)?;
    let phoff = read_u32(image, 28)? as usize;
    let phentsize = read_u16(image, 42)? as usize;
    let phnum = read_u16(image, 44)? as usize;

    let mut headers = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let base = phoff + i * phentsize;
        headers.push(ProgramHeader {
            kind: read_u32(image, base)?,
            offset: read_u32(image, base + 4)?,
            vaddr: read_u32(image, base + 8)?,
            filesz: read_u32(image, base + 16)?,
            memsz: read_u32(image, base + 20)?,
            flags: read_u32(image, base + 24)?,
        });
    }
    Ok((entry, headers))
}

fn back_range(address_space: &mut AddressSpace, range: VmRange) -> Result<()> {
    let mut addr = range.start;
    while addr < range.end() {
        address_space.back_page(addr)?;
        addr += PAGE_SIZE as u32;
    }
    Ok(())
}

fn install_segment(address_space: &mut AddressSpace, image: &[u8], ph: &ProgramHeader, segments: &mut SegmentExtents) -> Result<()> {
    if ph.vaddr < USER_MEM_START {
        return Err(KernelError::VmCannotMap);
    }
    let range = address_space.install_range(ph.vaddr, ph.memsz.max(ph.filesz))?;
    back_range(address_space, range)?;

    let file_end = ph.offset.checked_add(ph.filesz).ok_or(KernelError::NotAnElf)?;
    let file_bytes = image
        .get(ph.offset as usize..file_end as usize)
        .ok_or(KernelError::NotAnElf)?;
    address_space.write_bytes(range.start, file_bytes)?;

    if ph.memsz > ph.filesz {
        let bss_len = (ph.memsz - ph.filesz) as usize;
        let zeros = alloc::vec![0u8; bss_len];
        address_space.write_bytes(range.start + ph.filesz, &zeros)?;
    }

    if ph.flags & PF_WRITE == 0 {
        address_space.set_range_attrs(range, EntryFlags::PRESENT | EntryFlags::USER);
        if ph.flags & PF_EXEC != 0 {
            segments.text = Some(range);
        } else {
            segments.rodata = Some(range);
        }
    } else {
        segments.data = Some(range);
    }
    Ok(())
}

/// `exec`/`task::bootstrap`'s ELF loader. Looks `filename` up on the
/// RAM disk, installs every `PT_LOAD` segment and a fixed-size user stack
/// into `address_space`, and returns where to start executing.
///
/// On any failure, every page backed so far is released before returning,
/// leaving `address_space` with no user-half frames held (the caller still
/// owns the now-empty range records and, for `exec`, simply drops the
/// transient address space).
pub fn load(filename: &str, address_space: &mut AddressSpace) -> Result<Loaded> {
    let image = ramdisk::lookup(filename).ok_or(KernelError::FileNotFound)?;
    let (entry, headers) = parse_headers(image)?;

    let mut segments = SegmentExtents::default();
    for ph in headers.iter().filter(|ph| ph.kind == PT_LOAD) {
        if let Err(err) = install_segment(address_space, image, ph, &mut segments) {
            address_space.unback_all_ranges();
            return Err(err);
        }
    }

    let stack_len = (DEFAULT_USER_STACK_PAGES * PAGE_SIZE) as u32;
    let stack_start = USER_STACK_TOP - stack_len;
    let stack_range = match address_space.install_range(stack_start, stack_len) {
        Ok(range) => range,
        Err(err) => {
            address_space.unback_all_ranges();
            return Err(err);
        }
    };
    if let Err(err) = back_range(address_space, stack_range) {
        address_space.unback_all_ranges();
        return Err(err);
    }
    segments.stack = Some(stack_range);
    address_space.segments = segments;

    Ok(Loaded {
        entry,
        stack_top: USER_STACK_TOP,
    })
}
