//! Global descriptor table and task-state segment.
//!
//! Hand-rolled rather than built on a crate abstraction: the 32-bit segment
//! descriptor layout is simple enough, and every descriptor we need (flat
//! kernel/user code+data, one TSS) is fixed at boot, so there is nothing a
//! generic GDT builder buys us that a `[u64; N]` table doesn't already give.

use core::mem::size_of;

use lazy_static::lazy_static;

use crate::config::RPL_RING3;

/// One 8-byte GDT descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    const fn null() -> Self {
        Self(0)
    }

    /// Flat code/data descriptor covering all 4 GiB, access byte and flags
    /// chosen by the caller.
    const fn flat(access: u8, flags: u8) -> Self {
        let limit: u64 = 0xFFFFF;
        let base: u64 = 0;
        let mut value: u64 = 0;
        value |= limit & 0xFFFF;
        value |= (base & 0xFFFFFF) << 16;
        value |= (access as u64) << 40;
        value |= ((limit >> 16) & 0xF) << 48;
        value |= (flags as u64) << 52;
        value |= ((base >> 24) & 0xFF) << 56;
        Self(value)
    }

    /// TSS descriptor (system segment, base/limit point at the `Tss` struct).
    fn tss(tss: &'static Tss) -> Self {
        let base = core::ptr::from_ref(tss) as u64;
        let limit = (size_of::<Tss>() - 1) as u64;
        let access: u64 = 0x89; // present, ring0, type=0x9 (32-bit TSS, available)
        let mut value: u64 = 0;
        value |= limit & 0xFFFF;
        value |= (base & 0xFFFFFF) << 16;
        value |= access << 40;
        value |= ((limit >> 16) & 0xF) << 48;
        value |= ((base >> 24) & 0xFF) << 56;
        Self(value)
    }
}

const ACCESS_KERNEL_CODE: u8 = 0x9A;
const ACCESS_KERNEL_DATA: u8 = 0x92;
const ACCESS_USER_CODE: u8 = 0xFA;
const ACCESS_USER_DATA: u8 = 0xF2;
const FLAGS_32BIT_PAGE_GRANULAR: u8 = 0xC;

/// Selector indices, fixed by construction order below.
pub const KERNEL_CODE_SELECTOR: u16 = 1 * 8;
pub const KERNEL_DATA_SELECTOR: u16 = 2 * 8;
pub const USER_CODE_SELECTOR: u16 = (3 * 8) | RPL_RING3;
pub const USER_DATA_SELECTOR: u16 = (4 * 8) | RPL_RING3;
pub const TSS_SELECTOR: u16 = 5 * 8;

/// 32-bit task-state segment. Only `esp0`/`ss0` are used (ring-3 → ring-0
/// stack switch on interrupt/trap entry); no hardware task-switching.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Tss {
    prev_task_link: u16,
    _reserved0: u16,
    pub esp0: u32,
    pub ss0: u16,
    _reserved1: u16,
    esp1: u32,
    ss1: u16,
    _reserved2: u16,
    esp2: u32,
    ss2: u16,
    _reserved3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _reserved4: u16,
    cs: u16,
    _reserved5: u16,
    ss: u16,
    _reserved6: u16,
    ds: u16,
    _reserved7: u16,
    fs: u16,
    _reserved8: u16,
    gs: u16,
    _reserved9: u16,
    ldt_selector: u16,
    _reserved10: u16,
    _trap: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            prev_task_link: 0,
            _reserved0: 0,
            esp0: 0,
            ss0: 0,
            _reserved1: 0,
            esp1: 0,
            ss1: 0,
            _reserved2: 0,
            esp2: 0,
            ss2: 0,
            _reserved3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _reserved4: 0,
            cs: 0,
            _reserved5: 0,
            ss: 0,
            _reserved6: 0,
            ds: 0,
            _reserved7: 0,
            fs: 0,
            _reserved8: 0,
            gs: 0,
            _reserved9: 0,
            ldt_selector: 0,
            _reserved10: 0,
            _trap: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }

    /// Sets the ring-0 stack the CPU switches to on a privilege-level change.
    pub fn set_kernel_stack(&mut self, esp0: u32) {
        self.esp0 = esp0;
        self.ss0 = KERNEL_DATA_SELECTOR;
    }
}

lazy_static! {
    pub static ref TSS: spin::Mutex<Tss> = spin::Mutex::new(Tss::new());
}

/// 6 entries: null, kernel code, kernel data, user code, user data, TSS.
struct Gdt([Descriptor; 6]);

lazy_static! {
    static ref GDT: Gdt = {
        // SAFETY: `TSS` is a `'static` lazily-initialized mutex; we only ever
        // read its address here, never alias its contents mutably while the
        // descriptor exists.
        let tss_ref: &'static Tss = unsafe { &*(&raw const *TSS.lock()) };
        Gdt([
            Descriptor::null(),
            Descriptor::flat(ACCESS_KERNEL_CODE, FLAGS_32BIT_PAGE_GRANULAR),
            Descriptor::flat(ACCESS_KERNEL_DATA, FLAGS_32BIT_PAGE_GRANULAR),
            Descriptor::flat(ACCESS_USER_CODE, FLAGS_32BIT_PAGE_GRANULAR),
            Descriptor::flat(ACCESS_USER_DATA, FLAGS_32BIT_PAGE_GRANULAR),
            Descriptor::tss(tss_ref),
        ])
    };
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Installs the GDT and TSS and reloads every segment register.
///
/// # Safety
/// Must run once, early in boot, before any ring-3 transition or interrupt
/// delivery; reloads every segment register and the task register.
pub unsafe fn init() {
    let ptr = DescriptorTablePointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: core::ptr::from_ref(&*GDT) as u32,
    };
    // SAFETY: `ptr` describes the `'static` GDT constructed above; reloading
    // segment registers with the new kernel selectors immediately after is
    // required to make the new table take effect safely, and `ltr` loads a
    // valid TSS selector into the task register.
    unsafe {
        core::arch::asm!("lgdt [{0}]", in(reg) &ptr, options(readonly, nostack, preserves_flags));
        reload_segments();
        core::arch::asm!("ltr {0:x}", in(reg) TSS_SELECTOR, options(nostack, preserves_flags));
    }
}

/// # Safety
/// Caller must have just loaded a GDT containing the selectors used here.
unsafe fn reload_segments() {
    // SAFETY: `KERNEL_CODE_SELECTOR`/`KERNEL_DATA_SELECTOR` are valid
    // selectors in the GDT just loaded by `init`.
    unsafe {
        core::arch::asm!(
            "push {code_sel}",
            "lea {tmp}, [1f]",
            "push {tmp}",
            "retf",
            "1:",
            "mov ax, {data_sel:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            code_sel = in(reg) u32::from(KERNEL_CODE_SELECTOR),
            data_sel = in(reg) KERNEL_DATA_SELECTOR,
            tmp = out(reg) _,
            options(nostack),
        );
    }
}
