//! Read-only RAM disk: a name -> blob table built once at boot from the
//! Multiboot2 module tags `boot::parse` collects, and consulted by the ELF
//! loader and the `ls` syscall. Modules live in memory the bootloader
//! already reserved, so lookups borrow their bytes directly with no copy.

use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

struct Entry {
    name: String,
    data: &'static [u8],
}

static RAMDISK: Mutex<Vec<Entry>> = Mutex::new(Vec::new());

/// Installs the module table gathered from the Multiboot2 info structure.
/// Called once, early in `kernel_main`, before `task::bootstrap` looks up
/// the init program.
pub fn init(modules: Vec<(String, &'static [u8])>) {
    let mut table = RAMDISK.lock();
    table.clear();
    table.extend(modules.into_iter().map(|(name, data)| Entry { name, data }));
}

/// Looks up a module's bytes by name (`C7` "RAM-disk lookup").
#[must_use]
pub fn lookup(name: &str) -> Option<&'static [u8]> {
    RAMDISK.lock().iter().find(|e| e.name == name).map(|e| e.data)
}

/// Every module name currently loaded, for the `ls` syscall. Returned as an
/// owned `Vec` since the caller copies names out to a user buffer anyway.
#[must_use]
pub fn list() -> Vec<String> {
    RAMDISK.lock().iter().map(|e| e.name.clone()).collect()
}
