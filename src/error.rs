//! Kernel-wide error taxonomy.
//!
//! Internal subroutines return `Result<T, KernelError>`; the syscall
//! dispatcher collapses the error (or success value) to the signed-integer
//! ABI at the trap boundary.

use core::fmt;

/// The closed set of error kinds a kernel subroutine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Heap or physical-frame exhaustion.
    OutOfMemory,
    /// Unknown vector, malformed packet, or failed argument check.
    InvalidSyscall,
    /// ELF header rejected.
    NotAnElf,
    /// Range below the user-mem window or colliding with the kernel window.
    VmCannotMap,
    /// RAM-disk lookup miss.
    FileNotFound,
    /// No such child task or thread.
    TaskNotFound,
    /// `ls` output buffer too short.
    BufferTooSmall,
    /// User pointer outside any installed range.
    AddressNotPresent,
    /// `new_pages`/`remove_pages` alignment or overlap failure.
    PageErr,
    /// Any other argument-validation failure.
    BadSysParam,
    /// Reserved for not-yet-implemented paths.
    Unimplemented,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidSyscall => "invalid syscall",
            Self::NotAnElf => "not an ELF image",
            Self::VmCannotMap => "cannot map virtual range",
            Self::FileNotFound => "file not found",
            Self::TaskNotFound => "no such task or thread",
            Self::BufferTooSmall => "buffer too small",
            Self::AddressNotPresent => "address not present",
            Self::PageErr => "page alignment or overlap error",
            Self::BadSysParam => "bad syscall parameter",
            Self::Unimplemented => "unimplemented",
        };
        f.write_str(msg)
    }
}

impl KernelError {
    /// The syscall-boundary representation: a small negative integer,
    /// distinct per kind, chosen so `0` and all positive values remain free
    /// for successful results.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::OutOfMemory => -1,
            Self::InvalidSyscall => -2,
            Self::NotAnElf => -3,
            Self::VmCannotMap => -4,
            Self::FileNotFound => -5,
            Self::TaskNotFound => -6,
            Self::BufferTooSmall => -7,
            Self::AddressNotPresent => -8,
            Self::PageErr => -9,
            Self::BadSysParam => -10,
            Self::Unimplemented => -11,
        }
    }
}

impl From<KernelError> for i32 {
    fn from(err: KernelError) -> Self {
        err.code()
    }
}

/// Crate-wide result alias used everywhere a subroutine can fail.
pub type Result<T> = core::result::Result<T, KernelError>;
