//! Kernel-wide tunables.
//!
//! Centralizes the constants the component contracts refer to as
//! "a configured threshold" so every subsystem reads the same values.

/// First virtual address available to user-mode ranges. Everything below
/// this is the kernel window: identity-mapped, global, shared by every
/// address space.
pub const USER_MEM_START: u32 = 0x0100_0000;

/// Size of one physical frame / virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Size of a kernel stack, and therefore the alignment used to recover the
/// owning TCB from the current stack pointer (see `task::current_thread`).
/// Must remain a power of two.
pub const KERNEL_STACK_SIZE: usize = 8192;

/// Default stack size installed by the ELF loader for a freshly exec'd task.
pub const DEFAULT_USER_STACK_PAGES: usize = 2;

/// Highest virtual address a task's stack may occupy; the stack grows down
/// from here.
pub const USER_STACK_TOP: u32 = 0xC000_0000;

/// Per-task quota on bytes allocated via `new_pages`.
pub const ALLOC_MEM_QUOTA: usize = 4 * 1024 * 1024;

/// Scheduler time quantum, in timer ticks.
pub const TIME_QUANTUM_TICKS: u32 = 1;

/// PIC remap offsets (IRQ0 and IRQ8 base vectors).
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Interrupt vector used for the timer IRQ (IRQ0).
pub const TIMER_INTERRUPT_VECTOR: u8 = PIC_1_OFFSET;
/// Interrupt vector used for the keyboard IRQ (IRQ1).
pub const KEYBOARD_INTERRUPT_VECTOR: u8 = PIC_1_OFFSET + 1;

/// Software interrupt vector used for the syscall trap gate.
pub const SYSCALL_INTERRUPT_VECTOR: u8 = 0x80;

/// Ring-3 code/data selector RPL bits, ORed onto a GDT selector index.
pub const RPL_RING3: u16 = 3;

/// Longest `exec` filename or argv string the syscall layer will copy in
/// from user memory before giving up with `BadSysParam`.
pub const MAX_USER_STRING_LEN: u32 = 256;

/// Most `argv` entries `exec` will walk before giving up with `BadSysParam`.
pub const MAX_ARGC: usize = 16;
