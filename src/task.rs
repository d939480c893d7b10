//! Task / thread lifecycle: TCBs live in `sched`; this module owns the
//! task record, parent/child bookkeeping, and every trapped lifecycle
//! syscall (`fork`, `thread_fork`, `exec`, `wait`, `vanish`, `task_vanish`,
//! `set_status`, `gettid`, `cas2i_runflag`, `yield`, `sleep`, `new_pages`,
//! `remove_pages`).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::arch::gdt::{TSS, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::arch::isr::{trap_return_tail, TrapFrame};
use crate::config::{ALLOC_MEM_QUOTA, KERNEL_STACK_SIZE, PAGE_SIZE, USER_MEM_START};
use crate::console;
use crate::elf;
use crate::error::{KernelError, Result};
use crate::mm::address_space::VmRange;
use crate::mm::paging::EntryFlags;
use crate::mm::AddressSpace;
use crate::sched::{self, Context, Link, RunState, Tcb};
use crate::sync::{IrqSpinlock, Semaphore};

/// Every live TCB, used to resolve an opaque `tid` (the TCB's own address)
/// back into a pointer without trusting user-supplied arithmetic.
static ALL_THREADS: IrqSpinlock<Vec<NonNull<Tcb>>> = IrqSpinlock::new(Vec::new());

/// Whether a task is still running or has become a zombie awaiting reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Zombie,
}

/// Intrusive FIFO list of a task's threads, keyed on `Tcb::task_link`.
/// `thread_fork` front-inserts, which keeps newer threads cheap to find
/// first on a force-kill walk.
#[derive(Default)]
struct ThreadList {
    head: Option<NonNull<Tcb>>,
}

impl ThreadList {
    fn push_front(&mut self, mut thread: NonNull<Tcb>) {
        // SAFETY: caller holds the owning task's thread-list lock.
        unsafe {
            thread.as_mut().task_link = Link {
                prev: None,
                next: self.head,
            };
        }
        if let Some(mut head) = self.head {
            // SAFETY: see above.
            unsafe { head.as_mut().task_link.prev = Some(thread) };
        }
        self.head = Some(thread);
    }

    fn remove(&mut self, mut thread: NonNull<Tcb>) {
        // SAFETY: see `push_front`.
        let (prev, next) = unsafe {
            let link = thread.as_ref().task_link;
            (link.prev, link.next)
        };
        match prev {
            // SAFETY: see `push_front`.
            Some(mut prev) => unsafe { prev.as_mut().task_link.next = next },
            None => self.head = next,
        }
        if let Some(mut next) = next {
            // SAFETY: see `push_front`.
            unsafe { next.as_mut().task_link.prev = prev };
        }
        // SAFETY: see `push_front`.
        unsafe { thread.as_mut().task_link = Link::default() };
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn iter(&self) -> ThreadListIter {
        ThreadListIter { next: self.head }
    }
}

struct ThreadListIter {
    next: Option<NonNull<Tcb>>,
}

impl Iterator for ThreadListIter {
    type Item = NonNull<Tcb>;
    fn next(&mut self) -> Option<NonNull<Tcb>> {
        let current = self.next?;
        // SAFETY: the list is only mutated under the owning task's lock,
        // which the caller of `iter` holds for the duration of the walk.
        self.next = unsafe { current.as_ref().task_link.next };
        Some(current)
    }
}

/// A task: one address space, one or more threads, parent/child bookkeeping.
pub struct Task {
    pub address_space: IrqSpinlock<AddressSpace>,
    threads: IrqSpinlock<ThreadList>,
    /// Binary semaphore serializing fork/exec/wait/vanish structural
    /// changes to this task (the "fork lock").
    pub fork_lock: Semaphore,
    children: IrqSpinlock<Vec<NonNull<Task>>>,
    parent: Option<NonNull<Task>>,
    /// Parent blocks here awaiting a zombie child (the "vultures" semaphore).
    vultures: Semaphore,
    state: IrqSpinlock<TaskState>,
    exit_status: AtomicI32,
    quota_used: AtomicU32,
    /// The task's first thread's tid, doubling as the task's own identifier
    /// for `wait`'s return value once every thread (including that one) has
    /// vanished and the thread list is empty.
    primordial_tid: AtomicU32,
}

impl Task {
    fn new(parent: Option<NonNull<Task>>) -> Box<Self> {
        let parent_as = parent.map(|p| {
            // SAFETY: `parent` outlives its children (reaped only after
            // every child is accounted for).
            let parent_ref = unsafe { p.as_ref() };
            parent_ref.address_space.lock()
        });
        let address_space = AddressSpace::init(parent_as.as_deref());
        drop(parent_as);
        Box::new(Self {
            address_space: IrqSpinlock::new(address_space),
            threads: IrqSpinlock::new(ThreadList::default()),
            fork_lock: Semaphore::new(1),
            children: IrqSpinlock::new(Vec::new()),
            parent,
            vultures: Semaphore::new(0),
            state: IrqSpinlock::new(TaskState::Running),
            exit_status: AtomicI32::new(0),
            quota_used: AtomicU32::new(0),
            primordial_tid: AtomicU32::new(0),
        })
    }

    fn charge_quota(&self, bytes: u32) -> Result<()> {
        let used = self.quota_used.load(Ordering::SeqCst);
        let new_used = used.checked_add(bytes).ok_or(KernelError::OutOfMemory)?;
        if new_used as usize > ALLOC_MEM_QUOTA {
            return Err(KernelError::OutOfMemory);
        }
        self.quota_used.store(new_used, Ordering::SeqCst);
        Ok(())
    }

    fn release_quota(&self, bytes: u32) {
        self.quota_used.fetch_sub(bytes, Ordering::SeqCst);
    }
}

fn register_thread(thread: NonNull<Tcb>) {
    ALL_THREADS.lock().push(thread);
}

fn unregister_thread(thread: NonNull<Tcb>) {
    ALL_THREADS.lock().retain(|t| *t != thread);
}

fn find_thread_by_tid(tid: u32) -> Option<NonNull<Tcb>> {
    ALL_THREADS
        .lock()
        .iter()
        .copied()
        .find(|t| t.as_ptr() as u32 == tid)
}

/// Allocates a fresh `KERNEL_STACK_SIZE`-aligned kernel stack with a `Tcb`
/// constructed at its low address, so the current thread can always be
/// recovered by masking `esp` down to that alignment.
fn new_kernel_stack(task: NonNull<Task>) -> NonNull<Tcb> {
    let layout = Layout::from_size_align(KERNEL_STACK_SIZE, KERNEL_STACK_SIZE)
        .expect("KERNEL_STACK_SIZE is a valid power-of-two layout");
    // SAFETY: `layout` has non-zero size.
    let base = unsafe { alloc::alloc::alloc(layout) };
    assert!(!base.is_null(), "kernel stack allocation failed");
    let tcb_ptr = base.cast::<Tcb>();
    // SAFETY: `tcb_ptr` is freshly allocated, correctly aligned
    // (`KERNEL_STACK_SIZE` alignment exceeds `Tcb`'s), and large enough.
    unsafe {
        tcb_ptr.write(Tcb {
            context: Context::default(),
            task,
            state: RunState::Runnable,
            sleep_ticks: 0,
            run_flag: AtomicU32::new(0),
            task_link: Link::default(),
            sched_link: Link::default(),
            is_idle: false,
        });
        NonNull::new_unchecked(tcb_ptr)
    }
}

/// Writes the five-dword hardware iret frame plus the four-dword
/// callee-saved prologue `context_switch` expects, so that the first
/// switch into this thread lands in ring 3 at `(entry, user_esp)`.
fn prepare_initial_user_entry(thread: &mut Tcb, entry: u32, user_esp: u32) {
    let stack_top = (thread as *mut Tcb as u32) + KERNEL_STACK_SIZE as u32;
    // Layout from high to low: iret frame, return address, 4 saved GPRs.
    let iret_words: [u32; 5] = [entry, u32::from(USER_CODE_SELECTOR), 0x0000_0202, user_esp, u32::from(USER_DATA_SELECTOR)];
    let mut addr = stack_top - (iret_words.len() as u32) * 4;
    for word in iret_words {
        // SAFETY: `addr` lies strictly within this thread's freshly
        // allocated kernel stack.
        unsafe { (addr as *mut u32).write(word) };
        addr += 4;
    }
    let iret_base = stack_top - (iret_words.len() as u32) * 4;
    let return_addr_slot = iret_base - 4;
    // SAFETY: see above.
    unsafe { (return_addr_slot as *mut u32).write(enter_user_mode as usize as u32) };
    let gprs_base = return_addr_slot - 4 * 4;
    // SAFETY: see above; zero-initialize edi/esi/ebx/ebp for a fresh thread.
    unsafe {
        core::ptr::write_bytes(gprs_base as *mut u32, 0, 4);
    }
    thread.context.esp = gprs_base;
}

/// Trampoline a freshly created thread's first `context_switch` lands on:
/// loads user data segment selectors and `iretd`s into ring 3.
///
/// # Safety
/// Only ever reached via `context_switch`'s `ret`, with the five-dword
/// iret frame built by `prepare_initial_user_entry` immediately above the
/// current stack pointer.
#[unsafe(naked)]
unsafe extern "C" fn enter_user_mode() {
    core::arch::naked_asm!(
        "mov ax, {user_data:x}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "iretd",
        user_data = const USER_DATA_SELECTOR,
    );
}

/// Current task, derived from the current thread.
#[must_use]
pub fn current_task() -> NonNull<Task> {
    // SAFETY: every live thread's `task` pointer is valid for as long as the
    // thread runs.
    unsafe { sched::current_thread().as_ref().task }
}

/// `gettid`: the current thread's opaque identifier.
#[must_use]
pub fn gettid() -> u32 {
    // SAFETY: `current_thread` always returns a live TCB.
    unsafe { sched::current_thread().as_ref().tid() }
}

/// Builds the idle task and the init task, enables paging, and starts the
/// timer. Called once from `kernel_main` after the frame allocator, address
/// spaces, trap tables, and scheduler are initialized and before interrupts
/// are enabled. Returns the init task's entry parameters so the caller can
/// hand them to `exec`-style loading before the idle loop is entered.
pub fn bootstrap(init_program: &str) -> ! {
    let idle_task = Task::new(None);
    let idle_task_ptr = NonNull::from(Box::leak(idle_task));
    let idle_thread = new_kernel_stack(idle_task_ptr);
    // SAFETY: `idle_thread` was just constructed and is not yet visible to
    // the scheduler.
    unsafe { idle_thread.as_ptr().as_mut().expect("non-null").is_idle = true };
    register_thread(idle_thread);
    sched::set_idle(idle_thread);

    let init_task = Task::new(None);
    let init_task_ptr = NonNull::from(Box::leak(init_task));
    let init_thread = new_kernel_stack(init_task_ptr);
    register_thread(init_thread);
    // SAFETY: `init_task_ptr` was just constructed, single-owner until
    // shared below.
    unsafe {
        init_task_ptr
            .as_ref()
            .threads
            .lock()
            .push_front(init_thread);
        init_task_ptr
            .as_ref()
            .primordial_tid
            .store(init_thread.as_ref().tid(), Ordering::SeqCst);
    }

    // SAFETY: single-threaded boot sequence; `init_task_ptr` has exclusive
    // access to its own fresh address space.
    let loaded = unsafe {
        let mut address_space = init_task_ptr.as_ref().address_space.lock();
        elf::load(init_program, &mut address_space)
    };
    let loaded = loaded.unwrap_or_else(|err| panic!("failed to load {init_program}: {err}"));

    // SAFETY: `init_thread` has not yet been scheduled; writing its initial
    // context is exclusive.
    unsafe {
        prepare_initial_user_entry(init_thread.as_ptr().as_mut().expect("non-null"), loaded.entry, loaded.stack_top);
    }
    sched::add(init_thread);

    // Enable paging now that the idle task's address space (identity-mapped
    // kernel window) is ready to be the active page directory. `CR4.PSE`
    // must be set first: the kernel window's PDEs are 4 MiB pages
    // (`populate_kernel_window`), and the CPU only honors their `PS` bit
    // once PSE is on.
    // SAFETY: called once, before any user code runs; `idle_task_ptr`'s
    // page directory maps the kernel window identically to how the CPU is
    // already executing, so turning on `CR4.PSE`/`CR0.PG` is transparent.
    unsafe {
        idle_task_ptr.as_ref().address_space.lock().load_cr3();
        core::arch::asm!(
            "mov eax, cr4",
            "or eax, 0x10",
            "mov cr4, eax",
            "mov eax, cr0",
            "or eax, 0x80000000",
            "mov cr0, eax",
            out("eax") _,
            options(nostack, preserves_flags),
        );
    }
    TSS.lock().set_kernel_stack(idle_thread.as_ptr() as u32 + KERNEL_STACK_SIZE as u32);

    crate::timer::start();

    // Every gate this kernel installs is now live (arch::init ran in
    // kernel_main before this function), so it is safe to start taking
    // interrupts. Everything up to here ran with IF clear, as GRUB leaves
    // it at handoff.
    // SAFETY: the IDT, PIC remap, and kernel stacks are all installed; this
    // is the one-time transition off GRUB's IF=0 handoff state, after which
    // the timer IRQ (and therefore preemption) can fire.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };

    sched::run_idle_loop()
}

/// `fork`. Under the parent's fork lock: creates a child task, shares
/// every non-kernel range COW (both sides marked read-only), clones the
/// syscall-return frame so the child resumes with `eax = 0`, and adds the
/// child's initial thread to the run queue.
pub fn fork(parent_frame: &TrapFrame) -> Result<u32> {
    let parent_task = current_task();
    // SAFETY: `parent_task` is the live current task.
    let parent_ref = unsafe { parent_task.as_ref() };
    parent_ref.fork_lock.wait();

    let child_task = Task::new(Some(parent_task));
    let child_task_ptr = NonNull::from(Box::leak(child_task));

    let ranges: Vec<VmRange> = {
        let parent_as = parent_ref.address_space.lock();
        parent_as.ranges.iter().copied().filter(|r| r.start != 0).collect()
    };
    for range in ranges {
        let mut parent_as = parent_ref.address_space.lock();
        // SAFETY: `child_task_ptr` is exclusively owned until published below.
        let mut child_as = unsafe { child_task_ptr.as_ref().address_space.lock() };
        if child_as.install_range(range.start, range.len).is_err() {
            continue;
        }
        child_as.share_physical(&parent_as, range);
        child_as.set_range_attrs(range, EntryFlags::PRESENT | EntryFlags::USER);
        parent_as.set_range_attrs(range, EntryFlags::PRESENT | EntryFlags::USER);
    }

    let child_thread = new_kernel_stack(child_task_ptr);
    register_thread(child_thread);
    // SAFETY: `child_task_ptr` is fully constructed above.
    unsafe {
        child_task_ptr.as_ref().threads.lock().push_front(child_thread);
        child_task_ptr
            .as_ref()
            .primordial_tid
            .store(child_thread.as_ref().tid(), Ordering::SeqCst);
    }

    let mut child_frame = *parent_frame;
    child_frame.eax = 0;
    // SAFETY: `child_thread` has not yet been scheduled; its stack is
    // freshly allocated and large enough for a `TrapFrame` plus prologue.
    unsafe {
        let stack_top = child_thread.as_ptr() as u32 + KERNEL_STACK_SIZE as u32;
        let frame_addr = stack_top - core::mem::size_of::<TrapFrame>() as u32;
        (frame_addr as *mut TrapFrame).write(child_frame);
        let return_addr_slot = frame_addr - 4;
        (return_addr_slot as *mut u32).write(trap_return_tail as usize as u32);
        let gprs_base = return_addr_slot - 4 * 4;
        core::ptr::write_bytes(gprs_base as *mut u32, 0, 4);
        child_thread.as_ptr().as_mut().expect("non-null").context.esp = gprs_base;
    }

    // Parent's PTEs for the shared ranges were just downgraded to
    // read-only; flush every entry touched above.
    {
        let parent_as = parent_ref.address_space.lock();
        for range in parent_as.ranges.iter().copied().filter(|r| r.start != 0) {
            let mut addr = range.start;
            while addr < range.end() {
                crate::mm::paging::invalidate_tlb(addr);
                addr += PAGE_SIZE as u32;
            }
        }
    }

    parent_ref.children.lock().push(child_task_ptr);
    sched::add(child_thread);
    parent_ref.fork_lock.signal();
    Ok(child_thread.as_ref().tid())
}

/// `thread_fork`: a new thread sharing the caller's address space.
pub fn thread_fork() -> Result<u32> {
    let task = current_task();
    // SAFETY: `task` is the live current task.
    let thread = new_kernel_stack(task);
    register_thread(thread);
    // SAFETY: see above.
    unsafe { task.as_ref().threads.lock().push_front(thread) };

    let current = sched::current_thread();
    // SAFETY: `current` is the live current thread; its trap frame sits at
    // the top of its kernel stack for the duration of the syscall.
    let parent_esp = unsafe { current.as_ref() }.context.esp;
    let _ = parent_esp;
    // The new thread resumes as if returning 0 from this same syscall: copy
    // the caller's in-flight `TrapFrame` the same way `fork` does, since
    // both share the address space and only the return value differs.
    // SAFETY: dispatch() always invokes syscall handlers with the frame
    // reachable from the current thread's kernel stack.
    unsafe {
        let top = current.as_ptr() as u32 + KERNEL_STACK_SIZE as u32;
        let frame_addr = top - core::mem::size_of::<TrapFrame>() as u32;
        let mut frame = *(frame_addr as *const TrapFrame);
        frame.eax = 0;
        let new_top = thread.as_ptr() as u32 + KERNEL_STACK_SIZE as u32;
        let new_frame_addr = new_top - core::mem::size_of::<TrapFrame>() as u32;
        (new_frame_addr as *mut TrapFrame).write(frame);
        let return_addr_slot = new_frame_addr - 4;
        (return_addr_slot as *mut u32).write(trap_return_tail as usize as u32);
        let gprs_base = return_addr_slot - 4 * 4;
        core::ptr::write_bytes(gprs_base as *mut u32, 0, 4);
        thread.as_ptr().as_mut().expect("non-null").context.esp = gprs_base;
    }

    sched::add(thread);
    Ok(thread.as_ref().tid())
}

/// Replaces the calling task's address space with a freshly loaded ELF
/// image. Every fallible step (argv copy, loader) runs against a transient
/// address space before the old one is torn down, so a failed `exec` leaves
/// the caller's original address space untouched instead of half-replaced.
pub fn exec(filename: &str, argv: &[&str]) -> Result<(u32, u32)> {
    let task = current_task();
    // SAFETY: `task` is the live current task.
    let task_ref = unsafe { task.as_ref() };
    task_ref.fork_lock.wait();

    let mut argv_owned: Vec<alloc::string::String> = Vec::with_capacity(argv.len());
    for &arg in argv {
        argv_owned.push(alloc::string::String::from(arg));
    }

    let mut new_as = AddressSpace::init(None);
    let loaded = match elf::load(filename, &mut new_as) {
        Ok(loaded) => loaded,
        Err(err) => {
            task_ref.fork_lock.signal();
            return Err(err);
        }
    };

    let user_stack_top = match write_argv_frame(&new_as, loaded.stack_top, filename, &argv_owned) {
        Ok(top) => top,
        Err(err) => {
            task_ref.fork_lock.signal();
            return Err(err);
        }
    };

    // Point of no return: tear down the old user mapping and swap in the new one.
    {
        let mut old_as = task_ref.address_space.lock();
        old_as.unback_all_ranges();
        old_as.free_user_ptes();
        old_as.ranges.retain(|r| r.start == 0);
        old_as.copy_user_ptes(&new_as);
        old_as.copy_range_list(&new_as);
        old_as.segments = new_as.segments;
        old_as.load_cr3();
    }

    let current = sched::current_thread();
    // SAFETY: `current` belongs to `task` and is mid-syscall; overwriting
    // its in-flight trap frame redirects where the syscall "returns" to.
    unsafe {
        let top = current.as_ptr() as u32 + KERNEL_STACK_SIZE as u32;
        let frame_addr = top - core::mem::size_of::<TrapFrame>() as u32;
        let frame = &mut *(frame_addr as *mut TrapFrame);
        frame.eip = loaded.entry;
        frame.user_esp = user_stack_top;
        frame.user_ss = u32::from(USER_DATA_SELECTOR);
        frame.cs = u32::from(USER_CODE_SELECTOR);
    }

    task_ref.fork_lock.signal();
    Ok((loaded.entry, user_stack_top))
}

/// Pushes `argv` strings and the `argv` pointer array onto the user stack
/// below `stack_top`, per S2's layout: `[retaddr][argc][argv][...strings]`.
///
/// `new_as` is not yet the active page directory (`exec` builds it before
/// swapping `CR3`), so every write below goes through the destination
/// frame's physical address rather than its `new_as`-local virtual one —
/// the kernel window maps physical memory the same way regardless of which
/// task's page directory is currently loaded.
fn write_argv_frame(address_space: &AddressSpace, stack_top: u32, _filename: &str, argv: &[alloc::string::String]) -> Result<u32> {
    let mut sp = stack_top;
    let mut string_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= (bytes.len() + 1) as u32;
        address_space.write_bytes(sp, bytes)?;
        address_space.write_bytes(sp + bytes.len() as u32, &[0])?;
        string_ptrs.push(sp);
    }
    string_ptrs.reverse();
    sp &= !0x3;
    sp -= 4;
    address_space.write_bytes(sp, &0u32.to_le_bytes())?;
    for &ptr in string_ptrs.iter().rev() {
        sp -= 4;
        address_space.write_bytes(sp, &ptr.to_le_bytes())?;
    }
    let argv_ptr = sp;
    sp -= 4;
    address_space.write_bytes(sp, &argv_ptr.to_le_bytes())?;
    sp -= 4;
    #[expect(clippy::cast_possible_truncation, reason = "argv.len() is bounded by command-line parsing")]
    address_space.write_bytes(sp, &(argv.len() as u32).to_le_bytes())?;
    sp -= 4;
    address_space.write_bytes(sp, &0xDEAD_BEEFu32.to_le_bytes())?;
    Ok(sp)
}

/// `wait`: blocks on the task's vultures semaphore for a zombie child,
/// reaps it, and returns its primordial thread identifier.
pub fn wait(status_out: &mut i32) -> Result<u32> {
    let task = current_task();
    // SAFETY: `task` is the live current task.
    let task_ref = unsafe { task.as_ref() };
    if task_ref.children.lock().is_empty() {
        return Err(KernelError::TaskNotFound);
    }
    task_ref.vultures.wait();

    task_ref.fork_lock.wait();
    let mut children = task_ref.children.lock();
    let pos = children
        .iter()
        .position(|child| {
            // SAFETY: every child pointer in this list is a live or zombie task.
            *unsafe { child.as_ref().state.lock() } == TaskState::Zombie
        })
        .expect("vultures signaled exactly once per zombie child");
    let child = children.remove(pos);
    drop(children);
    task_ref.fork_lock.signal();

    // SAFETY: `child` is a zombie task with no running threads; no one else
    // touches it once removed from the children list.
    let (tid, status) = unsafe {
        let child_ref = child.as_ref();
        let status = child_ref.exit_status.load(Ordering::SeqCst);
        let tid = child_ref.primordial_tid.load(Ordering::SeqCst);
        let mut address_space = child_ref.address_space.lock();
        address_space.unback_all_ranges();
        address_space.free_user_ptes();
        (tid, status)
    };
    *status_out = status;

    // SAFETY: `child` was removed from every list; its `Box` was leaked in
    // `Task::new`/`fork` and is reclaimed here exactly once.
    unsafe {
        drop(Box::from_raw(child.as_ptr()));
    }
    Ok(tid)
}

/// `set_status`.
pub fn set_status(status: i32) {
    let task = current_task();
    // SAFETY: `task` is the live current task.
    unsafe { task.as_ref().exit_status.store(status, Ordering::SeqCst) };
}

/// `vanish`: removes the current thread from scheduling and its task's
/// thread list; if it was the last thread, the task becomes a zombie and
/// signals its parent's vultures semaphore.
pub fn vanish() -> ! {
    vanish_thread(sched::current_thread());
    sched::schedule(false);
    unreachable!("a vanished thread's run_flag excludes it from ever being rescheduled");
}

fn vanish_thread(mut thread: NonNull<Tcb>) {
    // SAFETY: `thread` is a live TCB belonging to the current or
    // soon-to-be-killed task.
    unsafe { thread.as_mut().run_flag.store(u32::MAX, Ordering::SeqCst) };
    sched::remove(thread);
    unregister_thread(thread);

    // SAFETY: see above.
    let task = unsafe { thread.as_ref().task };
    // SAFETY: `task` outlives `thread`.
    let task_ref = unsafe { task.as_ref() };
    let became_zombie = {
        let mut threads = task_ref.threads.lock();
        threads.remove(thread);
        threads.is_empty()
    };
    if became_zombie {
        *task_ref.state.lock() = TaskState::Zombie;
        if let Some(parent) = task_ref_parent(task_ref) {
            // SAFETY: `parent` outlives its zombie children.
            unsafe { parent.as_ref().vultures.signal() };
        }
    }

    // `thread` is off the run queue and its task's thread list. Queue its
    // kernel stack to be freed the next time `schedule` runs on some other
    // thread's stack — this thread's own stack is still live until its
    // final `schedule(false)` call switches away from it.
    sched::retire(thread);
}

/// Frees the `KERNEL_STACK_SIZE` kernel-stack allocation (and the `Tcb` at
/// its base) of a thread that has fully vanished. Called only by
/// `sched::reap_retired`, never on the thread whose stack is still live.
pub(crate) fn free_kernel_stack(thread: NonNull<Tcb>) {
    let layout = Layout::from_size_align(KERNEL_STACK_SIZE, KERNEL_STACK_SIZE)
        .expect("KERNEL_STACK_SIZE is a valid power-of-two layout");
    // SAFETY: `thread` was allocated by `new_kernel_stack` with this exact
    // layout; the caller guarantees it is fully retired and will never be
    // scheduled, read, or written again.
    unsafe { alloc::alloc::dealloc(thread.as_ptr().cast(), layout) };
}

fn task_ref_parent(task: &Task) -> Option<NonNull<Task>> {
    task.parent
}

/// `task_vanish`: force-kills every sibling thread (even if blocked on
/// an unrelated wait queue) under the task's fork lock, then vanishes the
/// calling thread.
pub fn task_vanish() -> ! {
    let task = current_task();
    // SAFETY: `task` is the live current task.
    let task_ref = unsafe { task.as_ref() };
    task_ref.fork_lock.wait();

    let current = sched::current_thread();
    let others: Vec<NonNull<Tcb>> = {
        let threads = task_ref.threads.lock();
        threads.iter().filter(|t| *t != current).collect()
    };
    for other in others {
        // Force-kill: unlink from every queue a blocked sibling could be
        // parked on, not just the run queue — `vultures` (in `wait()`),
        // `fork_lock`, the keyboard semaphore (in `getchar`), and the
        // sleepers list (in `sleep`). Each removal is a no-op if `other`
        // isn't actually queued there.
        task_ref.fork_lock.force_remove(other);
        task_ref.vultures.force_remove(other);
        crate::keyboard::force_remove(other);
        sched::remove_sleeper(other);
        sched::remove(other);
        vanish_thread(other);
    }
    task_ref.fork_lock.signal();
    vanish()
}

/// `cas2i_runflag`: atomically reads the target thread's `run_flag`
/// into `*old_out`; independently applies up to two compare-and-set
/// transitions. A transition to a negative value (`nv1 < 0`) is only
/// honored when the target is the calling thread. Always reschedules
/// afterward.
pub fn cas2i_runflag(tid: u32, old_out: &mut i32, ev1: i32, nv1: i32, ev2: i32, nv2: i32) -> Result<()> {
    let target = find_thread_by_tid(tid).ok_or(KernelError::TaskNotFound)?;
    let is_self = target == sched::current_thread();
    let token = sched::disable_preemption();
    // SAFETY: preemption disabled; exclusive access to `target`'s run_flag.
    let result = unsafe {
        let current = target.as_ref().run_flag.load(Ordering::SeqCst) as i32;
        let mut new_value = current;
        if current == ev1 && (nv1 >= 0 || is_self) {
            new_value = nv1;
        }
        if current == ev2 && (nv2 >= 0 || is_self) {
            new_value = nv2;
        }
        target.as_ref().run_flag.store(new_value as u32, Ordering::SeqCst);
        current
    };
    sched::enable_preemption(token);
    *old_out = result;
    sched::schedule(true);
    Ok(())
}

/// `yield`: `tid == u32::MAX` is a pure yield; otherwise the target
/// must name a live thread in the calling task (advisory hint only).
pub fn yield_thread(tid: u32) -> Result<()> {
    if tid != u32::MAX {
        let task = current_task();
        let target = find_thread_by_tid(tid).ok_or(KernelError::TaskNotFound)?;
        // SAFETY: `target` is a live TCB.
        let target_task = unsafe { target.as_ref().task };
        if target_task != task {
            return Err(KernelError::TaskNotFound);
        }
    }
    sched::schedule(true);
    Ok(())
}

/// `sleep`.
pub fn sleep(ticks: u32) {
    sched::sleep_current(ticks);
}

/// `new_pages`: installs a fresh, quota-charged, on-demand-backed range.
/// Overlap with an already installed range record is not itself rejected;
/// only collision with an already *present* page is. A caller that installs
/// two overlapping ranges without touching the first one's pages can still
/// strand quota across both records instead of getting a clean error.
pub fn new_pages(base: u32, len: u32) -> Result<()> {
    if base % PAGE_SIZE as u32 != 0 || len % PAGE_SIZE as u32 != 0 || len == 0 {
        return Err(KernelError::PageErr);
    }
    if base < USER_MEM_START {
        return Err(KernelError::VmCannotMap);
    }
    let task = current_task();
    // SAFETY: `task` is the live current task.
    let task_ref = unsafe { task.as_ref() };
    {
        let address_space = task_ref.address_space.lock();
        let mut addr = base;
        while addr < base + len {
            if address_space.get_pte(addr).is_some_and(|e| e.is_present()) {
                return Err(KernelError::PageErr);
            }
            addr += PAGE_SIZE as u32;
        }
    }
    task_ref.charge_quota(len)?;
    let mut address_space = task_ref.address_space.lock();
    // `install_range` leaves every page absent; the first touch takes a
    // page fault and `fault::handle_page_fault`'s BACK path backs it.
    if let Err(err) = address_space.install_range(base, len) {
        drop(address_space);
        task_ref.release_quota(len);
        return Err(err);
    }
    Ok(())
}

/// `remove_pages`.
pub fn remove_pages(base: u32) -> Result<()> {
    let task = current_task();
    // SAFETY: `task` is the live current task.
    let task_ref = unsafe { task.as_ref() };
    let mut address_space = task_ref.address_space.lock();
    let range = address_space.get_range(base).filter(|r| r.start == base).ok_or(KernelError::PageErr)?;
    address_space.uninstall_range(base)?;
    drop(address_space);
    task_ref.release_quota(range.len);
    Ok(())
}

/// KILL path for a fatal fault or illegal instruction: prints a diagnostic
/// and vanishes the current thread.
pub fn kill_current(reason: &str) -> ! {
    console::write_bytes(b"fatal: ");
    console::write_bytes(reason.as_bytes());
    console::write_bytes(b"\n");
    vanish()
}
