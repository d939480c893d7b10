//! Preemptive uniprocessor scheduler.
//!
//! The run queue is a FIFO intrusive list threaded through `Tcb::sched_link`:
//! a TCB is addressed from many queues over its life but sits on at most one
//! at a time, so no heap-allocated node-per-queue is needed. The same link
//! field backs semaphore wait queues (`sync::Semaphore`) since a thread is
//! never on both at once.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::gdt::TSS;
use crate::config::KERNEL_STACK_SIZE;

/// Doubly linked intrusive link. `None` on both ends means "not queued".
#[derive(Clone, Copy, Default)]
pub struct Link {
    pub prev: Option<NonNull<Tcb>>,
    pub next: Option<NonNull<Tcb>>,
}

/// Whether a thread is eligible to run right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Runnable,
    Waiting,
}

/// Saved kernel-mode register context. `context_switch` writes the outgoing
/// thread's stack pointer here and reads the incoming thread's from here;
/// the callee-saved registers themselves live on the kernel stack the
/// pointer addresses (pushed by `context_switch`'s prologue).
#[derive(Default)]
pub struct Context {
    pub esp: u32,
}

/// Thread control block. Lives at the low address of its own
/// `KERNEL_STACK_SIZE`-aligned kernel stack allocation, so
/// `current_thread()` recovers it by masking the stack pointer.
#[repr(C)]
pub struct Tcb {
    pub context: Context,
    pub task: NonNull<crate::task::Task>,
    pub state: RunState,
    pub sleep_ticks: u32,
    /// Negative excludes the thread from scheduling. Manipulated atomically
    /// by `task::cas2i_runflag`.
    pub run_flag: AtomicU32,
    /// Link into the owning task's thread list.
    pub task_link: Link,
    /// Link into the run queue, or a semaphore's wait queue — never both.
    pub sched_link: Link,
    pub is_idle: bool,
}

impl Tcb {
    /// The opaque thread identifier user space sees: this TCB's address.
    #[must_use]
    pub fn tid(&self) -> u32 {
        core::ptr::from_ref(self) as u32
    }
}

/// `run_flag` is stored as an `AtomicU32` holding a transmuted `i32` so
/// `cas2i_runflag` can do its compare-exchange without extra locking; these
/// helpers keep the sign-extended view ergonomic everywhere else.
pub fn run_flag(tcb: &Tcb) -> i32 {
    tcb.run_flag.load(Ordering::SeqCst) as i32
}

/// Intrusive FIFO queue over `Tcb::sched_link`.
#[derive(Default)]
struct SchedQueue {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
}

impl SchedQueue {
    fn push_back(&mut self, mut thread: NonNull<Tcb>) {
        // SAFETY: the scheduler spinlock (preemption disabled) guards every
        // call into this queue; `thread` outlives the queue membership.
        unsafe {
            thread.as_mut().sched_link = Link {
                prev: self.tail,
                next: None,
            };
        }
        match self.tail {
            // SAFETY: see above.
            Some(mut tail) => unsafe { tail.as_mut().sched_link.next = Some(thread) },
            None => self.head = Some(thread),
        }
        self.tail = Some(thread);
    }

    fn pop_front(&mut self) -> Option<NonNull<Tcb>> {
        let mut head = self.head?;
        // SAFETY: see `push_back`.
        let next = unsafe { head.as_ref().sched_link.next };
        self.head = next;
        match next {
            // SAFETY: see `push_back`.
            Some(mut next) => unsafe { next.as_mut().sched_link.prev = None },
            None => self.tail = None,
        }
        // SAFETY: see `push_back`.
        unsafe { head.as_mut().sched_link = Link::default() };
        Some(head)
    }

    /// Whether `thread` is actually linked into this queue, found by
    /// scanning from `head`. `sched_link` is shared across the run queue,
    /// the sleepers list, and every semaphore's wait queue, so a thread
    /// not in this particular queue may still carry stale-looking but
    /// valid `prev`/`next` pointers into whichever queue it's really on.
    fn contains(&self, thread: NonNull<Tcb>) -> bool {
        let mut cur = self.head;
        while let Some(node) = cur {
            if node == thread {
                return true;
            }
            // SAFETY: see `push_back`.
            cur = unsafe { node.as_ref().sched_link.next };
        }
        false
    }

    /// Unlinks `thread` from wherever it sits in the queue. No-op if it is
    /// not currently a member of *this* queue (checked by `contains` first,
    /// so a thread actually queued elsewhere is left untouched instead of
    /// having its real queue corrupted by a blind splice).
    fn remove(&mut self, mut thread: NonNull<Tcb>) {
        if !self.contains(thread) {
            return;
        }
        // SAFETY: see `push_back`.
        let (prev, next) = unsafe {
            let link = thread.as_ref().sched_link;
            (link.prev, link.next)
        };
        match prev {
            // SAFETY: see `push_back`.
            Some(mut prev) => unsafe { prev.as_mut().sched_link.next = next },
            None => {
                if self.head == Some(thread) {
                    self.head = next;
                }
            }
        }
        match next {
            // SAFETY: see `push_back`.
            Some(mut next) => unsafe { next.as_mut().sched_link.prev = prev },
            None => {
                if self.tail == Some(thread) {
                    self.tail = prev;
                }
            }
        }
        // SAFETY: see `push_back`.
        unsafe { thread.as_mut().sched_link = Link::default() };
    }
}

static mut RUN_QUEUE: SchedQueue = SchedQueue {
    head: None,
    tail: None,
};
static mut CURRENT: Option<NonNull<Tcb>> = None;
static mut IDLE: Option<NonNull<Tcb>> = None;
static mut JIFFIES: u64 = 0;
static mut SLEEPERS: SchedQueue = SchedQueue {
    head: None,
    tail: None,
};
/// Threads that have fully vanished and are waiting for their kernel stack
/// to be reclaimed. A thread can't free its own stack while still running
/// on it, so `task::vanish_thread` queues it here instead; `schedule`
/// reaps everything but the thread it's currently switching away from.
static mut RETIRED: SchedQueue = SchedQueue {
    head: None,
    tail: None,
};

/// Token proving preemption is disabled; restoring it is the only way to
/// re-enable. On a uniprocessor, "acquire the scheduler spinlock" is exactly
/// "save EFLAGS and `cli`".
#[must_use]
pub struct PreemptionToken(bool);

/// Disables preemption (interrupts), returning a token that restores the
/// prior interrupt-enable state on `enable_preemption`.
pub fn disable_preemption() -> PreemptionToken {
    // SAFETY: reads EFLAGS and clears IF; no side effect beyond the token's
    // own bookkeeping.
    let was_enabled = unsafe {
        let flags: u32;
        core::arch::asm!("pushfd; pop {}", out(reg) flags, options(nomem, preserves_flags));
        if flags & (1 << 9) != 0 {
            core::arch::asm!("cli", options(nomem, nostack));
            true
        } else {
            false
        }
    };
    PreemptionToken(was_enabled)
}

/// Restores the interrupt-enable state captured by `disable_preemption`.
pub fn enable_preemption(token: PreemptionToken) {
    if token.0 {
        // SAFETY: re-enabling interrupts we (or our caller) disabled.
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
}

/// Recovers the current thread's TCB pointer by masking the stack pointer
/// down to `KERNEL_STACK_SIZE` alignment (the TCB sits at the low end of its
/// kernel stack).
#[must_use]
pub fn current_thread() -> NonNull<Tcb> {
    let esp: u32;
    // SAFETY: reads the stack pointer only.
    unsafe { core::arch::asm!("mov {}, esp", out(reg) esp, options(nomem, nostack, preserves_flags)) };
    let base = esp & !(KERNEL_STACK_SIZE as u32 - 1);
    // SAFETY: every kernel stack is `KERNEL_STACK_SIZE`-aligned with a live
    // `Tcb` at its base, by construction (`task::new_kernel_stack`).
    unsafe { NonNull::new_unchecked(base as *mut Tcb) }
}

/// Adds `thread` to the tail of the run queue. O(1).
pub fn add(thread: NonNull<Tcb>) {
    let token = disable_preemption();
    // SAFETY: preemption is disabled; we have exclusive access to `RUN_QUEUE`.
    unsafe {
        let queue = &raw mut RUN_QUEUE;
        (*queue).push_back(thread);
    }
    enable_preemption(token);
}

/// Removes `thread` from the run queue if present. O(1).
pub fn remove(thread: NonNull<Tcb>) {
    let token = disable_preemption();
    // SAFETY: see `add`.
    unsafe {
        let queue = &raw mut RUN_QUEUE;
        (*queue).remove(thread);
    }
    enable_preemption(token);
}

/// Removes `thread` from the sleepers list if present. Used by
/// `task::task_vanish`'s force-kill walk to unstick a sibling thread
/// blocked in `sleep(ticks)` so it is not left to leak once its timer
/// would otherwise have expired.
pub fn remove_sleeper(thread: NonNull<Tcb>) {
    let token = disable_preemption();
    // SAFETY: preemption is disabled; exclusive access to `SLEEPERS`.
    unsafe {
        let sleepers = &raw mut SLEEPERS;
        (*sleepers).remove(thread);
    }
    enable_preemption(token);
}

/// Queues `thread`'s kernel stack to be freed by `reap_retired` once it's
/// safe — `thread` must already be off the run queue, every wait queue,
/// and its task's thread list. Called by `task::vanish_thread`.
pub fn retire(thread: NonNull<Tcb>) {
    let token = disable_preemption();
    // SAFETY: preemption is disabled; exclusive access to `RETIRED`.
    unsafe {
        let retired = &raw mut RETIRED;
        (*retired).push_back(thread);
    }
    enable_preemption(token);
}

/// Frees the kernel stack of every retired thread except `skip` — the
/// thread `schedule` is about to switch away from, whose stack this very
/// call is still executing on. Called at the top of every `schedule`.
fn reap_retired(skip: NonNull<Tcb>) {
    // SAFETY: preemption is disabled by the caller (`schedule`); exclusive
    // access to `RETIRED`.
    unsafe {
        let retired = &raw mut RETIRED;
        let mut still_retired = SchedQueue::default();
        while let Some(thread) = (*retired).pop_front() {
            if thread == skip {
                still_retired.push_back(thread);
            } else {
                crate::task::free_kernel_stack(thread);
            }
        }
        RETIRED = still_retired;
    }
}

/// Registers the idle thread, special-cased out of the run queue forever.
pub fn set_idle(thread: NonNull<Tcb>) {
    // SAFETY: called once, at boot, before any preemption can occur.
    unsafe {
        IDLE = Some(thread);
        CURRENT = Some(thread);
    }
}

/// Implements `schedule(current_is_runnable)`.
///
/// 1. Disable preemption.
/// 2. Pop the run-queue front; if its `run_flag < 0`, rotate it to the back
///    and treat the queue as empty for this call.
/// 3. Fall back to the idle thread if the queue is (effectively) empty.
/// 4. If the pick differs from `current`, context-switch to it.
/// 5. Enable preemption.
pub fn schedule(current_is_runnable: bool) {
    let token = disable_preemption();
    // SAFETY: preemption is disabled for the remainder of this function;
    // all accesses to the scheduler globals below are exclusive.
    unsafe {
        let queue = &raw mut RUN_QUEUE;
        let current = CURRENT.expect("scheduler not bootstrapped");
        let idle = IDLE.expect("scheduler not bootstrapped");

        reap_retired(current);

        let next = match (*queue).pop_front() {
            Some(candidate) if run_flag(candidate.as_ref()) < 0 => {
                (*queue).push_back(candidate);
                None
            }
            Some(candidate) => Some(candidate),
            None => None,
        };
        let next = next.unwrap_or(idle);

        if next != current {
            if current != idle && current_is_runnable {
                (*queue).push_back(current);
            }
            CURRENT = Some(next);
            context_switch(current, next);
            TSS.lock().set_kernel_stack(stack_top(next));
        }
    }
    enable_preemption(token);
}

/// Top-of-stack address for `thread`, used to refresh `TSS.esp0` after a
/// switch so the next ring-3 -> ring-0 transition lands on the right stack.
fn stack_top(thread: NonNull<Tcb>) -> u32 {
    let base = thread.as_ptr() as u32;
    base + KERNEL_STACK_SIZE as u32
}

/// Timer ISR driver: advances jiffies, wakes expired sleepers, and
/// reschedules every tick (quantum = 1 tick).
pub fn timer_callback() {
    // SAFETY: called only from the timer ISR, which runs with interrupts
    // disabled (interrupt gate) and cannot itself be preempted.
    unsafe {
        JIFFIES += 1;
        let sleepers = &raw mut SLEEPERS;
        let mut still_sleeping = SchedQueue::default();
        while let Some(mut thread) = (*sleepers).pop_front() {
            let t = thread.as_mut();
            if t.sleep_ticks <= 1 {
                t.sleep_ticks = 0;
                t.state = RunState::Runnable;
                add(thread);
            } else {
                t.sleep_ticks -= 1;
                still_sleeping.push_back(thread);
            }
        }
        SLEEPERS = still_sleeping;
    }
    schedule(true);
}

/// Enqueues the current thread onto the sleepers list for `ticks` jiffies
/// and suspends it. The timer ISR moves it back to the run queue at expiry.
pub fn sleep_current(ticks: u32) {
    let token = disable_preemption();
    // SAFETY: preemption disabled; exclusive access to `SLEEPERS`/`CURRENT`.
    unsafe {
        let mut current = CURRENT.expect("scheduler not bootstrapped");
        current.as_mut().sleep_ticks = ticks;
        current.as_mut().state = RunState::Waiting;
        let sleepers = &raw mut SLEEPERS;
        (*sleepers).push_back(current);
    }
    enable_preemption(token);
    schedule(false);
}

/// Current jiffy count, for `get_ticks`.
#[must_use]
pub fn ticks() -> u64 {
    // SAFETY: a `u64` read racing the timer ISR's increment can only observe
    // a slightly-stale (never torn, on a uniprocessor) value.
    unsafe { core::ptr::read_volatile(&raw const JIFFIES) }
}

/// Dedicated per-kernel thread run when the run queue is empty. Never
/// itself enqueued: it loops calling `schedule(runnable=true)` forever,
/// which is also where paging and the timer callback are first engaged
/// (`task::bootstrap`).
pub extern "C" fn run_idle_loop() -> ! {
    loop {
        schedule(true);
    }
}

/// Saves the outgoing thread's callee-saved registers and stack pointer,
/// reloads CR3 if the incoming thread belongs to a different task, restores
/// the incoming thread's registers and stack pointer, and returns. Because
/// every thread is switched out by this same stub, each resumes its next
/// slice at the instruction after its own call into `context_switch`.
///
/// # Safety
/// `from`/`to` must be live, correctly constructed TCBs whose kernel stacks
/// were either freshly prepared by `task::new_kernel_stack` or previously
/// suspended by this exact function.
#[unsafe(naked)]
unsafe extern "C" fn context_switch(from: NonNull<Tcb>, to: NonNull<Tcb>) {
    core::arch::naked_asm!(
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        // from is [esp+20], to is [esp+24] after the 4 pushes above plus the return address
        "mov eax, [esp + 20]",
        "mov [eax], esp",
        "mov eax, [esp + 24]",
        "mov esp, [eax]",
        "call {maybe_switch_cr3}",
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "ret",
        maybe_switch_cr3 = sym maybe_switch_cr3,
    );
}

/// Reloads CR3 if `to`'s task differs from `from`'s. Called from
/// `context_switch`'s assembly body with both TCB pointers on the stack at
/// the point of the call; re-derives them from `CURRENT`/the just-restored
/// stack rather than threading extra arguments through the naked function.
extern "C" fn maybe_switch_cr3() {
    // SAFETY: only ever called from `context_switch`, after `CURRENT` has
    // been updated by `schedule` to the incoming thread.
    unsafe {
        let Some(current) = CURRENT else { return };
        let task = current.as_ref().task.as_ref();
        task.address_space.lock().load_cr3();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn run_queue_is_fifo() {
        let mut queue = SchedQueue::default();
        let mut a = dummy_tcb();
        let mut b = dummy_tcb();
        let a_ptr = NonNull::from(&mut a);
        let b_ptr = NonNull::from(&mut b);
        queue.push_back(a_ptr);
        queue.push_back(b_ptr);
        assert_eq!(queue.pop_front(), Some(a_ptr), "FIFO: first pushed pops first");
        assert_eq!(queue.pop_front(), Some(b_ptr), "FIFO: second pushed pops second");
        assert_eq!(queue.pop_front(), None, "queue drained");
    }

    fn dummy_tcb() -> Tcb {
        Tcb {
            context: Context::default(),
            // SAFETY: test-only dangling pointer never dereferenced as a task.
            task: unsafe { NonNull::new_unchecked(core::ptr::dangling_mut()) },
            state: RunState::Runnable,
            sleep_ticks: 0,
            run_flag: AtomicU32::new(0),
            task_link: Link::default(),
            sched_link: Link::default(),
            is_idle: false,
        }
    }
}
