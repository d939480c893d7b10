//! Synchronization primitives: interrupt-disable spinlocks and counting
//! semaphores with strict FIFO waiter queues.
//!
//! The uniprocessor configuration's "spinlock" is exactly the scheduler's
//! preemption-disable discipline: a guarded interrupt-disable region.
//! `IrqSpinlock<T>` wraps a value behind that discipline so callers get a
//! `Mutex`-shaped API without pulling in an MP-capable crate lock for
//! sections that never contend across CPUs.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::sched::{self, PreemptionToken, RunState, Tcb};

/// A value guarded only by "interrupts are off while the guard lives" —
/// sufficient and cheapest on a uniprocessor.
pub struct IrqSpinlock<T> {
    value: UnsafeCell<T>,
}

// SAFETY: access is serialized by disabling interrupts for the guard's
// lifetime; there is exactly one CPU.
unsafe impl<T> Sync for IrqSpinlock<T> {}

pub struct IrqSpinlockGuard<'a, T> {
    lock: &'a IrqSpinlock<T>,
    token: Option<PreemptionToken>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        IrqSpinlockGuard {
            lock: self,
            token: Some(sched::disable_preemption()),
        }
    }
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: interrupts are disabled for the guard's lifetime, and the
        // uniprocessor model means no other context can hold this lock
        // concurrently.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `Deref`.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            sched::enable_preemption(token);
        }
    }
}

/// FIFO queue of waiting threads, threaded through `Tcb::sched_link` — the
/// same field the run queue uses; a thread is on at most one of these at
/// a time, so the two never collide.
#[derive(Default)]
struct WaitQueue {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
}

impl WaitQueue {
    fn push_back(&mut self, mut thread: NonNull<Tcb>) {
        // SAFETY: caller holds the semaphore's spinlock; `thread` is the
        // current thread and will not be touched concurrently.
        unsafe {
            thread.as_mut().sched_link.prev = self.tail;
            thread.as_mut().sched_link.next = None;
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
        unsafe { head.as_mut().sched_link = sched::Link::default() };
        Some(head)
    }

    /// Whether `thread` is actually linked into this queue, found by
    /// scanning from `head`. `sched_link` is shared across the run queue,
    /// the sleepers list, and every semaphore's wait queue, so a thread not
    /// in this particular queue may still carry valid-looking `prev`/`next`
    /// pointers into whichever queue it's really on.
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

    /// No-op if `thread` is not actually a member of *this* queue (checked
    /// by `contains` first, so a thread queued elsewhere is left untouched
    /// instead of having its real queue corrupted by a blind splice).
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
        unsafe { thread.as_mut().sched_link = sched::Link::default() };
    }

    fn len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while let Some(node) = cur {
            count += 1;
            // SAFETY: the list is only ever mutated under the owning
            // semaphore's spinlock, which this call holds.
            cur = unsafe { node.as_ref().sched_link.next };
        }
        count
    }
}

/// Counting semaphore with strict FIFO wakeup. `signal` never blocks; the
/// waiter is enqueued under the same spinlock `signal` takes before
/// popping, so a wakeup can never be lost.
pub struct Semaphore {
    inner: IrqSpinlock<SemaphoreState>,
}

struct SemaphoreState {
    count: i32,
    waiters: WaitQueue,
}

impl Semaphore {
    #[must_use]
    pub const fn new(initial: i32) -> Self {
        Self {
            inner: IrqSpinlock::new(SemaphoreState {
                count: initial,
                waiters: WaitQueue {
                    head: None,
                    tail: None,
                },
            }),
        }
    }

    /// Decrements the count; blocks (FIFO) if it goes negative.
    ///
    /// The spinlock is always released before `schedule` is called,
    /// including on the blocking path — never held across a context switch.
    pub fn wait(&self) {
        let mut current = sched::current_thread();
        let must_block = {
            let mut state = self.inner.lock();
            state.count -= 1;
            if state.count >= 0 {
                false
            } else {
                // SAFETY: `current` is the live current thread.
                unsafe { current.as_mut().state = RunState::Waiting };
                state.waiters.push_back(current);
                true
            }
            // `state` (and its spinlock) drops here, before `schedule`.
        };
        if must_block {
            sched::schedule(false);
        }
    }

    /// Increments the count; if a thread was waiting, pops and wakes the
    /// front of the FIFO queue. Never blocks.
    pub fn signal(&self) {
        let mut state = self.inner.lock();
        state.count += 1;
        if state.count <= 0 {
            if let Some(mut waiter) = state.waiters.pop_front() {
                // SAFETY: `waiter` was just removed from the wait queue and
                // is not referenced elsewhere.
                unsafe { waiter.as_mut().state = RunState::Runnable };
                sched::add(waiter);
            }
        }
    }

    /// Snapshot of the number of threads currently queued.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Removes `thread` from the wait queue if it is currently blocked here,
    /// used by `task_vanish`'s force-kill walk to unstick sibling threads
    /// parked on arbitrary semaphores.
    pub fn force_remove(&self, thread: NonNull<Tcb>) {
        let mut state = self.inner.lock();
        state.waiters.remove(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn signal_before_wait_does_not_block() {
        let sem = Semaphore::new(1);
        sem.wait();
        assert_eq!(sem.waiters(), 0, "a permit was already available");
    }
}
