//! Fiber-aware [`Cond`] and [`Latch`] primitives.
//!
//! These give call sites the same shape as a thread condition variable and
//! a mutex, but park the *fiber* rather than the underlying OS thread: a
//! waiter gives up its scheduler's turn token and is only made ready again
//! by an explicit `signal`/`broadcast`, or by the previous lock holder
//! handing off a [`Latch`]. This lets a fiber block on a shared resource
//! (e.g. the UDP association receive queue, §4.6) without starving its
//! sibling fibers, matching the contract of a cooperative fibril condition
//! variable.

use super::{Scheduler, TaskId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A condition variable for fibers. Unlike [`std::sync::Condvar`] there is
/// no associated mutex parameter: callers re-check their own predicate
/// (guarded by whatever lock they use) after `wait` returns, exactly as
/// with a standard condvar under spurious wakeups.
pub struct Cond {
    waiters: Mutex<VecDeque<(Arc<Scheduler>, TaskId)>>,
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Cond {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Park the calling fiber until `signal` or `broadcast` wakes it.
    pub fn wait(&self) {
        let (scheduler, me) = Scheduler::current();
        self.waiters.lock().unwrap().push_back((Arc::clone(&scheduler), me));
        scheduler.suspend_self();
    }

    /// Wake the longest-waiting fiber, if any.
    pub fn signal(&self) {
        if let Some((scheduler, tid)) = self.waiters.lock().unwrap().pop_front() {
            scheduler.add_ready(tid);
        }
    }

    /// Wake every fiber currently waiting.
    pub fn broadcast(&self) {
        for (scheduler, tid) in self.waiters.lock().unwrap().drain(..) {
            scheduler.add_ready(tid);
        }
    }
}

struct LatchState {
    locked: bool,
    waiters: VecDeque<(Arc<Scheduler>, TaskId)>,
}

/// A FIFO mutual-exclusion lock for fibers; acquiring a held latch parks
/// the calling fiber rather than blocking its OS thread.
pub struct Latch {
    state: Mutex<LatchState>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the latch, parking the calling fiber while it is held by
    /// someone else. Returns a guard that releases the latch (and wakes
    /// the next waiter, if any) on drop.
    pub fn lock(&self) -> LatchGuard<'_> {
        loop {
            let (scheduler, me) = Scheduler::current();
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                return LatchGuard { latch: self };
            }
            state.waiters.push_back((Arc::clone(&scheduler), me));
            drop(state);
            scheduler.suspend_self();
        }
    }
}

/// RAII guard returned by [`Latch::lock`].
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.latch.state.lock().unwrap();
        if let Some((scheduler, tid)) = state.waiters.pop_front() {
            // Ownership transfers directly to the woken waiter.
            scheduler.add_ready(tid);
        } else {
            state.locked = false;
        }
    }
}
