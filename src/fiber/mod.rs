//! Cooperative fiber primitive (stackful tasks, yield, schedule-next, join).
//!
//! The contract this module satisfies comes from a system whose kernel hands
//! out raw call/answer events and expects user space to multiplex them onto
//! lightweight, non-preemptive tasks. The contract says nothing about *how*
//! a task's stack is switched, only that:
//!
//! - exactly one task (or the manager) is ever executing application code
//!   at a time within one [`Scheduler`],
//! - a single lock is held for the whole time a task runs, and is released
//!   only at an explicit yield,
//! - yielding hands control to some other ready task and suspends the
//!   caller until it is made ready again.
//!
//! Rather than hand-written stack-switching, each task here is a real
//! [`std::thread`], and the "single lock" is a real [`Mutex`] plus
//! [`Condvar`] used as a turn token: at most one thread is ever allowed past
//! the token check, every other task thread is parked in
//! [`Condvar::wait_while`]. Because `wait_while` unlocks, blocks and
//! re-locks atomically, this reproduces the contract's locking discipline
//! exactly without any unsafe code.

pub mod sync;

pub use sync::{Cond, Latch};

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Opaque identifier of a cooperative task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Reserved id of the manager "task" (the thread that drives
    /// [`Scheduler::yield_to_next`] in manager mode; see `ipc::manager`).
    pub const MANAGER: TaskId = TaskId(0);
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// Errors returned by [`Scheduler::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// A fiber tried to join itself.
    #[error("a fiber cannot join itself")]
    JoinSelf,
    /// The target fiber does not exist, or has already been joined once.
    #[error("no such joinable fiber")]
    NoSuchFiber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Ready,
    Running,
    Blocked,
    Finished,
}

struct TaskSlot {
    state: TaskState,
    joined: bool,
}

struct SchedulerState {
    tasks: HashMap<TaskId, TaskSlot>,
    ready: VecDeque<TaskId>,
    current: Option<TaskId>,
    next_id: u64,
    /// Fibers parked in `join(target)`, keyed by `target`.
    joiners: HashMap<TaskId, Vec<TaskId>>,
}

impl SchedulerState {
    fn new() -> Self {
        let mut tasks = HashMap::new();
        tasks.insert(
            TaskId::MANAGER,
            TaskSlot {
                state: TaskState::Running,
                joined: false,
            },
        );
        Self {
            tasks,
            ready: VecDeque::new(),
            current: Some(TaskId::MANAGER),
            next_id: 0,
            joiners: HashMap::new(),
        }
    }
}

/// Owns one cooperative scheduling domain: one async manager's worth of
/// fibers, its ready queue, and its turn token.
///
/// Each async manager instance owns exactly one `Scheduler` (see §5 of the
/// design: "each owns its own async lock... no cross-manager sharing").
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    cv: Condvar,
}

thread_local! {
    static CURRENT: RefCell<Option<(Arc<Scheduler>, TaskId)>> = RefCell::new(None);
}

impl Scheduler {
    /// Create a new scheduler. The creating thread becomes the manager
    /// (`TaskId::MANAGER`) for this scheduler.
    pub fn new() -> Arc<Self> {
        let this = Arc::new(Self {
            state: Mutex::new(SchedulerState::new()),
            cv: Condvar::new(),
        });
        CURRENT.with(|c| *c.borrow_mut() = Some((Arc::clone(&this), TaskId::MANAGER)));
        this
    }

    /// The id of the fiber running on the calling OS thread.
    ///
    /// # Panics
    /// Panics if called from a thread that is not a fiber or manager thread
    /// of some [`Scheduler`].
    pub fn current_id() -> TaskId {
        CURRENT.with(|c| c.borrow().as_ref().expect("not running on a fiber thread").1)
    }

    /// Spawn a new fiber running `f(arg)`. The fiber is created in the
    /// `Ready` state and is not run until a subsequent
    /// [`Scheduler::yield_to_next`] picks it.
    pub fn spawn<F, A>(self: &Arc<Self>, f: F, arg: A) -> TaskId
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = TaskId(state.next_id);
            state.tasks.insert(
                id,
                TaskSlot {
                    state: TaskState::Ready,
                    joined: false,
                },
            );
            state.ready.push_back(id);
            id
        };

        let scheduler = Arc::clone(self);
        std::thread::Builder::new()
            .name(id.to_string())
            .spawn(move || {
                CURRENT.with(|c| *c.borrow_mut() = Some((Arc::clone(&scheduler), id)));
                scheduler.wait_for_turn(id);
                f(arg);
                scheduler.finish(id);
            })
            .expect("failed to spawn fiber thread");

        id
    }

    /// Block the calling (newly spawned) thread until it is granted the
    /// turn token.
    fn wait_for_turn(&self, id: TaskId) {
        let state = self.state.lock().unwrap();
        let _state = self
            .cv
            .wait_while(state, |s| s.current != Some(id))
            .unwrap();
    }

    /// Mark `tid` ready to run. No-op if `tid` is already ready, running, or
    /// finished.
    pub fn add_ready(&self, tid: TaskId) {
        let mut state = self.state.lock().unwrap();
        self.add_ready_locked(&mut state, tid);
    }

    fn add_ready_locked(&self, state: &mut SchedulerState, tid: TaskId) {
        if let Some(slot) = state.tasks.get_mut(&tid) {
            if slot.state == TaskState::Blocked {
                slot.state = TaskState::Ready;
                state.ready.push_back(tid);
            }
        }
    }

    /// Pick the next ready task (if any) and hand it the turn token.
    /// Must be called with `state` locked; returns with `state` still
    /// locked, having updated `current`.
    fn schedule_next_locked(&self, state: &mut SchedulerState) {
        let next = state.ready.pop_front().unwrap_or(TaskId::MANAGER);
        if let Some(slot) = state.tasks.get_mut(&next) {
            slot.state = TaskState::Running;
        }
        state.current = Some(next);
        self.cv.notify_all();
    }

    /// Suspend the calling fiber (already marked `Blocked` or re-queued as
    /// `Ready` by the caller) and block until it is granted the turn token
    /// again.
    fn yield_and_wait(&self, mut state: MutexGuard<'_, SchedulerState>, me: TaskId) {
        self.schedule_next_locked(&mut state);
        let _state = self.cv.wait_while(state, |s| s.current != Some(me)).unwrap();
    }

    /// Explicit yield: give up the turn token, let some other ready fiber
    /// (or the manager) run, and block until resumed.
    ///
    /// `from_manager` selects the manager-loop variant (see §4.1/§4.5 of the
    /// design): when `true`, this call does *not* block if there is no
    /// ready fiber — it returns `false` immediately so the manager can go
    /// block on the kernel transport instead. When `false` (an ordinary
    /// fiber yielding), the caller is always re-queued as ready and the
    /// call always blocks until its next turn.
    pub fn yield_to_next(&self, from_manager: bool) -> bool {
        let me = Self::current_id();
        let mut state = self.state.lock().unwrap();

        if from_manager {
            if state.ready.is_empty() {
                return false;
            }
            self.schedule_next_locked(&mut state);
            let _state = self.cv.wait_while(state, |s| s.current != Some(me)).unwrap();
            return true;
        }

        self.add_ready_locked(&mut state, {
            // The caller is currently `Running`; requeue it as `Ready`
            // before giving up the token.
            if let Some(slot) = state.tasks.get_mut(&me) {
                slot.state = TaskState::Blocked;
            }
            me
        });
        self.yield_and_wait(state, me);
        true
    }

    /// Suspend the calling fiber without re-queueing it as ready. Used by
    /// suspension points that park on an external condition (a FIFO, a
    /// reply, a join) and rely on someone else calling [`Scheduler::add_ready`]
    /// to wake them up.
    pub fn suspend_self(&self) {
        let me = Self::current_id();
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.tasks.get_mut(&me) {
            slot.state = TaskState::Blocked;
        }
        self.yield_and_wait(state, me);
    }

    /// Acquire the scheduler's lock. Exposed so that `ipc::*` modules can
    /// fold their own state (the correlator table, the connection table,
    /// the timeout list) under the same critical section the scheduler
    /// uses, exactly matching the "single async lock" contract.
    pub fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap()
    }

    /// The scheduler and id of the fiber running on the calling OS thread.
    /// Used internally by [`sync::Cond`] and [`sync::Latch`] to park and
    /// wake fibers across possibly-different schedulers.
    pub(crate) fn current() -> (Arc<Scheduler>, TaskId) {
        CURRENT.with(|c| c.borrow().clone().expect("not running on a fiber thread"))
    }

    fn finish(&self, id: TaskId) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.tasks.get_mut(&id) {
            slot.state = TaskState::Finished;
        }
        if let Some(waiters) = state.joiners.remove(&id) {
            for w in waiters {
                self.add_ready_locked(&mut state, w);
            }
        }
        self.schedule_next_locked(&mut state);
    }

    /// Block the calling fiber until `tid` finishes. Each fiber may be
    /// joined exactly once; a second join (or a join of an unknown fiber)
    /// returns [`JoinError::NoSuchFiber`]. Joining oneself returns
    /// [`JoinError::JoinSelf`].
    pub fn join(&self, tid: TaskId) -> Result<(), JoinError> {
        let me = Self::current_id();
        if me == tid {
            return Err(JoinError::JoinSelf);
        }

        let mut state = self.state.lock().unwrap();
        loop {
            let Some(slot) = state.tasks.get(&tid) else {
                return Err(JoinError::NoSuchFiber);
            };
            if slot.state != TaskState::Finished {
                state.joiners.entry(tid).or_default().push(me);
                if let Some(slot) = state.tasks.get_mut(&me) {
                    slot.state = TaskState::Blocked;
                }
                self.yield_and_wait(state, me);
                state = self.state.lock().unwrap();
                continue;
            }
            let slot = state.tasks.get_mut(&tid).unwrap();
            if slot.joined {
                return Err(JoinError::NoSuchFiber);
            }
            slot.joined = true;
            return Ok(());
        }
    }
}

/// Generic per-fiber storage slot.
///
/// This exists to satisfy the fiber primitive's contract of offering
/// task-local storage; it is deliberately *not* used by the connection
/// router (see the design notes on replacing the ambient "current
/// connection" pointer with an explicit context handle). It is still a
/// real, usable primitive: anything that legitimately wants per-fiber state
/// keyed only by [`TaskId`] can use it directly.
pub struct TaskLocal<T> {
    slots: Mutex<HashMap<TaskId, T>>,
}

impl<T> Default for TaskLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskLocal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, tid: TaskId, value: T) {
        self.slots.lock().unwrap().insert(tid, value);
    }

    pub fn remove(&self, tid: TaskId) -> Option<T> {
        self.slots.lock().unwrap().remove(&tid)
    }

    pub fn with<R>(&self, tid: TaskId, f: impl FnOnce(Option<&T>) -> R) -> R {
        let slots = self.slots.lock().unwrap();
        f(slots.get(&tid))
    }
}

/// Type-erased variant, handy for storing heterogeneous per-fiber values
/// under one registry (e.g. test harnesses).
pub type AnyTaskLocal = TaskLocal<Box<dyn Any + Send>>;
