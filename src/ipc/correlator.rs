//! The request/reply correlator (C3): `send` / `wait_for` / `wait_timeout`.
//!
//! Every in-flight kernel request the current fiber is waiting on is kept
//! in a table keyed by an opaque [`MsgId`]. A reply from the kernel
//! transport runs [`Correlator::reply_received`] — the registered
//! [`crate::ipc::kernel::ReplyCallback`] — which records the retval and
//! answer, then wakes the owning fiber if it is already parked.
//!
//! `wait_timeout`'s open question (§9: does a timed-out wait free the
//! entry?) is resolved here by tombstoning: a timeout leaves the table
//! entry in place, marked `abandoned`, instead of removing it outright —
//! the waiting fiber is gone and must never touch the entry again, but the
//! kernel may still deliver a late reply against it. [`Correlator::reply_received`]
//! is what actually removes an abandoned entry once that late reply
//! arrives, so the table never grows without bound.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};

use crate::clock::Timeval;
use crate::error::{Error, Result};
use crate::fiber::{Scheduler, TaskId};
use crate::ipc::kernel::{Answer, Kernel, Method};
use crate::ipc::timeout::TimeoutList;

/// Opaque identifier of one outstanding `send`, returned to the caller and
/// later passed to `wait_for`/`wait_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub(crate) u64);

struct OutMsg {
    owner: TaskId,
    /// True iff the owning fiber is runnable (not parked waiting on this
    /// message specifically).
    active: bool,
    done: bool,
    retval: i32,
    answer: Option<Answer>,
    has_timeout: bool,
    /// Set once `wait_timeout` has returned `ETIMEOUT` for this entry: the
    /// owning fiber is gone for good, so a late reply should just free the
    /// entry instead of waking anything.
    abandoned: bool,
}

struct Inner {
    table: HashMap<u64, OutMsg>,
    timeouts: TimeoutList<u64>,
    next_id: u64,
}

/// Owns the table of outstanding sends for one [`crate::ipc::manager::Manager`].
pub struct Correlator {
    scheduler: Arc<Scheduler>,
    kernel: Arc<dyn Kernel>,
    inner: std::sync::Mutex<Inner>,
}

impl Correlator {
    pub fn new(scheduler: Arc<Scheduler>, kernel: Arc<dyn Kernel>) -> Arc<Self> {
        let this = Arc::new(Self {
            scheduler,
            kernel,
            inner: std::sync::Mutex::new(Inner {
                table: HashMap::new(),
                timeouts: TimeoutList::new(),
                next_id: 0,
            }),
        });

        let weak = Arc::downgrade(&this);
        this.kernel
            .set_reply_callback(Arc::new(move |cookie, retval, answer| {
                if let Some(this) = weak.upgrade() {
                    this.reply_received(cookie, retval, answer);
                }
            }));
        this
    }

    /// `async_send`: issue an asynchronous call and return a [`MsgId`] the
    /// caller can later `wait_for`/`wait_timeout` on.
    pub fn send(&self, phone: u64, method: Method, args: [u64; 5]) -> MsgId {
        let owner = Scheduler::current_id();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.table.insert(
                id,
                OutMsg {
                    owner,
                    active: true,
                    done: false,
                    retval: 0,
                    answer: None,
                    has_timeout: false,
                    abandoned: false,
                },
            );
            id
        };
        trace!("correlator: send msg={id} phone={phone} owner={owner}");
        self.kernel.call_async(phone, method, args, id);
        MsgId(id)
    }

    /// The registered [`crate::ipc::kernel::ReplyCallback`]. Runs on the
    /// manager's own thread, from inside `Kernel::wait_cycle`.
    fn reply_received(&self, cookie: u64, retval: i32, answer: Option<Answer>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.table.get_mut(&cookie) else {
            // Tombstoned-and-already-collected, or a bogus cookie. Either
            // way there's nothing left to wake.
            debug!("correlator: reply for unknown msg={cookie}, dropping");
            return;
        };
        if state.has_timeout {
            inner.timeouts.remove(cookie);
            state.has_timeout = false;
        }
        if state.abandoned {
            // The waiting fiber already took the `ETIMEOUT` branch and will
            // never look at this entry again; this late reply is the only
            // thing left that can reclaim it.
            inner.table.remove(&cookie);
            debug!("correlator: late reply for abandoned msg={cookie}, reclaiming entry");
            return;
        }
        state.retval = retval;
        state.answer = answer;
        state.done = true;
        if !state.active {
            state.active = true;
            let owner = state.owner;
            drop(inner);
            trace!("correlator: waking owner={owner} for msg={cookie}");
            self.scheduler.add_ready(owner);
        }
    }

    /// `async_wait_for`: block the calling fiber until `id`'s reply
    /// arrives, then return its retval and answer payload. The table entry
    /// is freed before returning.
    pub fn wait_for(&self, id: MsgId) -> Result<(i32, Option<Answer>)> {
        loop {
            let mut inner = self.inner.lock().unwrap();
            let Some(state) = inner.table.get_mut(&id.0) else {
                return Err(Error::InvalidArgument("message id already consumed"));
            };
            if state.done {
                let retval = state.retval;
                let answer = state.answer;
                inner.table.remove(&id.0);
                return Ok((retval, answer));
            }
            state.active = false;
            state.has_timeout = false;
            drop(inner);
            self.scheduler.suspend_self();
        }
    }

    /// `async_wait_timeout`: like [`Correlator::wait_for`], but returns
    /// [`Error::Timeout`] if `usec` microseconds pass with no reply. On
    /// timeout the entry is marked abandoned rather than freed here (see
    /// the module docs); [`Correlator::reply_received`] reclaims it once the
    /// late reply actually arrives.
    pub fn wait_timeout(&self, id: MsgId, usec: i64) -> Result<(i32, Option<Answer>)> {
        let mut inner = self.inner.lock().unwrap();
        {
            let Some(state) = inner.table.get_mut(&id.0) else {
                return Err(Error::InvalidArgument("message id already consumed"));
            };
            if state.done {
                let retval = state.retval;
                let answer = state.answer;
                inner.table.remove(&id.0);
                return Ok((retval, answer));
            }
            state.active = false;
            state.has_timeout = true;
        }
        let deadline = Timeval::now().add_usecs(usec);
        inner.timeouts.insert(deadline, id.0);
        drop(inner);
        self.scheduler.suspend_self();

        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .table
            .get_mut(&id.0)
            .expect("abandoned entries are only removed by reply_received");
        if state.done {
            let retval = state.retval;
            let answer = state.answer;
            inner.table.remove(&id.0);
            Ok((retval, answer))
        } else {
            state.abandoned = true;
            Err(Error::Timeout)
        }
    }

    /// Called by the manager loop (C5) once per iteration: unlink and wake
    /// every timed-out entry whose deadline has passed.
    pub(crate) fn sweep_expired(&self, now: Timeval) {
        let mut inner = self.inner.lock().unwrap();
        let expired = inner.timeouts.pop_expired(now);
        for cookie in expired {
            if let Some(state) = inner.table.get_mut(&cookie) {
                state.has_timeout = false;
                if !state.active {
                    state.active = true;
                    let owner = state.owner;
                    trace!("correlator: timeout sweep waking owner={owner} msg={cookie}");
                    self.scheduler.add_ready(owner);
                }
            }
        }
    }

    /// The next deadline in the timeout list, if any — consulted by the
    /// manager loop to size its `kernel_wait` timeout.
    pub(crate) fn next_deadline(&self) -> Option<Timeval> {
        self.inner.lock().unwrap().timeouts.next_deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::kernel::LoopbackKernel;

    #[test]
    fn send_then_reply_wakes_waiter_via_wait_for() {
        let scheduler = Scheduler::new();
        let kernel = LoopbackKernel::new_bus();
        let correlator = Correlator::new(Arc::clone(&scheduler), kernel.clone());

        let id = correlator.send(1, Method::User(7), [0xbeef, 0, 0, 0, 0]);
        // Simulate the kernel delivering a reply straight away.
        correlator.reply_received(id.0, 0, Some(Answer { r1: 0xbeef, r2: 0 }));

        let (retval, answer) = correlator.wait_for(id).unwrap();
        assert_eq!(retval, 0);
        assert_eq!(answer.unwrap().r1, 0xbeef);
    }

    #[test]
    fn wait_for_on_consumed_id_errors() {
        let scheduler = Scheduler::new();
        let kernel = LoopbackKernel::new_bus();
        let correlator = Correlator::new(scheduler, kernel);
        let id = correlator.send(1, Method::Interrupt, [0; 5]);
        correlator.reply_received(id.0, 0, None);
        correlator.wait_for(id).unwrap();
        assert!(correlator.wait_for(id).is_err());
    }

    #[test]
    fn timeout_list_orders_by_deadline() {
        let scheduler = Scheduler::new();
        let kernel = LoopbackKernel::new_bus();
        let correlator = Correlator::new(scheduler, kernel);
        let far = correlator.send(1, Method::Interrupt, [0; 5]);
        let near = correlator.send(1, Method::Interrupt, [0; 5]);

        // Insert far deadline first, near deadline second; the list must
        // still report the nearer one.
        {
            let mut inner = correlator.inner.lock().unwrap();
            inner.timeouts.insert(Timeval::now().add_usecs(10_000), far.0);
            inner.timeouts.insert(Timeval::now().add_usecs(1_000), near.0);
        }
        let next = correlator.next_deadline().unwrap();
        let inner = correlator.inner.lock().unwrap();
        assert_eq!(inner.timeouts.entries_for_test()[0].1, near.0);
        drop(inner);
        assert!(next <= Timeval::now().add_usecs(10_000));
    }

    #[test]
    fn late_reply_after_timeout_reclaims_the_abandoned_entry() {
        let scheduler = Scheduler::new();
        let kernel = LoopbackKernel::new_bus();
        let correlator = Correlator::new(Arc::clone(&scheduler), kernel);

        let (tx, rx) = std::sync::mpsc::channel();
        let correlator_for_fiber = Arc::clone(&correlator);
        let id = correlator.send(1, Method::Interrupt, [0; 5]);
        scheduler.spawn(
            move |id: u64| {
                let result = correlator_for_fiber.wait_timeout(MsgId(id), 1);
                let _ = tx.send(result);
            },
            id.0,
        );

        // Run the fiber up to its `suspend_self` inside `wait_timeout`.
        assert!(scheduler.yield_to_next(true));
        assert!(rx.try_recv().is_err(), "fiber must still be parked in wait_timeout");

        // Simulate the deadline elapsing: the manager loop's sweep wakes the
        // fiber without a reply ever having arrived.
        correlator.sweep_expired(Timeval::now().add_usecs(1_000_000));
        assert!(scheduler.yield_to_next(true));
        let result = rx.recv_timeout(std::time::Duration::from_secs(2)).expect("fiber never replied");
        assert!(matches!(result, Err(Error::Timeout)));

        // The entry outlives the timed-out wait, marked abandoned...
        assert!(correlator.inner.lock().unwrap().table.contains_key(&id.0));

        // ...until the late reply actually arrives, which must reclaim it
        // instead of leaking it forever.
        correlator.reply_received(id.0, 0, Some(Answer { r1: 0, r2: 0 }));
        assert!(!correlator.inner.lock().unwrap().table.contains_key(&id.0));
    }
}
