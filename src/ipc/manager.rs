//! The async manager loop (C5): pulls kernel events, dispatches them to
//! the correlator or the router, and wakes timed-out waiters.
//!
//! ```text
//! loop:
//!   if yield_to_next(from-manager) { continue }   // a ready fiber ran
//!   if timeout list non-empty:
//!     if head.deadline <= now: sweep_expired(); continue
//!     else: timeout = head.deadline - now
//!   else: timeout = NONE
//!   (callid, call) = kernel_wait(timeout)          // may block
//!   if callid == 0: sweep_expired(); continue
//!   if callid has ANSWERED flag: continue           // reply already handled
//!   dispatch(callid, call)
//! ```
//!
//! [`Manager::step`] runs exactly one iteration of this loop; [`Manager::run`]
//! loops it forever on the calling thread, which becomes the scheduler's
//! `TaskId::MANAGER`. Each `Manager` owns one [`Scheduler`], one
//! [`Correlator`], and one [`ConnectionTable`] — per §5, "each owns its own
//! async lock, connection table, and timeout list; no cross-manager
//! sharing of those structures."

use std::sync::Arc;
use std::time::Duration;

use log::Level;

use crate::clock::Timeval;
use crate::config::Config;
use crate::error::{Errno, Result};
use crate::fiber::{JoinError, Scheduler, TaskId};
use crate::ipc::connection::{default_handler, ConnectionTable, Handler};
use crate::ipc::correlator::{Correlator, MsgId};
use crate::ipc::kernel::{Answer, Call, CallId, Kernel, Method};

/// Owns one async manager's worth of state: the scheduler, the reply
/// correlator, and the connection router, plus the handler assigned to
/// freshly opened connections.
pub struct Manager {
    scheduler: Arc<Scheduler>,
    kernel: Arc<dyn Kernel>,
    correlator: Arc<Correlator>,
    router: Arc<ConnectionTable>,
    handler: Handler,
    /// Level the per-iteration idle/dispatch trace lines (timeout sweep,
    /// unrouted-call handling) log at; `None` if `config.manager_idle_log_level`
    /// is `Off`. Independent of the global filter `crate::log::init` sets.
    idle_log_level: Option<Level>,
}

impl Manager {
    /// Build a manager with the default (`ENOENT`-replying) connection
    /// handler. Use [`Manager::with_handler`] for a server that wants to
    /// accept connections.
    pub fn new(kernel: Arc<dyn Kernel>, config: &Config) -> Arc<Self> {
        Self::with_handler(kernel, config, default_handler())
    }

    pub fn with_handler(kernel: Arc<dyn Kernel>, config: &Config, handler: Handler) -> Arc<Self> {
        let scheduler = Scheduler::new();
        let correlator = Correlator::new(Arc::clone(&scheduler), Arc::clone(&kernel));
        let router = ConnectionTable::new(
            Arc::clone(&scheduler),
            Arc::clone(&kernel),
            config.connection_table_buckets,
        );
        Arc::new(Self {
            scheduler,
            kernel,
            correlator,
            router,
            handler,
            idle_log_level: config.manager_idle_log_level.to_level(),
        })
    }

    /// The scheduler backing this manager, for spawning fibers that aren't
    /// connection handlers (e.g. a client driving `send`/`wait_for`).
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// `async_send`: see [`Correlator::send`].
    pub fn send(&self, phone: u64, method: Method, args: [u64; 5]) -> MsgId {
        self.correlator.send(phone, method, args)
    }

    /// `async_wait_for`: see [`Correlator::wait_for`].
    pub fn wait_for(&self, id: MsgId) -> Result<(i32, Option<Answer>)> {
        self.correlator.wait_for(id)
    }

    /// `async_wait_timeout`: see [`Correlator::wait_timeout`].
    pub fn wait_timeout(&self, id: MsgId, usec: i64) -> Result<(i32, Option<Answer>)> {
        self.correlator.wait_timeout(id, usec)
    }

    /// Join a fiber spawned on this manager's scheduler.
    pub fn join(&self, tid: TaskId) -> std::result::Result<(), JoinError> {
        self.scheduler.join(tid)
    }

    /// Run the manager loop forever on the calling thread.
    pub fn run(&self) -> ! {
        loop {
            self.step();
        }
    }

    /// Run exactly one iteration of the manager loop. Exposed separately
    /// from [`Manager::run`] so tests can drive the loop deterministically.
    pub fn step(&self) {
        if self.scheduler.yield_to_next(true) {
            return;
        }

        let now = Timeval::now();
        let timeout = match self.correlator.next_deadline() {
            Some(deadline) if deadline <= now => {
                self.log_idle(format_args!("manager: timeout sweep at {now:?}"));
                self.correlator.sweep_expired(now);
                return;
            }
            Some(deadline) => Some(usec_to_duration(deadline - now)),
            None => None,
        };

        let (callid, call) = self.kernel.wait_cycle(timeout);
        if callid == CallId::NONE {
            self.correlator.sweep_expired(Timeval::now());
            return;
        }
        if callid.is_answered() {
            // The kernel already ran the reply callback before returning
            // this event; nothing left to dispatch.
            return;
        }
        if let Some(call) = call {
            self.dispatch(callid, call);
        }
    }

    fn dispatch(&self, callid: CallId, call: Call) {
        if self.router.route_call(callid, call.clone()) {
            return;
        }
        match call.method {
            Method::Interrupt => {}
            Method::ConnectMeTo => {
                self.router.new_connection(callid, call, Arc::clone(&self.handler));
            }
            Method::Hangup | Method::User(_) => {
                self.log_idle(format_args!(
                    "manager: unhandled method on unrouted call, replying EHANGUP"
                ));
                self.kernel.answer_fast(callid, Errno::Ehangup.code(), 0, 0);
            }
        }
    }

    /// Emit one of the manager's own per-iteration trace lines (timeout
    /// sweep, unrouted-call dispatch) at `config.manager_idle_log_level`,
    /// independent of the global filter `crate::log::init` installs.
    fn log_idle(&self, args: std::fmt::Arguments<'_>) {
        if let Some(level) = self.idle_log_level {
            log::log!(level, "{}", args);
        }
    }
}

fn usec_to_duration(usec: i64) -> Duration {
    Duration::from_micros(usec.max(0) as u64)
}
