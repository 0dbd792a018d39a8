//! The connection router (C4): routes incoming calls on an established
//! connection to the fiber serving it, spawning that fiber lazily on first
//! contact.
//!
//! The connection table is an open-chained hash map keyed by
//! `in_phone_hash`, bucketed the way the design specifies: `(key >> 4) mod
//! bucket_count` (§3). A [`Connection`]'s FIFO and `active` flag are
//! guarded by the connection's own lock rather than by a single
//! process-wide "async lock" (see the crate's concurrency notes in
//! `ipc::manager`); because `new_connection`/`route_call` are always called
//! sequentially from the manager's dispatch loop, this is observationally
//! identical to folding that state under one shared lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::error::Errno;
use crate::fiber::{Scheduler, TaskId};
use crate::ipc::kernel::{Call, CallId, Kernel};

/// A server-supplied callback invoked once per connection, with an opening
/// call and a handle ([`ConnectionCtx`]) it uses to pull subsequent calls
/// and answer them.
pub type Handler = Arc<dyn Fn(ConnectionCtx, CallId, Call) + Send + Sync>;

struct InMsg {
    callid: CallId,
    call: Call,
}

struct ConnectionState {
    fifo: VecDeque<InMsg>,
    owner: TaskId,
    active: bool,
}

/// One established connection: an identity (`in_phone_hash`), a FIFO of
/// calls waiting to be handled, and the fiber that owns it.
pub struct Connection {
    in_phone_hash: u64,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn in_phone_hash(&self) -> u64 {
        self.in_phone_hash
    }
}

/// A handle passed into a connection's [`Handler`], used to pull further
/// calls and answer them without relying on any ambient "current
/// connection" state (see the design notes on replacing the source's
/// task-local `PS_connection` pointer with an explicit context).
#[derive(Clone)]
pub struct ConnectionCtx {
    table: Arc<ConnectionTable>,
    conn: Arc<Connection>,
}

impl ConnectionCtx {
    /// `async_get_call`: pop the next queued call, blocking the calling
    /// fiber if the FIFO is empty. Resumes only once the router has pushed
    /// at least one message and marked the connection active again — the
    /// coupling §9 calls out as load-bearing is preserved by
    /// [`ConnectionTable::route_call`] always doing both under the same
    /// lock acquisition.
    pub fn get_call(&self) -> (CallId, Call) {
        loop {
            let mut state = self.conn.state.lock().unwrap();
            if let Some(msg) = state.fifo.pop_front() {
                return (msg.callid, msg.call);
            }
            state.active = false;
            drop(state);
            self.table.scheduler.suspend_self();
        }
    }

    /// Answer a call previously returned by [`ConnectionCtx::get_call`] (or
    /// the initial call the handler was invoked with).
    pub fn answer(&self, callid: CallId, retval: i32, r1: u64, r2: u64) {
        self.table.kernel.answer_fast(callid, retval, r1, r2);
    }

    pub fn in_phone_hash(&self) -> u64 {
        self.conn.in_phone_hash
    }
}

/// Open-chained hash map of [`Connection`]s, keyed by `in_phone_hash`.
pub struct ConnectionTable {
    scheduler: Arc<Scheduler>,
    kernel: Arc<dyn Kernel>,
    buckets: Vec<Mutex<HashMap<u64, Arc<Connection>>>>,
}

impl ConnectionTable {
    pub fn new(scheduler: Arc<Scheduler>, kernel: Arc<dyn Kernel>, bucket_count: usize) -> Arc<Self> {
        let bucket_count = bucket_count.max(1);
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || Mutex::new(HashMap::new()));
        Arc::new(Self {
            scheduler,
            kernel,
            buckets,
        })
    }

    fn bucket_index(&self, key: u64) -> usize {
        ((key >> 4) as usize) % self.buckets.len()
    }

    /// `route_call`: if `call.in_phone_hash` names an existing connection,
    /// enqueue the call on its FIFO (waking its fiber if it was parked) and
    /// return `true`. Returns `false` if no such connection exists.
    pub fn route_call(&self, callid: CallId, call: Call) -> bool {
        let bucket = self.bucket_index(call.in_phone_hash);
        let conn = {
            let map = self.buckets[bucket].lock().unwrap();
            map.get(&call.in_phone_hash).cloned()
        };
        let Some(conn) = conn else {
            return false;
        };

        let mut state = conn.state.lock().unwrap();
        state.fifo.push_back(InMsg { callid, call });
        if !state.active {
            state.active = true;
            let owner = state.owner;
            drop(state);
            trace!("router: waking connection owner={owner}");
            self.scheduler.add_ready(owner);
        }
        true
    }

    /// `new_connection`: spawn a fiber to serve a freshly opened
    /// connection and insert it into the table. `in_phone_hash` is read
    /// from `call`'s third argument, per §6 ("`new_connection` reads the
    /// peer's phone hash from `arg3`").
    ///
    /// The source replies `ENOMEM` here on allocation failure; under
    /// Rust's global allocator that failure mode aborts the process rather
    /// than being observable, so there is no reachable `ENOMEM` path to
    /// reproduce (see `DESIGN.md`).
    pub fn new_connection(self: &Arc<Self>, callid: CallId, call: Call, handler: Handler) {
        let in_phone_hash = call.args[2];
        let conn = Arc::new(Connection {
            in_phone_hash,
            state: Mutex::new(ConnectionState {
                fifo: VecDeque::new(),
                owner: TaskId::MANAGER,
                active: true,
            }),
        });

        let table = Arc::clone(self);
        let conn_for_fiber = Arc::clone(&conn);
        let owner = self.scheduler.spawn(
            move |(callid, call): (CallId, Call)| {
                connection_fiber(table, conn_for_fiber, handler, callid, call);
            },
            (callid, call),
        );
        conn.state.lock().unwrap().owner = owner;

        debug!("router: new connection in_phone_hash={in_phone_hash} owner={owner}");
        let bucket = self.bucket_index(in_phone_hash);
        self.buckets[bucket].lock().unwrap().insert(in_phone_hash, conn);
    }

    fn remove(&self, in_phone_hash: u64) {
        let bucket = self.bucket_index(in_phone_hash);
        self.buckets[bucket].lock().unwrap().remove(&in_phone_hash);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, in_phone_hash: u64) -> bool {
        let bucket = self.bucket_index(in_phone_hash);
        self.buckets[bucket].lock().unwrap().contains_key(&in_phone_hash)
    }
}

fn connection_fiber(
    table: Arc<ConnectionTable>,
    conn: Arc<Connection>,
    handler: Handler,
    callid: CallId,
    call: Call,
) {
    let ctx = ConnectionCtx {
        table: Arc::clone(&table),
        conn: Arc::clone(&conn),
    };
    handler(ctx, callid, call);

    let leftover: Vec<CallId> = {
        let mut state = conn.state.lock().unwrap();
        state.fifo.drain(..).map(|m| m.callid).collect()
    };
    for callid in leftover {
        table.kernel.answer_fast(callid, Errno::Ehangup.code(), 0, 0);
    }
    table.remove(conn.in_phone_hash);
    debug!("router: connection in_phone_hash={} torn down", conn.in_phone_hash);
}

/// The default connection handler (§4.5): replies `ENOENT` to the opening
/// call and exits without ever calling `get_call`. Protocol services
/// override this with their own [`Handler`].
pub fn default_handler() -> Handler {
    Arc::new(|ctx: ConnectionCtx, callid: CallId, _call: Call| {
        ctx.answer(callid, Errno::Enoent.code(), 0, 0);
    })
}
