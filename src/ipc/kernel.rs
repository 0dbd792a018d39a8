//! The kernel IPC transport boundary (C8).
//!
//! `ipc_wait_cycle`, `ipc_call_async` and `ipc_answer_fast` are explicitly
//! out of scope (§1: "treated as a given transport"). [`Kernel`] is the
//! trait standing in for that boundary; production code would hand the
//! manager a transport that actually talks to a kernel, which this crate
//! does not implement. [`LoopbackKernel`] is the in-process test double
//! that lets the end-to-end scenarios of §8 run without one: it models a
//! single process with one or more "phones", routing `call_async` /
//! `answer_fast` directly between connected managers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;

bitflags::bitflags! {
    /// Flag bits folded into a [`CallId`]'s raw token, the way the source
    /// packs `IPC_CALLID_ANSWERED` into the high bit of the call-id word
    /// returned by `ipc_wait_cycle` (§6) rather than carrying it alongside
    /// as a separate field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u64 {
        /// Set when the event `wait_cycle` returns is a reply rather than a
        /// call — the kernel has already invoked the registered reply
        /// callback by the time it hands this back.
        const ANSWERED = 1 << 63;
    }
}

/// Kernel token identifying one request; must eventually be answered
/// unless it already carries [`CallFlags::ANSWERED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

impl CallId {
    /// The sentinel returned by `wait_cycle` on a bare timeout.
    pub const NONE: CallId = CallId(0);

    pub fn is_answered(self) -> bool {
        CallFlags::from_bits_retain(self.0).contains(CallFlags::ANSWERED)
    }

    fn with_answered(self) -> CallId {
        CallId(self.0 | CallFlags::ANSWERED.bits())
    }
}

/// Protocol method codes the router switches on (§6), plus a catch-all for
/// service-specific codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    ConnectMeTo,
    Interrupt,
    Hangup,
    User(u32),
}

/// One incoming kernel call: `{in_phone_hash, method, arg1..arg5}` (§6).
#[derive(Debug, Clone)]
pub struct Call {
    pub in_phone_hash: u64,
    pub method: Method,
    pub args: [u64; 5],
}

/// The two return registers of a kernel answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Answer {
    pub r1: u64,
    pub r2: u64,
}

/// Callback a [`Kernel`] invokes when a reply to a previously issued
/// `call_async` becomes available. Registered once per `Kernel` instance by
/// the reply correlator (§4.3); invoked on the manager's own thread from
/// inside `wait_cycle`, never concurrently with application code running
/// under that manager.
pub type ReplyCallback = dyn Fn(u64, i32, Option<Answer>) + Send + Sync;

/// Stand-in for the kernel IPC primitives of §6.
pub trait Kernel: Send + Sync {
    /// Register the callback invoked when a reply arrives. Called once by
    /// the reply correlator at construction time.
    fn set_reply_callback(&self, callback: Arc<ReplyCallback>);

    /// Block for up to `timeout` (or forever if `None`) for the next event:
    /// a new call, or a reply to one of this kernel's outstanding sends.
    /// `CallId(0)` with no call means the timeout elapsed with nothing to
    /// report.
    fn wait_cycle(&self, timeout: Option<Duration>) -> (CallId, Option<Call>);

    /// Issue an asynchronous call. `cookie` is opaque to the kernel and
    /// handed back verbatim to the registered reply callback.
    fn call_async(&self, phone: u64, method: Method, args: [u64; 5], cookie: u64) -> CallId;

    /// Answer a previously received call.
    fn answer_fast(&self, callid: CallId, retval: i32, r1: u64, r2: u64);
}

/// A single in-process "bus" shared by every [`LoopbackKernel`] created
/// from the same [`LoopbackKernel::new`] family — i.e. everything a test
/// wants to be able to address by phone number.
struct Bus {
    phones: Mutex<HashMap<u64, Weak<LoopbackKernel>>>,
    pending: Mutex<HashMap<u64, (Weak<LoopbackKernel>, u64)>>,
    next_phone: AtomicU64,
    next_callid: AtomicU64,
}

impl Bus {
    fn new() -> Self {
        Self {
            phones: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_phone: AtomicU64::new(1),
            next_callid: AtomicU64::new(1),
        }
    }
}

enum Event {
    Call(CallId, Call),
    Reply {
        callid: CallId,
        cookie: u64,
        retval: i32,
        answer: Answer,
    },
}

/// An in-process [`Kernel`] test double modeling one addressable endpoint
/// on a shared [`Bus`]. Construct a family of them with
/// [`LoopbackKernel::new_bus`] / [`LoopbackKernel::connect`].
pub struct LoopbackKernel {
    bus: Arc<Bus>,
    inbox: Mutex<VecDeque<Event>>,
    cv: Condvar,
    reply_callback: Mutex<Option<Arc<ReplyCallback>>>,
    self_ref: OnceLock<Weak<LoopbackKernel>>,
}

impl LoopbackKernel {
    /// Create the first endpoint of a new loopback bus.
    pub fn new_bus() -> Arc<Self> {
        Self::new_on(Arc::new(Bus::new()))
    }

    /// Create another endpoint sharing `other`'s bus, so the two can
    /// `connect` to each other.
    pub fn new_peer(other: &Arc<LoopbackKernel>) -> Arc<Self> {
        Self::new_on(Arc::clone(&other.bus))
    }

    fn new_on(bus: Arc<Bus>) -> Arc<Self> {
        let this = Arc::new(Self {
            bus,
            inbox: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            reply_callback: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = this.self_ref.set(Arc::downgrade(&this));
        this
    }

    /// Register a phone on this endpoint pointing at `target`; calls to
    /// the returned phone number are delivered to `target` with
    /// `in_phone_hash` equal to that same phone number.
    pub fn connect(self: &Arc<Self>, target: &Arc<LoopbackKernel>) -> u64 {
        let phone = self.bus.next_phone.fetch_add(1, Ordering::Relaxed);
        self.bus
            .phones
            .lock()
            .unwrap()
            .insert(phone, Arc::downgrade(target));
        phone
    }

    fn push_event(&self, event: Event) {
        self.inbox.lock().unwrap().push_back(event);
        self.cv.notify_all();
    }
}

impl Kernel for LoopbackKernel {
    fn set_reply_callback(&self, callback: Arc<ReplyCallback>) {
        *self.reply_callback.lock().unwrap() = Some(callback);
    }

    fn wait_cycle(&self, timeout: Option<Duration>) -> (CallId, Option<Call>) {
        let mut inbox = self.inbox.lock().unwrap();
        loop {
            if let Some(event) = inbox.pop_front() {
                return match event {
                    Event::Call(callid, call) => (callid, Some(call)),
                    Event::Reply {
                        callid,
                        cookie,
                        retval,
                        answer,
                    } => {
                        drop(inbox);
                        if let Some(cb) = self.reply_callback.lock().unwrap().clone() {
                            cb(cookie, retval, Some(answer));
                        }
                        (callid.with_answered(), None)
                    }
                };
            }
            match timeout {
                None => inbox = self.cv.wait(inbox).unwrap(),
                Some(duration) => {
                    let (new_inbox, result) = self.cv.wait_timeout(inbox, duration).unwrap();
                    inbox = new_inbox;
                    if result.timed_out() && inbox.is_empty() {
                        return (CallId::NONE, None);
                    }
                }
            }
        }
    }

    fn call_async(&self, phone: u64, method: Method, args: [u64; 5], cookie: u64) -> CallId {
        let target = self
            .bus
            .phones
            .lock()
            .unwrap()
            .get(&phone)
            .cloned()
            .and_then(|weak| weak.upgrade());

        let callid = CallId(self.bus.next_callid.fetch_add(1, Ordering::Relaxed));
        let Some(target) = target else {
            // Peer is gone: answer EHANGUP immediately, same as a kernel
            // whose peer phone was revoked.
            if let Some(cb) = self.reply_callback.lock().unwrap().clone() {
                cb(cookie, crate::error::Errno::Ehangup.code(), None);
            }
            return callid;
        };

        self.bus.pending.lock().unwrap().insert(
            callid.0,
            (self.self_ref.get().unwrap().clone(), cookie),
        );
        target.push_event(Event::Call(
            callid,
            Call {
                in_phone_hash: phone,
                method,
                args,
            },
        ));
        callid
    }

    fn answer_fast(&self, callid: CallId, retval: i32, r1: u64, r2: u64) {
        let Some((origin, cookie)) = self.bus.pending.lock().unwrap().remove(&callid.0) else {
            return;
        };
        let Some(origin) = origin.upgrade() else {
            return;
        };
        origin.push_event(Event::Reply {
            callid,
            cookie,
            retval,
            answer: Answer { r1, r2 },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn call_and_answer_roundtrip() {
        let client = LoopbackKernel::new_bus();
        let server = LoopbackKernel::new_peer(&client);
        let phone = client.connect(&server);

        let got_reply = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&got_reply);
        client.set_reply_callback(Arc::new(move |_cookie, retval, answer| {
            assert_eq!(retval, 0);
            assert_eq!(answer.unwrap().r1, 0xbeef);
            flag.store(true, Ordering::SeqCst);
        }));

        client.call_async(phone, Method::User(1), [0xbeef, 0, 0, 0, 0], 42);
        let (callid, call) = server.wait_cycle(None);
        let call = call.unwrap();
        assert_eq!(call.in_phone_hash, phone);
        server.answer_fast(callid, 0, 0xbeef, 0);

        let (callid, call) = client.wait_cycle(None);
        assert!(callid.is_answered());
        assert!(call.is_none());
        assert!(got_reply.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_cycle_times_out_with_no_events() {
        let solo = LoopbackKernel::new_bus();
        let (callid, call) = solo.wait_cycle(Some(Duration::from_millis(10)));
        assert_eq!(callid, CallId::NONE);
        assert!(call.is_none());
    }

    #[test]
    fn call_to_unknown_phone_answers_hangup() {
        let client = LoopbackKernel::new_bus();
        let got = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&got);
        client.set_reply_callback(Arc::new(move |_c, retval, _a| {
            assert_eq!(retval, crate::error::Errno::Ehangup.code());
            flag.store(true, Ordering::SeqCst);
        }));
        client.call_async(999, Method::Interrupt, [0; 5], 1);
        assert!(got.load(Ordering::SeqCst));
    }
}
