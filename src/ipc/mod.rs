//! The asynchronous IPC framework: a cooperative-fiber runtime over a
//! kernel call/answer transport, with connection routing, reply
//! correlation, and timeouts built on top of [`crate::fiber`].
//!
//! - [`kernel`] (C8): the `Kernel` trait standing in for the out-of-scope
//!   kernel transport, plus [`kernel::LoopbackKernel`] for tests.
//! - [`timeout`] (C2): the deadline-ordered timeout list.
//! - [`correlator`] (C3): `send`/`wait_for`/`wait_timeout`.
//! - [`connection`] (C4): the connection router and its per-connection FIFO.
//! - [`manager`] (C5, C7): the manager loop and the public API shims layered
//!   over the three modules above.

pub mod connection;
pub mod correlator;
pub mod kernel;
pub mod manager;
pub mod timeout;

pub use connection::{ConnectionCtx, ConnectionTable, Handler};
pub use correlator::{Correlator, MsgId};
pub use kernel::{Answer, Call, CallId, Kernel, LoopbackKernel, Method};
pub use manager::Manager;
