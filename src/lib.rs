//! Cooperative fiber runtime for microkernel-style async IPC.
//!
//! This crate turns a kernel's raw call/answer IPC primitives into a
//! structured client/server programming model:
//!
//! - [`fiber`]: stackful cooperative tasks (spawn, yield, join, task-local
//!   storage) — the scheduling primitive everything else is built on.
//! - [`ipc`]: the async manager loop, the connection router, and the
//!   request/reply correlator, plus the [`ipc::Kernel`] trait that stands
//!   in for the out-of-scope kernel transport.
//! - [`udp`]: a representative protocol service built on top of `ipc` — a
//!   reference-counted association table with receive queues and reset
//!   semantics.
//! - [`clock`]: the monotonic `Timeval` the timeout list and correlator
//!   deadlines are expressed in.
//! - [`config`]: the few externally-tunable parameters the source
//!   hardcodes (connection table bucket count, default reply timeout).
//! - [`log`] / [`error`]: the ambient logging and error-handling stack
//!   shared by every module above.
//!
//! Non-goals (see the design notes): preemption, SMP scheduling across
//! cores within one manager, guaranteed message delivery, and fairness
//! beyond per-queue FIFO order.

pub mod clock;
pub mod config;
pub mod error;
pub mod fiber;
pub mod ipc;
pub mod log;
pub mod udp;

pub use error::{Error, Result};
