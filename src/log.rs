//! Logging utils. See the ["log" crate documentation](https://docs.rs/log/)
//! for the facade this module plugs into.
//!
//! Unlike the source this crate is modeled on — which shells out to a
//! kernel-hosted logging facility — there is no privileged logging sink to
//! call into here, so this module provides its own leveled, timestamped
//! [`log::Log`] implementation that writes to stderr.
//!
//! Example:
//! ```no_run
//! use log::info;
//! asyncipc::log::init(log::LevelFilter::Debug);
//! info!("manager started");
//! ```
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::clock::wall_time_secs;

/// Writes leveled, timestamped lines to stderr. Installed process-wide by
/// [`init`]; every manager/router/correlator/association state transition
/// logged by the rest of this crate (connection open/close, fiber
/// spawn/join, timeout sweep, association add/remove/reset) goes through
/// this logger via the ordinary `log::{trace,debug,info,warn,error}`
/// macros.
pub struct Logger;

impl Log for Logger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let target = record.target();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{:.6} {:<5} [{}] {}",
            wall_time_secs(),
            level_tag(record.level()),
            target,
            record.args(),
        );
    }

    #[inline(always)]
    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

static LOGGER: Logger = Logger;
static MAX_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);

/// Install the process-wide [`Logger`] and set the initial level filter.
/// Safe to call more than once from tests; only the first call's
/// `log::set_logger` wins, but the level filter set here always applies.
pub fn init(level: LevelFilter) {
    set_max_level(level);
    // `set_logger` may only succeed once per process; a later call (e.g.
    // from a second test in the same binary) just keeps the existing
    // logger, which is already wired up to the same atomic level filter.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// The level filter currently in effect.
pub fn max_level() -> LevelFilter {
    match MAX_LEVEL.load(Ordering::Relaxed) {
        n if n == LevelFilter::Off as usize => LevelFilter::Off,
        n if n == LevelFilter::Error as usize => LevelFilter::Error,
        n if n == LevelFilter::Warn as usize => LevelFilter::Warn,
        n if n == LevelFilter::Info as usize => LevelFilter::Info,
        n if n == LevelFilter::Debug as usize => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Change the level filter without touching the installed logger.
pub fn set_max_level(level: LevelFilter) {
    MAX_LEVEL.store(level as usize, Ordering::Relaxed);
    log::set_max_level(level);
}
