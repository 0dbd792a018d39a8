//! Error handling utils.
//!
//! Every fallible operation in this crate returns a [`Result<T>`], an alias
//! for `std::result::Result<T, Error>`. [`Error`] is a single flat enum
//! covering every failure class named in the error taxonomy: resource
//! exhaustion, protocol/identity mistakes, lifecycle violations against
//! torn-down connections or associations, timeouts, and transport failures,
//! plus the ambient I/O and configuration errors that don't fit any of
//! those but still need to flow through `?`.
//!
//! The wire-level error codes (`ENOMEM`, `EHANGUP`, ...) that get sent back
//! across the kernel IPC boundary as an `i32` retval are a distinct, much
//! smaller type: [`Errno`]. An [`Error`] can always be turned into the
//! [`Errno`] that best represents it via [`Error::as_errno`]; the reverse
//! direction ([`From<Errno>`]) is exact.

use std::fmt::{self, Display, Formatter};

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level status code exchanged with the kernel IPC transport (see
/// `EXTERNAL INTERFACES` / `ERROR HANDLING DESIGN` of the design). Mirrors
/// the handful of errno-like constants the source hardcodes; `Eok` is the
/// only non-error value and is what a successful `answer_fast` carries as
/// `retval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    Eok = 0,
    Enomem = -1,
    Enoent = -2,
    Ehangup = -3,
    Etimeout = -4,
    Einval = -5,
    Eio = -6,
    Enxio = -7,
}

impl Errno {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Reconstruct an [`Errno`] from a raw retval, if it is one of ours.
    /// Unrecognized codes (e.g. a protocol-specific user retval) are not an
    /// [`Errno`] at all and are left to the caller to interpret.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Eok,
            -1 => Self::Enomem,
            -2 => Self::Enoent,
            -3 => Self::Ehangup,
            -4 => Self::Etimeout,
            -5 => Self::Einval,
            -6 => Self::Eio,
            -7 => Self::Enxio,
            _ => return None,
        })
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eok => "EOK",
            Self::Enomem => "ENOMEM",
            Self::Enoent => "ENOENT",
            Self::Ehangup => "EHANGUP",
            Self::Etimeout => "ETIMEOUT",
            Self::Einval => "EINVAL",
            Self::Eio => "EIO",
            Self::Enxio => "ENXIO",
        };
        f.write_str(s)
    }
}

/// Represents every failure case surfaced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Allocation failure: a new [`crate::ipc::connection::Connection`]
    /// couldn't be created, a queue entry couldn't be pushed, or a PDU
    /// couldn't be encoded.
    #[error("out of memory")]
    NoMemory,

    /// No handler is willing to serve this method (the default connection
    /// handler, or an unrouted call with no matching connection).
    #[error("no such service")]
    NoEntry,

    /// The peer end of a connection, or a torn-down association, can no
    /// longer be reached.
    #[error("connection hung up")]
    Hangup,

    /// A reset association was read from, or awaited on, after the fact.
    #[error("association has been reset")]
    Reset,

    /// `wait_timeout`'s deadline passed with no reply.
    #[error("operation timed out")]
    Timeout,

    /// Malformed arguments: a wildcard remote address/port on `send`, an
    /// address-family mismatch, a fiber trying to join itself.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Transmission of an encoded PDU failed at the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A join against an unknown or already-joined fiber.
    #[error(transparent)]
    Join(#[from] crate::fiber::JoinError),

    /// Failed to load or parse [`crate::config::Config`].
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Anything else, so that call sites composing third-party errors via
    /// `?` aren't forced to invent a new variant for every one-off case.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Construct an [`Error::Other`] from any boxable error.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// The name of the variant, as used in logs (`crate::log`) and in test
    /// assertions that don't want to match on the full `Display` message.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::NoMemory => "NoMemory",
            Self::NoEntry => "NoEntry",
            Self::Hangup => "Hangup",
            Self::Reset => "Reset",
            Self::Timeout => "Timeout",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Io(_) => "Io",
            Self::Join(_) => "Join",
            Self::Config(_) => "Config",
            Self::Other(_) => "Other",
        }
    }

    /// The [`Errno`] that best represents this error across the kernel IPC
    /// boundary. Errors with no wire-level counterpart (`Io`, `Config`,
    /// `Other`) map to [`Errno::Eio`], matching the "transport failure ⇒
    /// `EIO`" rule of the error taxonomy.
    pub const fn as_errno(&self) -> Errno {
        match self {
            Self::NoMemory => Errno::Enomem,
            Self::NoEntry => Errno::Enoent,
            Self::Hangup => Errno::Ehangup,
            Self::Reset => Errno::Enxio,
            Self::Timeout => Errno::Etimeout,
            Self::InvalidArgument(_) => Errno::Einval,
            Self::Io(_) | Self::Config(_) | Self::Other(_) => Errno::Eio,
            Self::Join(join_error) => match join_error {
                crate::fiber::JoinError::JoinSelf => Errno::Einval,
                crate::fiber::JoinError::NoSuchFiber => Errno::Enoent,
            },
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::Eok => {
                unreachable!("Errno::Eok does not represent a failure and has no Error variant")
            }
            Errno::Enomem => Self::NoMemory,
            Errno::Enoent => Self::NoEntry,
            Errno::Ehangup => Self::Hangup,
            Errno::Enxio => Self::Reset,
            Errno::Etimeout => Self::Timeout,
            Errno::Einval => Self::InvalidArgument("rejected by peer"),
            Errno::Eio => Self::Io(std::io::Error::new(std::io::ErrorKind::Other, "EIO")),
        }
    }
}
