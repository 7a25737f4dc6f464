//! Crate-wide error type.

use std::{fmt, io, sync::Arc};

use crate::codec::parser::Status;

/// Everything that can go wrong issuing a request through this crate.
///
/// Cloneable so a single failure can both be delivered to a pipelined
/// request's waiter and propagated out of the connection loop that produced
/// it.
#[derive(Clone, Debug)]
pub enum Error {
    /// A key failed validation (empty, too long, or contains whitespace/control bytes).
    BadKey(String),
    /// A request parameter other than the key was invalid (opaque token, etc).
    Invalid(String),
    /// The value to store exceeds the server's configured item size limit.
    ValueTooLarge { len: usize, max: usize },
    /// The pool has been closed and will not hand out further connections.
    PoolClosed,
    /// Failed to acquire a connection within the given constraints (deadline
    /// elapsed, pool at capacity with no room to grow, caller's context
    /// already cancelled).
    Acquire(String),
    /// Transport-level I/O failure.
    Io(Arc<io::Error>),
    /// The byte stream could not be framed as a valid response (malformed
    /// status line, short value block, bad trailer) or a reply's opaque
    /// token didn't match the request it was read for.
    Protocol(String),
    /// A well-formed error or non-success status returned by the server.
    Server(Status),
    /// The server pool's circuit breaker is open; the request was rejected
    /// without attempting a connection.
    CircuitOpen,
    /// The caller's cancellation context fired before the operation completed.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadKey(msg) => write!(f, "bad key: {msg}"),
            Error::Invalid(msg) => write!(f, "invalid request: {msg}"),
            Error::ValueTooLarge { len, max } => {
                write!(f, "value of {len} bytes exceeds maximum of {max} bytes")
            }
            Error::PoolClosed => write!(f, "connection pool is closed"),
            Error::Acquire(msg) => write!(f, "failed to acquire connection: {msg}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Server(status) => write!(f, "server returned {status}"),
            Error::CircuitOpen => write!(f, "circuit breaker is open"),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// `EN` — a `mg` found no matching item. Not a failure in the usual
    /// sense: callers poll this to distinguish "miss" from "broken".
    pub fn is_miss(&self) -> bool {
        matches!(self, Error::Server(Status::En))
    }

    /// `NS` — an `ms` with a CAS or mode constraint that couldn't be satisfied.
    pub fn is_not_stored(&self) -> bool {
        matches!(self, Error::Server(Status::Ns))
    }

    /// `EX` — a CAS-guarded write lost to a concurrent modification.
    pub fn is_exists(&self) -> bool {
        matches!(self, Error::Server(Status::Ex))
    }

    /// `NF` — `md`/`ma` targeted a key that isn't present.
    pub fn is_not_found_on_modify(&self) -> bool {
        matches!(self, Error::Server(Status::Nf))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Acquire(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen)
    }

    /// Whether this failure means the connection it occurred on can no
    /// longer be trusted to be at a request boundary and must be dropped
    /// rather than returned to the pool. I/O errors and framing errors
    /// poison; well-formed server statuses (including unrecognized ones)
    /// and opaque mismatches caught before any bytes were misread do not.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_))
    }
}
