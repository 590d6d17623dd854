//! Error types for the RDM provider.

use std::fmt;

/// Error type for RDM operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed request or packet.
    InvalidArgument(&'static str),
    /// A pool or arena is exhausted at submission time.
    OutOfMemory(&'static str),
    /// Unsupported flag or attribute.
    NotSupported(&'static str),
    /// Transient resource shortage; the operation will be retried by the
    /// progress engine and is never surfaced to the application.
    Again,
    /// Transport failure, including unrecoverable RNR exhaustion.
    Io(&'static str),
    /// A posted receive was cancelled.
    Cancelled,
    /// Address vector entry is still referenced by in-flight operations.
    Busy,
    /// Address is not valid or not known to the address vector.
    AddrNotAvailable,
    /// The peer does not advertise a required extra feature.
    OpNotSupported(&'static str),
    /// An event-queue-requiring flag was used without an EQ bound.
    NoEventQueue,
    /// Wire data failed validation.
    Malformed { what: &'static str, value: u64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::OutOfMemory(what) => write!(f, "out of resources: {}", what),
            Error::NotSupported(what) => write!(f, "not supported: {}", what),
            Error::Again => write!(f, "resource temporarily unavailable"),
            Error::Io(what) => write!(f, "transport error: {}", what),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Busy => write!(f, "resource busy"),
            Error::AddrNotAvailable => write!(f, "address not available"),
            Error::OpNotSupported(what) => {
                write!(f, "operation not supported by peer: {}", what)
            }
            Error::NoEventQueue => write!(f, "no event queue bound"),
            Error::Malformed { what, value } => {
                write!(f, "malformed {}: {:#x}", what, value)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for RDM operations.
pub type Result<T> = std::result::Result<T, Error>;
