//! Error types for stream management

use core::fmt;

use crate::slot::StreamSlot;

/// Result type for router operations
pub type RouteResult<T> = Result<T, RouteError>;

/// Why a stream or a single path was shut down irregularly.
///
/// Passed as the `reason` of `remove_path` / `abort` and forwarded to the
/// target actor inside a forced-close message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A path was found in a state that contradicts the router's tables
    InvalidStreamState,

    /// The peer went away without a graceful close
    UnexpectedClose,

    /// The stream was aborted by its owner
    StreamAborted,

    /// Free-form failure raised by user code
    RuntimeError(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::InvalidStreamState => write!(f, "invalid stream state"),
            StreamError::UnexpectedClose => write!(f, "unexpected close"),
            StreamError::StreamAborted => write!(f, "stream aborted"),
            StreamError::RuntimeError(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

/// Slot bookkeeping conflicts reported by the fused router.
///
/// Every variant is recoverable: the router leaves its tables consistent
/// before returning one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Slot is already registered (unassigned) or already routed
    SlotInUse(StreamSlot),

    /// No unassigned path is registered under this slot
    UnknownSlot(StreamSlot),

    /// Manager index does not name a fused sub-manager
    UnknownManager(usize),

    /// No fused sub-manager has the requested concrete type
    UnknownManagerType(&'static str),

    /// The sub-manager refused the path; the path was dropped
    OwnerRejected(StreamSlot),

    /// The routing table already had this slot; the new path was removed again
    SlotAlreadyMapped(StreamSlot),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::SlotInUse(s) => write!(f, "slot {} already in use", s),
            RouteError::UnknownSlot(s) => {
                write!(f, "cannot assign nested manager to unknown slot {}", s)
            }
            RouteError::UnknownManager(i) => write!(f, "no nested manager at index {}", i),
            RouteError::UnknownManagerType(t) => write!(f, "no nested manager of type {}", t),
            RouteError::OwnerRejected(s) => {
                write!(f, "nested manager rejected path for slot {}", s)
            }
            RouteError::SlotAlreadyMapped(s) => write!(f, "slot {} already mapped", s),
        }
    }
}

impl std::error::Error for RouteError {}
