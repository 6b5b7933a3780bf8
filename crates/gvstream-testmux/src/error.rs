//! Reactor error types

use core::fmt;

pub type MuxResult<T> = Result<T, MuxError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// Nothing was provided for the requested address
    NoSuchHandle(String),

    /// The reactor (or the broker) was dropped while an adapter still ran
    ReactorGone,
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::NoSuchHandle(what) => write!(f, "no handle provided for {}", what),
            MuxError::ReactorGone => write!(f, "reactor gone"),
        }
    }
}

impl std::error::Error for MuxError {}
