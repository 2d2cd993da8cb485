//! Error types for control tower operations.
//!
//! This module defines [`Error`], the primary error type for the topic
//! tailer, along with a convenient [`Result`] type alias.

use common::serde::DeserializeError;

/// Error type for control tower operations.
///
/// # Error Categories
///
/// - [`NotFound`](Error::NotFound): a record or gap arrived for a log the
///   reader is not reading, or out of sequence order, or a subscription
///   lookup missed. Recovered locally: the caller logs and drops the
///   event.
/// - [`NoBuffer`](Error::NoBuffer): a bounded command queue or sink is
///   full and backpressure cannot be applied across the thread boundary.
///   Surfaced to the caller, which retries.
/// - [`InvalidArgument`](Error::InvalidArgument): a malformed message or
///   bad parameter. Surfaced to the wire layer, which closes the stream.
/// - [`Internal`](Error::Internal): an invariant violation; indicates a
///   bug. Asserted in debug builds, logged and skipped in release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The referenced log, record position, or subscription is unknown.
    NotFound,

    /// A bounded queue is full; the command was not accepted.
    NoBuffer,

    /// The caller provided a malformed message or invalid parameter.
    InvalidArgument(String),

    /// Invariant violation indicating a bug.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::NoBuffer => write!(f, "no buffer space available"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl From<DeserializeError> for Error {
    fn from(err: DeserializeError) -> Self {
        Error::InvalidArgument(err.message)
    }
}

/// Result type alias for control tower operations.
pub type Result<T> = std::result::Result<T, Error>;
