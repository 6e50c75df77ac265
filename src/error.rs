//! Error types for Moviola.

use thiserror::Error;

/// Result type alias using Moviola's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Moviola operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A stack operation reached below the available depth.
    #[error("stack underflow")]
    StackUnderflow,

    /// A token looked like a factory request but never resolved.
    #[error("unresolved filter or input: {0}")]
    UnresolvedToken(String),

    /// A word was used or forgotten without being defined.
    #[error("word does not exist: {0}")]
    UnknownWord(String),

    /// A property assignment named an unknown property or carried a value
    /// that does not parse as the property's type.
    #[error("invalid property {name}: {reason}")]
    InvalidProperty {
        /// The property name as written in the assignment.
        name: String,
        /// Why the assignment was rejected.
        reason: String,
    },

    /// Filter slot binding failed (underflow or a rejected connection).
    #[error("graph connection failure: {0}")]
    GraphConnection(String),

    /// The distributor's wait for a scheduled position expired.
    #[error("timed out after {timeout_ms}ms waiting for frame {position}")]
    SchedulingTimeout {
        /// The requested frame position.
        position: i32,
        /// The configured wait in milliseconds.
        timeout_ms: u64,
    },

    /// An indexer job did not acknowledge cancellation within the bound.
    #[error("timed out cancelling index job for {0}")]
    JobCancelTimeout(String),

    /// No index format version could make sense of the resource.
    #[error("unreadable index: {0}")]
    IndexUnreadable(String),

    /// Malformed program text (unterminated word definition and friends).
    #[error("syntax error: {0}")]
    Syntax(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
