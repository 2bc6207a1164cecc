use std::io;
use thiserror::Error;

/// Shared error type for the pool's fallible public operations.
///
/// Internal races are never surfaced; they are resolved by retrying the
/// counter compare-exchange. Only the synchronous failure kinds below cross
/// the crate boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The operating system refused to start a thread. The counter change
    /// that promised the thread has been rolled back; the next gate tick or
    /// work notification will try again.
    #[error("spawning a pool thread failed")]
    ThreadCreationFailed(#[source] io::Error),

    /// A configuration value or argument made no sense. Nothing was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The pool is shutting down and no longer accepts this operation.
    #[error("the pool is shutting down")]
    Shutdown,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
