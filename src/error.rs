use thiserror::Error;

/// Errors reported synchronously by the public API.
///
/// Failures that happen while a find or upload is already in flight are
/// never returned from here; they are delivered through the registered
/// callbacks as status events instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The handle is unknown or was already destroyed.
    #[error("invalid or destroyed handler")]
    InvalidHandle,

    /// The operation is not valid in the session's current state,
    /// e.g. a setter while a transfer is running, or an abort with
    /// nothing to abort.
    #[error("operation not valid in current session state: {0}")]
    InvalidState(&'static str),

    /// Target descriptor or load list missing before `upload`.
    #[error("session configuration incomplete: {0}")]
    ConfigurationIncomplete(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
