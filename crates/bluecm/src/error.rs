//! Error types for the Connection Manager.
//!
//! Every recoverable condition is converted into a confirmation carrying one
//! of these values; none of them is fatal to the manager as a whole.

use thiserror::Error;

/// Errors surfaced to applications through confirmations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmError {
    /// The correlating key (address, connection id or element id) does not
    /// match any live connection.
    #[error("unknown connection")]
    UnknownConnection,

    /// A connect or accept registration already exists for the same
    /// (channel, context) pair.
    #[error("already connecting")]
    AlreadyConnecting,

    /// The operation was cancelled locally before it completed. This is a
    /// success-shaped outcome: nothing is left behind.
    #[error("cancelled")]
    Cancelled,

    /// A table is exhausted or an internal invariant did not hold.
    #[error("internal error")]
    InternalError,

    /// The controller reported a non-success status; the reason code is
    /// passed through verbatim.
    #[error("controller failure (reason 0x{0:02X})")]
    ControllerFailure(u8),

    /// Neither side supports a feature the request requires.
    #[error("unsupported feature")]
    UnsupportedFeature,

    /// The request was rejected before any controller interaction.
    #[error("unacceptable parameter")]
    UnacceptableParameter,
}

/// Result type for Connection Manager operations.
pub type CmResult<T> = std::result::Result<T, CmError>;
