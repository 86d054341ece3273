//! Typed failures surfaced to callers of the core.

use thiserror::Error;

/// Errors that can occur in the connection manager and execution sandbox.
///
/// Protocol-level decode errors never appear here: malformed inbound frames
/// are absorbed by the notification router (logged, snapshot untouched),
/// because the device cannot be asked to resend. A link dropping mid-run is
/// not an error either; the sandbox reports it as
/// [`RunOutcome::ConnectionLost`](crate::sandbox::RunOutcome::ConnectionLost).
#[derive(Error, Debug)]
pub enum CoreError {
    /// A command was issued without an active device link.
    #[error("not connected to a device")]
    NotConnected,

    /// `connect()` was called while a connection attempt was in progress.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// `connect()` was called while already connected.
    #[error("already connected to a device")]
    AlreadyConnected,

    /// A run was requested while another one is active.
    #[error("a program is already running")]
    Busy,

    /// The run was stopped by the user. Intentional, not a failure.
    #[error("run cancelled")]
    Cancelled,

    /// A bounded wait elapsed before the operation finished.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Transport-level failure from the underlying link.
    #[error("link error: {0}")]
    Link(#[from] anyhow::Error),
}
