//! Error types for the ccnd forwarding plane.

use thiserror::Error;

/// All possible errors surfaced by the forwarding core.
///
/// Nothing here is fatal to the process; callers drop, count, or NACK as
/// appropriate for where the error arose.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed wire bytes; the message is dropped and counted.
    #[error("parse error: {0}")]
    Parse(String),

    /// An Interest carried a nonce seen recently from another face.
    #[error("duplicate nonce")]
    DuplicateNonce,

    /// A non-local Interest arrived for a prefix marked local.
    #[error("nonlocal interest for local prefix")]
    NonLocalToLocalPrefix,

    /// Table expansion failed; the operation is aborted.
    #[error("out of table capacity")]
    NoCapacity,

    /// Transmit to a face that no longer exists.
    #[error("face {0} is gone")]
    FaceGone(u32),

    /// The kernel would block; the remainder is parked in the outbuf.
    #[error("send deferred")]
    SendDeferred,

    /// The peer is gone; the face is latched no-send.
    #[error("send broken: {0}")]
    SendBroken(String),

    /// Framing violation on a face.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A management request was rejected; carried back as a NACK.
    #[error("admin error {code}: {reason}")]
    Admin { code: u16, reason: String },

    /// I/O error from the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// NACK status code for management failures, 450 when the error was
    /// not raised as an admin rejection.
    pub fn admin_code(&self) -> u16 {
        match self {
            Error::Admin { code, .. } => *code,
            _ => 450,
        }
    }
}
