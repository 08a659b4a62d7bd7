//! Error taxonomy for the handshake and delivery core.
//!
//! Collaborators (crypto provider, PKI store, auth modules, transports)
//! speak `anyhow`; the core folds their failures into [`NotifyError`] so
//! callers can match on what went wrong. Nothing here is process-fatal.

use thiserror::Error;

use crate::channel::Identity;

/// Failures surfaced by [`crate::sockets::SharedSockets`].
///
/// `Clone` so that the same failure can be handed to an outcome
/// subscriber and to the caller that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// No pending session (or no pending step) exists for the identity.
    #[error("no pending handshake for identity {0}")]
    UnknownIdentity(Identity),

    /// A step's timer fired before the expected client message.
    #[error("handshake timed out for identity {0}")]
    HandshakeTimeout(Identity),

    /// Ciphertext was malformed, tampered with, or sealed to another key.
    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    /// The auth check aggregator rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The target user has no registered sockets.
    #[error("no registered socket for user {0}")]
    NoRegisteredSocket(String),

    /// A recipient's transport refused the message.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// No acknowledgement arrived within the window.
    #[error("acknowledgement {0} timed out")]
    AckTimeout(String),

    /// The PKI store failed to read or write a record.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The crypto provider could not produce a keypair.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The crypto provider could not encrypt for a client key.
    #[error("encryption failed: {0}")]
    EncryptionFailure(String),
}

impl NotifyError {
    /// Whether this failure came from a timer rather than a client message.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandshakeTimeout(_) | Self::AckTimeout(_))
    }
}
