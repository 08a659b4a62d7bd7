//! Registration handshake states and per-step transitions.
//!
//! ```text
//! KeyIssued ─► NotificationKeyPending ─► CredentialsPending ─► Authenticating ─► Registered
//!                      │                        │                    │
//!                      └────────────────────────┴────────────────────┴──────────► Discarded
//! ```
//!
//! Everything here is free of shared state: each helper takes the
//! session's keys and a payload and returns the next value or a
//! [`NotifyError`]. [`super::SharedSockets`] owns locking, timers and
//! cleanup.

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::channel::Identity;
use crate::crypto::{CryptoProvider, PrivateKey};
use crate::error::NotifyError;

/// Where an identity is in the registration exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Keypair chosen, public key about to be handed out.
    KeyIssued,
    /// Waiting for the client's sealed `{nonce, key}`.
    NotificationKeyPending,
    /// Possession proof sent, waiting for sealed credentials.
    CredentialsPending,
    /// Credentials handed to the auth checker.
    Authenticating,
    /// Terminal: socket registered.
    Registered,
    /// Terminal: attempt abandoned.
    Discarded,
}

/// A step guarded by its own timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Step 2: the client asserts its notification key.
    NotificationKey,
    /// Step 3: the client sends credentials.
    Credentials,
    /// Step 3, second half: the external auth check.
    Authentication,
}

impl HandshakeState {
    /// The step this state is waiting on, if any.
    pub fn expected_step(self) -> Option<Step> {
        match self {
            Self::NotificationKeyPending => Some(Step::NotificationKey),
            Self::CredentialsPending => Some(Step::Credentials),
            Self::Authenticating => Some(Step::Authentication),
            Self::KeyIssued | Self::Registered | Self::Discarded => None,
        }
    }

    /// Successor on success. Terminal states have none.
    pub fn advance(self) -> Option<Self> {
        match self {
            Self::KeyIssued => Some(Self::NotificationKeyPending),
            Self::NotificationKeyPending => Some(Self::CredentialsPending),
            Self::CredentialsPending => Some(Self::Authenticating),
            Self::Authenticating => Some(Self::Registered),
            Self::Registered | Self::Discarded => None,
        }
    }

    /// Whether the attempt has settled.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Registered | Self::Discarded)
    }
}

/// Decrypted step 2 payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationInfo {
    /// Client challenge, echoed back under `key`.
    pub nonce: serde_json::Value,
    /// Client-asserted notification public key.
    pub key: String,
}

#[derive(Serialize)]
struct NonceProof<'a> {
    nonce: &'a serde_json::Value,
}

/// Open the client's sealed `{nonce, key}`.
pub fn open_notification_info(
    crypto: &dyn CryptoProvider,
    ciphertext: &[u8],
    private_key: &PrivateKey,
) -> Result<NotificationInfo, NotifyError> {
    let plaintext = crypto
        .decrypt(ciphertext, private_key)
        .map_err(|e| NotifyError::DecryptionFailure(format!("{e:#}")))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| NotifyError::DecryptionFailure(format!("invalid notification info: {e}")))
}

/// Pick the notification key to trust: a committed key always wins.
pub fn authoritative_key(identity: &Identity, committed: Option<&str>, asserted: String) -> String {
    match committed {
        Some(committed) => {
            if committed != asserted {
                log::warn!(
                    "[Handshake] {} asserted a new notification key; keeping the committed one",
                    identity.short()
                );
            }
            committed.to_string()
        }
        None => asserted,
    }
}

/// Seal `{nonce}` to `notification_key`, proving we hold the private half
/// of the key the client sealed to.
pub fn prove_possession(
    crypto: &dyn CryptoProvider,
    nonce: &serde_json::Value,
    notification_key: &str,
) -> Result<Vec<u8>, NotifyError> {
    let proof = serde_json::to_vec(&NonceProof { nonce })
        .map_err(|e| NotifyError::EncryptionFailure(e.to_string()))?;
    crypto
        .encrypt(&proof, notification_key)
        .map_err(|e| NotifyError::EncryptionFailure(format!("{e:#}")))
}

/// Open the client's sealed credentials.
pub fn open_credentials(
    crypto: &dyn CryptoProvider,
    ciphertext: &[u8],
    private_key: &PrivateKey,
) -> Result<Credentials, NotifyError> {
    let plaintext = crypto
        .decrypt(ciphertext, private_key)
        .map_err(|e| NotifyError::DecryptionFailure(format!("{e:#}")))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| NotifyError::DecryptionFailure(format!("invalid credentials: {e}")))
}

/// How one handshake attempt settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The socket joined the registry under `user`.
    Registered {
        /// Username the credentials resolved to.
        user: String,
    },
    /// The attempt failed or timed out.
    Discarded {
        /// Why it was abandoned.
        reason: NotifyError,
    },
    /// A newer public-key request for the same identity replaced it.
    Superseded,
}

/// Published exactly once per handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Identity the attempt belonged to.
    pub identity: Identity,
    /// Process-unique attempt number.
    pub attempt: u64,
    /// Result.
    pub kind: OutcomeKind,
}
