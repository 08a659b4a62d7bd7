//! Transport seam between notification channels and the core.
//!
//! A channel (push socket, and in the future GCM/APNs-style services)
//! carries handshake frames in and notification ciphertext out. The core
//! never touches bytes on the wire; it only needs:
//!
//! - an opaque [`Identity`] for each connection attempt
//! - a send capability per registered connection ([`NotificationSocket`])
//! - a way to hand inbound acknowledgements back by correlation id
//!
//! # Architecture
//!
//! ```text
//! NotificationSocket (trait)
//!     │
//!     └── WsNotificationSocket (websocket.rs)
//!         └── queues `notification` frames onto the connection writer
//! ```
//!
//! # Wire frames
//!
//! Frames are JSON text messages tagged by `type`. Binary payloads are
//! base64 (standard alphabet):
//!
//! ```text
//! server → client: identify | authenticate | notification_key_proof
//!                  registered | notification | error
//! client → server: identity | notification_key | credentials | ack
//! ```
//!
//! Rust guideline compliant 2026-02

pub mod websocket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sockets::AckHandle;

pub use websocket::{WebSocketChannel, WsNotificationSocket};

/// Opaque per-connection token chosen by the transport/client.
///
/// Scoped to one handshake attempt and, on success, to the registered
/// socket. Not a credential by itself.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    /// Shortened form for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors a transport send capability can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The underlying connection is gone.
    #[error("socket closed")]
    Closed,
    /// The transport refused or failed the write.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Send capability of one registered connection.
///
/// `send` returns as soon as transmission has been attempted. When `ack`
/// is present the transport must eventually route the client's raw
/// acknowledgement back, either through [`AckHandle::acknowledge`] or by
/// correlation id through [`crate::sockets::SharedSockets::acknowledge`].
#[async_trait]
pub trait NotificationSocket: Send + Sync {
    /// Transmit sealed notification bytes to the client.
    async fn send(&self, ciphertext: Vec<u8>, ack: Option<AckHandle>) -> Result<(), SocketError>;
}

/// Frames the server writes to a push-socket client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Ask the client who it is.
    Identify,
    /// Per-identity public key the client seals its handshake messages to.
    Authenticate {
        /// Encoded public key material.
        public_key: String,
    },
    /// The client's nonce re-sealed to its notification key.
    NotificationKeyProof {
        /// Base64 ciphertext.
        payload: String,
    },
    /// Handshake finished; the connection now receives notifications.
    Registered {
        /// Registered identity.
        id: String,
        /// Username the credentials resolved to.
        user: String,
    },
    /// Sealed notification envelope.
    Notification {
        /// Base64 ciphertext.
        payload: String,
        /// Correlation id to echo back in an `ack` frame.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_id: Option<String>,
    },
    /// Terminal or per-frame failure.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Frames a push-socket client writes to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Answer to `identify`.
    Identity {
        /// Client-chosen identity, stable across reconnects.
        id: String,
    },
    /// `{nonce, key}` sealed to the server's public key.
    NotificationKey {
        /// Base64 ciphertext.
        payload: String,
    },
    /// `{user, pass?, hash?}` sealed to the server's public key.
    Credentials {
        /// Base64 ciphertext.
        payload: String,
    },
    /// Acknowledgement of a notification.
    Ack {
        /// Correlation id from the notification frame.
        ack_id: String,
        /// Base64 ciphertext sealed to the server's public key.
        payload: String,
    },
}
