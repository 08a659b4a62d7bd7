//! Registry of authenticated notification sockets.
//!
//! Maps a username to every socket that completed the handshake for it,
//! in registration order. A user with several devices has several
//! entries. Entries are only ever appended.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{Identity, NotificationSocket};
use crate::crypto::KeyPair;

/// A fully authenticated channel for one user.
///
/// Always encrypts to the notification key that was committed during its
/// handshake.
pub struct RegisteredSocket {
    identity: Identity,
    username: String,
    notification_public_key: String,
    /// Server keypair for the identity; acknowledgements are sealed to it.
    pub(crate) auth_keypair: KeyPair,
    socket: Arc<dyn NotificationSocket>,
}

impl RegisteredSocket {
    pub(crate) fn new(
        identity: Identity,
        username: String,
        notification_public_key: String,
        auth_keypair: KeyPair,
        socket: Arc<dyn NotificationSocket>,
    ) -> Self {
        Self {
            identity,
            username,
            notification_public_key,
            auth_keypair,
            socket,
        }
    }

    /// Transport identity of the socket.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// User the socket is registered to.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Key every notification to this socket is sealed to.
    pub fn notification_public_key(&self) -> &str {
        &self.notification_public_key
    }

    /// Server public key clients seal acknowledgements to.
    pub fn public_key(&self) -> &str {
        &self.auth_keypair.public_key
    }

    pub(crate) fn socket(&self) -> &dyn NotificationSocket {
        self.socket.as_ref()
    }
}

impl std::fmt::Debug for RegisteredSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSocket")
            .field("identity", &self.identity)
            .field("username", &self.username)
            .field("notification_public_key", &self.notification_public_key)
            .finish_non_exhaustive()
    }
}

/// Username → registered sockets.
#[derive(Default)]
pub struct SessionRegistry {
    users: HashMap<String, Vec<Arc<RegisteredSocket>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a socket under its username.
    pub fn register(&mut self, socket: RegisteredSocket) -> Arc<RegisteredSocket> {
        let socket = Arc::new(socket);
        let sockets = self.users.entry(socket.username.clone()).or_default();
        sockets.push(Arc::clone(&socket));
        log::info!(
            "[Registry] {} registered for {} ({} socket(s))",
            socket.identity.short(),
            socket.username,
            sockets.len()
        );
        socket
    }

    /// Sockets for `username` in registration order. Exact match only.
    pub fn sockets_for(&self, username: &str) -> Vec<Arc<RegisteredSocket>> {
        self.users.get(username).cloned().unwrap_or_default()
    }

    /// Total registered sockets.
    pub fn len(&self) -> usize {
        self.users.values().map(Vec::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("user_count", &self.users.len())
            .field("socket_count", &self.len())
            .finish_non_exhaustive()
    }
}
