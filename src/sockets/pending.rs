//! In-memory state for identities that are mid-handshake.
//!
//! Two maps, each behind its own lock:
//!
//! - `sessions`: identity → [`PendingSession`] (keys, state, armed timer)
//! - `notification_keys`: identity → authoritative notification key,
//!   held only between the notification-key and credentials steps
//!
//! Lock order is always `sessions` then `notification_keys`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::DropGuard;

use super::handshake::{HandshakeState, Step};
use crate::channel::Identity;
use crate::crypto::KeyPair;

/// One identity's in-flight handshake.
pub struct PendingSession {
    pub(crate) identity: Identity,
    pub(crate) attempt: u64,
    pub(crate) keypair: KeyPair,
    /// Key committed by an earlier successful registration.
    pub(crate) committed_key: Option<String>,
    /// Authoritative key chosen at the notification-key step.
    pub(crate) notification_key: Option<String>,
    pub(crate) created_from_persisted: bool,
    pub(crate) state: HandshakeState,
    /// Dropping the guard cancels the armed timer.
    pub(crate) timer: Option<DropGuard>,
    /// Changes on every re-arm so a late timer can tell it is stale.
    pub(crate) generation: u64,
}

impl PendingSession {
    pub(crate) fn new(
        identity: Identity,
        attempt: u64,
        keypair: KeyPair,
        committed_key: Option<String>,
        created_from_persisted: bool,
    ) -> Self {
        Self {
            identity,
            attempt,
            keypair,
            committed_key,
            notification_key: None,
            created_from_persisted,
            state: HandshakeState::KeyIssued,
            timer: None,
            generation: 0,
        }
    }

    /// Whether the session is waiting on `step`, and, for timer
    /// callbacks, whether the timer is still the current one.
    pub(crate) fn awaits(&self, step: Step, generation: Option<u64>) -> bool {
        self.state.expected_step() == Some(step)
            && generation.is_none_or(|g| g == self.generation)
    }

    /// Move to the successor state.
    pub(crate) fn advance(&mut self) {
        if let Some(next) = self.state.advance() {
            self.state = next;
        }
    }

    /// Whether a failed attempt must leave this identity's state in place.
    pub(crate) fn has_committed_key(&self) -> bool {
        self.committed_key.is_some()
    }
}

impl std::fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSession")
            .field("identity", &self.identity)
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .field("created_from_persisted", &self.created_from_persisted)
            .field("committed", &self.committed_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Pending sessions and pending notification keys.
#[derive(Debug, Default)]
pub struct PendingSessions {
    pub(crate) sessions: Mutex<HashMap<Identity, PendingSession>>,
    pub(crate) notification_keys: Mutex<HashMap<Identity, String>>,
    next_attempt: AtomicU64,
    next_generation: AtomicU64,
}

impl PendingSessions {
    pub(crate) fn next_attempt(&self) -> u64 {
        self.next_attempt.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether a session (live or retained) exists for `identity`.
    pub async fn contains(&self, identity: &Identity) -> bool {
        self.sessions.lock().await.contains_key(identity)
    }

    /// Current state of `identity`'s session.
    pub async fn state(&self, identity: &Identity) -> Option<HandshakeState> {
        self.sessions.lock().await.get(identity).map(|s| s.state)
    }

    /// Whether a notification key is held for `identity`.
    pub async fn has_notification_key(&self, identity: &Identity) -> bool {
        self.notification_keys.lock().await.contains_key(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn session(committed: Option<&str>) -> PendingSession {
        PendingSession::new(
            Identity::from("conn-1"),
            1,
            KeyPair {
                public_key: "pub".into(),
                private_key: PrivateKey::new("priv"),
            },
            committed.map(str::to_string),
            committed.is_some(),
        )
    }

    #[test]
    fn test_awaits_checks_state_and_generation() {
        let mut s = session(None);
        assert!(!s.awaits(Step::NotificationKey, None));

        s.advance();
        s.generation = 7;
        assert!(s.awaits(Step::NotificationKey, None));
        assert!(s.awaits(Step::NotificationKey, Some(7)));
        assert!(!s.awaits(Step::NotificationKey, Some(6)));
        assert!(!s.awaits(Step::Credentials, Some(7)));
    }

    #[test]
    fn test_committed_key() {
        assert!(session(Some("K1")).has_committed_key());
        assert!(!session(None).has_committed_key());
    }

    #[test]
    fn test_counters_are_unique() {
        let pending = PendingSessions::default();
        let a = pending.next_attempt();
        let b = pending.next_attempt();
        assert_ne!(a, b);
        assert_ne!(pending.next_generation(), pending.next_generation());
    }
}
