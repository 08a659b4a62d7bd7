//! Shared client sockets: handshake, registry and encrypted dispatch.
//!
//! [`SharedSockets`] is the one handle transports and the trigger
//! endpoint talk to. It owns:
//!
//! - pending sessions for identities mid-handshake ([`pending`])
//! - the per-step state machine ([`handshake`])
//! - the username → socket registry ([`registry`])
//! - fan-out and acknowledgement correlation ([`dispatch`])
//!
//! # Handshake
//!
//! ```text
//! transport                          SharedSockets
//!   │ get_public_key_for_client(id) ───► load record or generate keypair
//!   │ ◄──────────────────── public key   arm key-issue timer (120 s)
//!   │ receive_notification_key(id, ct) ► open {nonce,key}, first-wins
//!   │ ◄────────── {nonce} sealed to key   arm step timer (15 s)
//!   │ complete_registration(id, ct) ───► open credentials, arm step timer
//!   │                                    auth check → persist → register
//!   │ ◄──────────────────── {id, user}
//! ```
//!
//! # Timers
//!
//! Every pending session owns at most one timer. Arming replaces the
//! previous timer's drop guard, which cancels it. Each arm also bumps a
//! generation counter; a timer that fires carries the generation it was
//! armed with and the step it guards, and does nothing unless the
//! session is still waiting on that step under that generation. A firing
//! timer feeds "no payload" into the same transition a real message uses.
//!
//! # Concurrency
//!
//! Pending sessions, pending notification keys and the registry each sit
//! behind their own lock. Step transitions run to completion under the
//! sessions lock except for the external auth check and PKI writes,
//! which run unlocked and re-validate afterwards.
//!
//! Rust guideline compliant 2026-02

pub mod dispatch;
pub mod handshake;
pub mod pending;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthChecker;
use crate::channel::{Identity, NotificationSocket};
use crate::crypto::CryptoProvider;
use crate::error::NotifyError;
use crate::pki::{PkiRecord, PkiStore};

pub use dispatch::{AckCallback, AckEvent, AckHandle, DeliveryReport, NotifyRequest};
pub use handshake::{HandshakeOutcome, HandshakeState, OutcomeKind, Step};
pub use pending::PendingSessions;
pub use registry::{RegisteredSocket, SessionRegistry};

use dispatch::AckTable;
use pending::PendingSession;

/// Buffered outcomes per subscriber before it starts lagging.
const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Handshake and acknowledgement windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// From key issue to the notification-key message. Generous to absorb
    /// key generation on slow clients.
    pub key_issue: Duration,
    /// Credentials message, and separately the auth check.
    pub step: Duration,
    /// Per-recipient acknowledgement window.
    pub ack: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            key_issue: Duration::from_secs(120),
            step: Duration::from_secs(15),
            ack: Duration::from_secs(10),
        }
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Registered identity.
    pub id: Identity,
    /// Username the credentials resolved to.
    pub user: String,
}

struct Inner {
    crypto: Arc<dyn CryptoProvider>,
    store: Arc<dyn PkiStore>,
    auth: Arc<dyn AuthChecker>,
    timeouts: Timeouts,
    pending: PendingSessions,
    registry: RwLock<SessionRegistry>,
    acks: Arc<AckTable>,
    outcomes: broadcast::Sender<HandshakeOutcome>,
}

/// Cloneable handle to the handshake and dispatch core.
#[derive(Clone)]
pub struct SharedSockets {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedSockets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSockets")
            .field("timeouts", &self.inner.timeouts)
            .finish_non_exhaustive()
    }
}

impl SharedSockets {
    /// Wire the core to its collaborators.
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        store: Arc<dyn PkiStore>,
        auth: Arc<dyn AuthChecker>,
        timeouts: Timeouts,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                acks: Arc::new(AckTable::new(Arc::clone(&crypto))),
                crypto,
                store,
                auth,
                timeouts,
                pending: PendingSessions::default(),
                registry: RwLock::new(SessionRegistry::new()),
                outcomes,
            }),
        }
    }

    /// Configured timeouts.
    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    /// Step 1: hand out the public key `identity` seals its handshake to.
    ///
    /// A stored record marks a returning client and its keys are reused;
    /// otherwise a fresh keypair is generated. Either way a new attempt
    /// starts and replaces any attempt already pending for `identity`.
    pub async fn get_public_key_for_client(&self, identity: &Identity) -> Result<String, NotifyError> {
        self.inner.issue_key(identity).await
    }

    /// Step 2: accept the sealed `{nonce, key}` and return `{nonce}`
    /// sealed to the authoritative notification key.
    pub async fn receive_notification_key(
        &self,
        identity: &Identity,
        encrypted: &[u8],
    ) -> Result<Vec<u8>, NotifyError> {
        self.inner
            .notification_key_step(identity, Some(encrypted), None)
            .await
    }

    /// Step 3: accept sealed credentials, authenticate, persist and
    /// register `socket` under the resolved username.
    pub async fn complete_registration(
        &self,
        identity: &Identity,
        encrypted: &[u8],
        socket: Arc<dyn NotificationSocket>,
    ) -> Result<Registration, NotifyError> {
        self.inner
            .credentials_step(identity, Some((encrypted, socket)), None)
            .await
    }

    /// Seal `request` to every socket registered for its user.
    ///
    /// Succeeds once every recipient has been attempted, however many
    /// attempts failed. Fails only when the user has no sockets.
    pub async fn send(&self, request: NotifyRequest) -> Result<DeliveryReport, NotifyError> {
        let inner = &self.inner;
        let recipients = inner.registry.read().await.sockets_for(&request.username);
        if recipients.is_empty() {
            log::info!("[Dispatch] no registered socket for {}", request.username);
            return Err(NotifyError::NoRegisteredSocket(request.username));
        }

        let attempts = recipients.iter().map(|recipient| {
            dispatch::deliver(
                inner.crypto.as_ref(),
                &inner.acks,
                inner.timeouts.ack,
                recipient,
                &request,
            )
        });
        let failed = join_all(attempts).await.into_iter().filter(|ok| !ok).count();

        let report = DeliveryReport {
            attempted: recipients.len(),
            failed,
        };
        log::info!(
            "[Dispatch] {}: {}/{} socket(s) accepted",
            request.username,
            report.delivered(),
            report.attempted
        );
        Ok(report)
    }

    /// Route a client's raw acknowledgement by correlation id. Returns
    /// `false` when nothing was settled; an undecryptable `raw` leaves the
    /// listener armed.
    pub async fn acknowledge(&self, correlation_id: &str, raw: &[u8]) -> bool {
        self.inner.acks.resolve(correlation_id, raw).await
    }

    /// Receive one [`HandshakeOutcome`] per attempt from now on.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<HandshakeOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Whether a pending session (live or retained) exists for `identity`.
    pub async fn has_pending(&self, identity: &Identity) -> bool {
        self.inner.pending.contains(identity).await
    }

    /// State of `identity`'s pending session.
    pub async fn pending_state(&self, identity: &Identity) -> Option<HandshakeState> {
        self.inner.pending.state(identity).await
    }

    /// Whether a notification key is held for `identity` between steps 2 and 3.
    pub async fn has_pending_notification_key(&self, identity: &Identity) -> bool {
        self.inner.pending.has_notification_key(identity).await
    }

    /// Registered sockets for `username`, in registration order.
    pub async fn sockets_for(&self, username: &str) -> Vec<Arc<RegisteredSocket>> {
        self.inner.registry.read().await.sockets_for(username)
    }

    /// Acknowledgement listeners not yet settled.
    pub async fn pending_acks(&self) -> usize {
        self.inner.acks.len().await
    }
}

impl Inner {
    fn publish(&self, outcome: HandshakeOutcome) {
        log::debug!(
            "[Handshake] attempt {} for {} settled: {:?}",
            outcome.attempt,
            outcome.identity.short(),
            outcome.kind
        );
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome);
    }

    /// Replace `session`'s timer with one for `step`.
    fn arm(self: &Arc<Self>, session: &mut PendingSession, step: Step, after: Duration) {
        let generation = self.pending.next_generation();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = Arc::downgrade(self);
        let identity = session.identity.clone();

        session.generation = generation;
        session.timer = Some(token.drop_guard());

        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.on_timer(identity, step, generation).await;
                    }
                }
            }
        });
    }

    async fn on_timer(self: Arc<Self>, identity: Identity, step: Step, generation: u64) {
        log::debug!("[Handshake] {step:?} timer fired for {}", identity.short());
        let settled = match step {
            Step::NotificationKey => {
                if self.pending.has_notification_key(&identity).await {
                    log::debug!("[Handshake] notification key already received for {}", identity.short());
                    return;
                }
                self.notification_key_step(&identity, None, Some(generation))
                    .await
                    .map(drop)
            }
            Step::Credentials => self
                .credentials_step(&identity, None, Some(generation))
                .await
                .map(drop),
            Step::Authentication => {
                self.expire_authentication(&identity, generation).await;
                return;
            }
        };
        if let Err(NotifyError::UnknownIdentity(_)) = settled {
            log::debug!("[Handshake] stale {step:?} timer for {}", identity.short());
        }
    }

    async fn issue_key(self: &Arc<Self>, identity: &Identity) -> Result<String, NotifyError> {
        // Only `Ok(None)` is a new client. A failed lookup aborts the attempt.
        let persisted = self.store.get(identity.as_ref()).await.map_err(|e| {
            let err = NotifyError::PersistenceFailure(format!("{e:#}"));
            log::error!("[Handshake] PKI lookup for {} failed: {err}", identity.short());
            err
        })?;

        let created_from_persisted = persisted.is_some();
        let (keypair, committed_key) = match persisted {
            Some(record) => {
                log::info!("[Handshake] returning client {}", identity.short());
                (record.keypair(), record.notification_public_key)
            }
            None => {
                let keypair = self
                    .crypto
                    .keypair()
                    .map_err(|e| NotifyError::KeyGeneration(format!("{e:#}")))?;
                (keypair, None)
            }
        };
        let public_key = keypair.public_key.clone();

        let attempt = self.pending.next_attempt();
        let mut session = PendingSession::new(
            identity.clone(),
            attempt,
            keypair,
            committed_key,
            created_from_persisted,
        );
        session.advance();

        let previous = {
            let mut sessions = self.pending.sessions.lock().await;
            self.pending.notification_keys.lock().await.remove(identity);
            self.arm(&mut session, Step::NotificationKey, self.timeouts.key_issue);
            sessions.insert(identity.clone(), session)
        };

        if let Some(previous) = previous.filter(|p| !p.state.is_terminal()) {
            log::warn!(
                "[Handshake] attempt {} for {} superseded by attempt {attempt}",
                previous.attempt,
                identity.short()
            );
            self.publish(HandshakeOutcome {
                identity: identity.clone(),
                attempt: previous.attempt,
                kind: OutcomeKind::Superseded,
            });
        }

        log::info!("[Handshake] key issued to {} (attempt {attempt})", identity.short());
        Ok(public_key)
    }

    /// Step 2 transition. `payload` is `None` when the timer fired.
    async fn notification_key_step(
        self: &Arc<Self>,
        identity: &Identity,
        payload: Option<&[u8]>,
        generation: Option<u64>,
    ) -> Result<Vec<u8>, NotifyError> {
        let mut sessions = self.pending.sessions.lock().await;
        let Some(session) = sessions
            .get_mut(identity)
            .filter(|s| s.awaits(Step::NotificationKey, generation))
        else {
            if payload.is_some() {
                log::debug!("[Handshake] unexpected notification key from {}", identity.short());
            }
            return Err(NotifyError::UnknownIdentity(identity.clone()));
        };

        let crypto = self.crypto.as_ref();
        let result = match payload {
            None => Err(NotifyError::HandshakeTimeout(identity.clone())),
            Some(ciphertext) => {
                handshake::open_notification_info(crypto, ciphertext, &session.keypair.private_key)
                    .and_then(|info| {
                        let key = handshake::authoritative_key(
                            identity,
                            session.committed_key.as_deref(),
                            info.key,
                        );
                        handshake::prove_possession(crypto, &info.nonce, &key)
                            .map(|proof| (key, proof))
                    })
            }
        };

        match result {
            Ok((key, proof)) => {
                session.advance();
                session.notification_key = Some(key.clone());
                self.arm(session, Step::Credentials, self.timeouts.step);
                self.pending
                    .notification_keys
                    .lock()
                    .await
                    .insert(identity.clone(), key);
                log::debug!("[Handshake] notification key accepted for {}", identity.short());
                Ok(proof)
            }
            Err(e) => {
                let outcome = self.discard(&mut sessions, identity, e.clone()).await;
                drop(sessions);
                if let Some(outcome) = outcome {
                    self.publish(outcome);
                }
                Err(e)
            }
        }
    }

    /// Step 3 transition. `input` is `None` when the timer fired.
    async fn credentials_step(
        self: &Arc<Self>,
        identity: &Identity,
        input: Option<(&[u8], Arc<dyn NotificationSocket>)>,
        generation: Option<u64>,
    ) -> Result<Registration, NotifyError> {
        let mut sessions = self.pending.sessions.lock().await;
        let Some(session) = sessions
            .get_mut(identity)
            .filter(|s| s.awaits(Step::Credentials, generation))
        else {
            if input.is_some() {
                log::debug!("[Handshake] unexpected credentials from {}", identity.short());
            }
            return Err(NotifyError::UnknownIdentity(identity.clone()));
        };

        let opened = match input {
            None => Err(NotifyError::HandshakeTimeout(identity.clone())),
            Some((ciphertext, socket)) => handshake::open_credentials(
                self.crypto.as_ref(),
                ciphertext,
                &session.keypair.private_key,
            )
            .map(|credentials| (credentials, socket)),
        };

        let (credentials, socket) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let outcome = self.discard(&mut sessions, identity, e.clone()).await;
                drop(sessions);
                if let Some(outcome) = outcome {
                    self.publish(outcome);
                }
                return Err(e);
            }
        };

        session.advance();
        self.arm(session, Step::Authentication, self.timeouts.step);
        let generation = session.generation;
        drop(sessions);

        log::debug!(
            "[Handshake] authenticating {} as {}",
            identity.short(),
            credentials.user
        );
        let verdict = self.auth.check(&credentials).await;

        let mut sessions = self.pending.sessions.lock().await;
        let still_current = sessions.get(identity).is_some_and(|s| {
            s.state == HandshakeState::Authenticating && s.generation == generation
        });
        if !still_current {
            log::debug!("[Handshake] auth verdict for {} arrived too late", identity.short());
            return Err(NotifyError::HandshakeTimeout(identity.clone()));
        }

        let user = match verdict {
            Ok(user) => user,
            Err(e) => {
                let outcome = self.discard(&mut sessions, identity, e.clone()).await;
                drop(sessions);
                if let Some(outcome) = outcome {
                    self.publish(outcome);
                }
                return Err(e);
            }
        };

        let Some(mut session) = sessions.remove(identity) else {
            return Err(NotifyError::UnknownIdentity(identity.clone()));
        };
        let pending_key = self.pending.notification_keys.lock().await.remove(identity);
        drop(sessions);

        session.timer = None;
        session.advance();
        let Some(notification_key) = pending_key.or_else(|| session.notification_key.take()) else {
            return Err(NotifyError::UnknownIdentity(identity.clone()));
        };

        let record = PkiRecord::new(
            identity.as_ref(),
            &session.keypair,
            Some(notification_key.clone()),
        );
        if let Err(e) = self.store.set(&record).await {
            let err = NotifyError::PersistenceFailure(format!("{e:#}"));
            log::error!(
                "[Handshake] {}: {err}; registration kept in memory only",
                identity.short()
            );
        }

        self.registry.write().await.register(RegisteredSocket::new(
            identity.clone(),
            user.clone(),
            notification_key,
            session.keypair.clone(),
            socket,
        ));

        self.publish(HandshakeOutcome {
            identity: identity.clone(),
            attempt: session.attempt,
            kind: OutcomeKind::Registered { user: user.clone() },
        });

        Ok(Registration {
            id: identity.clone(),
            user,
        })
    }

    async fn expire_authentication(&self, identity: &Identity, generation: u64) {
        let mut sessions = self.pending.sessions.lock().await;
        let waiting = sessions
            .get(identity)
            .is_some_and(|s| s.awaits(Step::Authentication, Some(generation)));
        if !waiting {
            log::debug!("[Handshake] stale authentication timer for {}", identity.short());
            return;
        }

        let outcome = self
            .discard(
                &mut sessions,
                identity,
                NotifyError::HandshakeTimeout(identity.clone()),
            )
            .await;
        drop(sessions);
        if let Some(outcome) = outcome {
            self.publish(outcome);
        }
    }

    /// Settle `identity`'s attempt as failed.
    ///
    /// The session and pending notification key are removed unless the
    /// identity already has a committed notification key, in which case
    /// both stay so the trusted record is never purged by a failed retry.
    async fn discard(
        &self,
        sessions: &mut HashMap<Identity, PendingSession>,
        identity: &Identity,
        reason: NotifyError,
    ) -> Option<HandshakeOutcome> {
        let session = sessions.get_mut(identity)?;
        if session.state.is_terminal() {
            return None;
        }

        session.state = HandshakeState::Discarded;
        session.timer = None;
        let attempt = session.attempt;

        if session.has_committed_key() {
            log::info!(
                "[Handshake] keeping trusted state for {} after failed attempt",
                identity.short()
            );
        } else {
            sessions.remove(identity);
            self.pending.notification_keys.lock().await.remove(identity);
        }

        if reason.is_timeout() {
            log::info!("[Handshake] {} discarded: {reason}", identity.short());
        } else {
            log::warn!("[Handshake] {} discarded: {reason}", identity.short());
        }
        Some(HandshakeOutcome {
            identity: identity.clone(),
            attempt,
            kind: OutcomeKind::Discarded { reason },
        })
    }
}
