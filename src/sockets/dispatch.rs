//! Encrypted fan-out and acknowledgement correlation.
//!
//! A send seals one envelope per recipient socket, to that socket's
//! notification key, and hands them to the transports concurrently.
//! Completion means every recipient was *attempted*; acknowledgements
//! arrive later through the [`AckTable`].
//!
//! # Envelope
//!
//! ```text
//! {"msg": "...", "url": "..."?, "id": "<correlation id>"?}
//! ```
//!
//! # Acknowledgements
//!
//! Each correlation id owns one table entry and one timer. Whichever of
//! {client ack, timer} reaches the entry first removes it and fires the
//! caller's callback; the loser finds nothing to remove. Acks that fail to
//! decrypt are dropped without touching the entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::registry::RegisteredSocket;
use crate::channel::Identity;
use crate::crypto::{CryptoProvider, PrivateKey};
use crate::error::NotifyError;

/// Caller-supplied acknowledgement listener.
pub type AckCallback = Arc<dyn Fn(AckEvent) + Send + Sync>;

/// Settlement of one recipient's acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    /// Recipient socket identity.
    pub identity: Identity,
    /// Correlation id that was placed in the envelope.
    pub correlation_id: String,
    /// Decrypted acknowledgement, or why none arrived.
    pub result: Result<Vec<u8>, NotifyError>,
}

/// A "notify user X" request.
#[derive(Clone)]
pub struct NotifyRequest {
    /// Target username (exact match).
    pub username: String,
    /// Message text.
    pub msg: String,
    /// Optional link.
    pub url: Option<String>,
    /// Fires once per recipient when acknowledgements are wanted.
    pub on_ack: Option<AckCallback>,
}

impl NotifyRequest {
    /// Request without a link or acknowledgement listener.
    pub fn new(username: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            msg: msg.into(),
            url: None,
            on_ack: None,
        }
    }

    /// Attach a link.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Ask every recipient for an acknowledgement.
    pub fn with_ack<F>(mut self, on_ack: F) -> Self
    where
        F: Fn(AckEvent) + Send + Sync + 'static,
    {
        self.on_ack = Some(Arc::new(on_ack));
        self
    }
}

impl std::fmt::Debug for NotifyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyRequest")
            .field("username", &self.username)
            .field("msg", &self.msg)
            .field("url", &self.url)
            .field("ack", &self.on_ack.is_some())
            .finish()
    }
}

/// Per-send summary: how many recipients were attempted and how many of
/// those attempts failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sockets the message was handed to.
    pub attempted: usize,
    /// Sockets whose encrypt or send step failed.
    pub failed: usize,
}

impl DeliveryReport {
    /// Recipients whose transport accepted the message.
    pub fn delivered(&self) -> usize {
        self.attempted - self.failed
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

/// Unique (not unguessable) correlation id for one recipient.
pub fn correlation_id(identity: &Identity) -> String {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let nanos = EPOCH.get_or_init(Instant::now).elapsed().as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:08x}-{nanos:x}-{seq}", identity, rand::random::<u32>())
}

struct PendingAck {
    identity: Identity,
    private_key: PrivateKey,
    callback: AckCallback,
    _timer: DropGuard,
}

/// Outstanding acknowledgement listeners by correlation id.
pub struct AckTable {
    pending: Mutex<HashMap<String, PendingAck>>,
    crypto: Arc<dyn CryptoProvider>,
}

impl std::fmt::Debug for AckTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTable").finish_non_exhaustive()
    }
}

impl AckTable {
    pub(crate) fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            crypto,
        }
    }

    /// Register a listener and start its timeout.
    pub(crate) async fn arm(
        self: &Arc<Self>,
        correlation_id: String,
        identity: Identity,
        private_key: PrivateKey,
        callback: AckCallback,
        timeout: Duration,
    ) {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let table: Weak<Self> = Arc::downgrade(self);
        let id = correlation_id.clone();

        // Entry goes in before the timer exists so a zero timeout still finds it.
        self.pending.lock().await.insert(
            correlation_id,
            PendingAck {
                identity,
                private_key,
                callback,
                _timer: token.drop_guard(),
            },
        );

        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(table) = table.upgrade() {
                        let err = NotifyError::AckTimeout(id.clone());
                        table.settle(&id, Err(err)).await;
                    }
                }
            }
        });
    }

    /// Settle `correlation_id` with `result`. Returns `false` if it was
    /// already settled.
    pub(crate) async fn settle(&self, correlation_id: &str, result: Result<Vec<u8>, NotifyError>) -> bool {
        let Some(entry) = self.pending.lock().await.remove(correlation_id) else {
            log::debug!("[Ack] {correlation_id} already settled");
            return false;
        };
        if let Err(e) = &result {
            log::debug!("[Ack] {correlation_id} settled without ack: {e}");
        }
        (entry.callback)(AckEvent {
            identity: entry.identity,
            correlation_id: correlation_id.to_string(),
            result,
        });
        true
    }

    /// Decrypt a client's raw acknowledgement and settle with it.
    ///
    /// An acknowledgement that does not open under the recipient's key
    /// leaves the listener armed for the genuine one (or the timer).
    pub(crate) async fn resolve(&self, correlation_id: &str, raw: &[u8]) -> bool {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get(correlation_id) else {
            log::debug!("[Ack] late or unknown acknowledgement {correlation_id}");
            return false;
        };
        let plaintext = match self.crypto.decrypt(raw, &entry.private_key) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("[Ack] ignoring undecryptable acknowledgement {correlation_id}: {e:#}");
                return false;
            }
        };
        let Some(entry) = pending.remove(correlation_id) else {
            return false;
        };
        drop(pending);

        (entry.callback)(AckEvent {
            identity: entry.identity,
            correlation_id: correlation_id.to_string(),
            result: Ok(plaintext),
        });
        true
    }

    /// Number of unsettled listeners.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether every listener has settled.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

/// Lets a transport report an acknowledgement for one sent message.
#[derive(Clone)]
pub struct AckHandle {
    correlation_id: String,
    table: Arc<AckTable>,
}

impl AckHandle {
    pub(crate) fn new(correlation_id: String, table: Arc<AckTable>) -> Self {
        Self {
            correlation_id,
            table,
        }
    }

    /// Id the client will echo back.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Hand over the client's raw (sealed) acknowledgement. Returns
    /// `false` if the listener had already settled or `raw` does not open.
    pub async fn acknowledge(&self, raw: &[u8]) -> bool {
        self.table.resolve(&self.correlation_id, raw).await
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Seal and hand one message to one recipient. Returns whether the
/// transport accepted it.
pub(crate) async fn deliver(
    crypto: &dyn CryptoProvider,
    acks: &Arc<AckTable>,
    ack_timeout: Duration,
    recipient: &RegisteredSocket,
    request: &NotifyRequest,
) -> bool {
    let identity = recipient.identity();

    let correlation = match &request.on_ack {
        Some(callback) => {
            let id = correlation_id(identity);
            acks.arm(
                id.clone(),
                identity.clone(),
                recipient.auth_keypair.private_key.clone(),
                Arc::clone(callback),
                ack_timeout,
            )
            .await;
            Some(id)
        }
        None => None,
    };

    let envelope = Envelope {
        msg: &request.msg,
        url: request.url.as_deref(),
        id: correlation.as_deref(),
    };

    let sealed = serde_json::to_vec(&envelope)
        .map_err(|e| NotifyError::EncryptionFailure(e.to_string()))
        .and_then(|plaintext| {
            crypto
                .encrypt(&plaintext, recipient.notification_public_key())
                .map_err(|e| NotifyError::EncryptionFailure(format!("{e:#}")))
        });

    let outcome = match sealed {
        Ok(ciphertext) => {
            let handle = correlation
                .clone()
                .map(|id| AckHandle::new(id, Arc::clone(acks)));
            recipient
                .socket()
                .send(ciphertext, handle)
                .await
                .map_err(|e| NotifyError::SendFailure(e.to_string()))
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            log::debug!("[Dispatch] sent to {} ({})", identity.short(), request.username);
            true
        }
        Err(e) => {
            log::warn!("[Dispatch] {} for {}: {e}", identity.short(), request.username);
            if let Some(id) = correlation {
                acks.settle(&id, Err(e)).await;
            }
            false
        }
    }
}
