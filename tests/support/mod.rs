//! Test doubles shared by the integration tests.
//!
//! `FakeCrypto` keeps ciphertexts readable: sealing `x` to `pub-7` yields
//! `pub-7|<base64 x>`, and only `priv-7` opens it. Client-side keys in
//! tests are arbitrary strings and are read back with [`open`].

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use rk8_notifyd::auth::{AuthChecker, Credentials};
use rk8_notifyd::channel::{NotificationSocket, SocketError};
use rk8_notifyd::crypto::{CryptoProvider, KeyPair, PrivateKey};
use rk8_notifyd::pki::{MemoryPkiStore, PkiRecord, PkiStore};
use rk8_notifyd::sockets::{AckEvent, AckHandle, Registration};
use rk8_notifyd::{Identity, NotifyError, SharedSockets, Timeouts};

/// Pass phrase [`StaticAuth`] accepts.
pub const PASSWORD: &str = "secret";

#[derive(Debug, Default)]
pub struct FakeCrypto {
    issued: AtomicUsize,
    /// Make every `encrypt` fail.
    pub refuse_encrypt: AtomicBool,
}

impl CryptoProvider for FakeCrypto {
    fn keypair(&self) -> anyhow::Result<KeyPair> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(KeyPair {
            public_key: format!("pub-{n}"),
            private_key: PrivateKey::new(format!("priv-{n}")),
        })
    }

    fn encrypt(&self, plaintext: &[u8], public_key: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(
            !self.refuse_encrypt.load(Ordering::SeqCst),
            "unusable key {public_key}"
        );
        Ok(seal_bytes(public_key, plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8], private_key: &PrivateKey) -> anyhow::Result<Vec<u8>> {
        let (to, plaintext) = try_open(ciphertext).ok_or_else(|| anyhow::anyhow!("garbage"))?;
        let expected = private_key.expose_secret().replacen("priv-", "pub-", 1);
        anyhow::ensure!(to == expected, "sealed to {to}, not {expected}");
        Ok(plaintext)
    }
}

pub fn seal_bytes(public_key: &str, plaintext: &[u8]) -> Vec<u8> {
    format!("{public_key}|{}", BASE64.encode(plaintext)).into_bytes()
}

pub fn seal(public_key: &str, value: &serde_json::Value) -> Vec<u8> {
    seal_bytes(public_key, &serde_json::to_vec(value).unwrap())
}

fn try_open(ciphertext: &[u8]) -> Option<(String, Vec<u8>)> {
    let text = std::str::from_utf8(ciphertext).ok()?;
    let (to, body) = text.split_once('|')?;
    Some((to.to_string(), BASE64.decode(body).ok()?))
}

/// Recipient key and JSON body of a fake ciphertext.
pub fn open(ciphertext: &[u8]) -> (String, serde_json::Value) {
    let (to, body) = try_open(ciphertext).expect("fake ciphertext");
    (to, serde_json::from_slice(&body).unwrap())
}

/// Accepts any user whose pass is [`PASSWORD`], optionally after a delay.
#[derive(Debug, Default)]
pub struct StaticAuth {
    pub delay: Option<Duration>,
}

#[async_trait]
impl AuthChecker for StaticAuth {
    async fn check(&self, credentials: &Credentials) -> Result<String, NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if credentials.pass.as_deref() == Some(PASSWORD) {
            Ok(credentials.user.clone())
        } else {
            Err(NotifyError::AuthFailure(format!(
                "Failed authentication with module static for {}",
                credentials.user
            )))
        }
    }
}

/// Socket that records what it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingSocket {
    pub fail: AtomicBool,
    sent: Mutex<Vec<(Vec<u8>, Option<AckHandle>)>>,
}

impl RecordingSocket {
    pub fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            sent: Mutex::default(),
        }
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, Option<AckHandle>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSocket for RecordingSocket {
    async fn send(&self, ciphertext: Vec<u8>, ack: Option<AckHandle>) -> Result<(), SocketError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SocketError::SendFailed("link down".to_string()));
        }
        self.sent.lock().unwrap().push((ciphertext, ack));
        Ok(())
    }
}

/// Store whose reads and/or writes fail while the flags are set.
#[derive(Debug, Default)]
pub struct FailingStore {
    pub fail_get: AtomicBool,
    pub fail_set: AtomicBool,
    inner: MemoryPkiStore,
}

#[async_trait]
impl PkiStore for FailingStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<PkiRecord>> {
        anyhow::ensure!(!self.fail_get.load(Ordering::SeqCst), "disk unreadable");
        self.inner.get(id).await
    }

    async fn set(&self, record: &PkiRecord) -> anyhow::Result<()> {
        anyhow::ensure!(!self.fail_set.load(Ordering::SeqCst), "disk full");
        self.inner.set(record).await
    }
}

pub struct Harness {
    pub sockets: SharedSockets,
    pub store: Arc<MemoryPkiStore>,
    pub crypto: Arc<FakeCrypto>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_auth(StaticAuth::default())
    }

    pub fn with_auth(auth: StaticAuth) -> Self {
        let store = Arc::new(MemoryPkiStore::new());
        let crypto = Arc::new(FakeCrypto::default());
        let sockets = SharedSockets::new(
            crypto.clone(),
            store.clone(),
            Arc::new(auth),
            Timeouts::default(),
        );
        Self {
            sockets,
            store,
            crypto,
        }
    }

    /// Run all three steps for `id`, returning the server public key and
    /// the registration result.
    pub async fn handshake(
        &self,
        id: &str,
        user: &str,
        notification_key: &str,
        socket: Arc<RecordingSocket>,
    ) -> (String, Result<Registration, NotifyError>) {
        let identity = Identity::from(id);
        let public_key = self
            .sockets
            .get_public_key_for_client(&identity)
            .await
            .unwrap();

        let info = serde_json::json!({"nonce": "n-1", "key": notification_key});
        self.sockets
            .receive_notification_key(&identity, &seal(&public_key, &info))
            .await
            .unwrap();

        let credentials = serde_json::json!({"user": user, "pass": PASSWORD});
        let registration = self
            .sockets
            .complete_registration(&identity, &seal(&public_key, &credentials), socket)
            .await;
        (public_key, registration)
    }
}

/// Ack callback that records every event.
pub fn ack_recorder() -> (
    impl Fn(AckEvent) + Send + Sync + 'static,
    Arc<Mutex<Vec<AckEvent>>>,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (move |event| sink.lock().unwrap().push(event), events)
}
