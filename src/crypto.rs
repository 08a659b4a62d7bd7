//! Keypair, encrypt and decrypt capability used by the handshake core.
//!
//! The core never picks an algorithm; it calls a [`CryptoProvider`].
//! The shipped provider, [`EciesProvider`], seals payloads to a P-256
//! public key with an ephemeral ECDH exchange, HKDF-SHA256 and
//! AES-256-GCM.
//!
//! # Wire Format
//!
//! ```text
//! ephemeral public key (65 bytes, SEC1 uncompressed)
//! || nonce (12 bytes)
//! || AES-256-GCM ciphertext + tag
//! ```
//!
//! Public keys travel as base64url (no padding) SEC1 points, private keys
//! as base64url raw 32-byte scalars.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Uncompressed SEC1 point size for P-256.
const POINT_SIZE: usize = 65;

/// HKDF info string binding derived keys to this scheme.
const HKDF_INFO: &[u8] = b"rk8-notifyd/ecies/p256-aes256gcm/v1";

/// Encoded private key material.
///
/// Wiped on drop and never printed. Only crypto providers and the PKI
/// store should read it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    /// Wrap encoded key material.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encoded key material, for crypto providers.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Asymmetric keypair issued to one identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Encoded public key, safe to hand to clients.
    pub public_key: String,
    /// Encoded private key, never leaves the process except via the PKI store.
    pub private_key: PrivateKey,
}

/// Opaque asymmetric crypto capability.
///
/// Implementations must fail (not panic) on malformed input or foreign keys.
pub trait CryptoProvider: Send + Sync {
    /// Generate a fresh keypair.
    fn keypair(&self) -> Result<KeyPair>;

    /// Seal `plaintext` so only the holder of `public_key`'s private half can read it.
    fn encrypt(&self, plaintext: &[u8], public_key: &str) -> Result<Vec<u8>>;

    /// Open a ciphertext produced by [`encrypt`](Self::encrypt).
    fn decrypt(&self, ciphertext: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>>;
}

/// ECIES over P-256 with HKDF-SHA256 and AES-256-GCM.
#[derive(Debug, Default, Clone, Copy)]
pub struct EciesProvider;

impl EciesProvider {
    /// Create the provider.
    pub fn new() -> Self {
        Self
    }

    fn parse_public_key(public_key: &str) -> Result<PublicKey> {
        let bytes = BASE64URL
            .decode(public_key)
            .context("Invalid base64url for public key")?;
        PublicKey::from_sec1_bytes(&bytes).context("Public key is not a valid P-256 point")
    }

    fn parse_private_key(private_key: &PrivateKey) -> Result<SecretKey> {
        let bytes = Zeroizing::new(
            BASE64URL
                .decode(private_key.expose_secret())
                .context("Invalid base64url for private key")?,
        );
        SecretKey::from_slice(&bytes).context("Private key is not a valid P-256 scalar")
    }

    /// Derive the AES key from the ECDH secret, salted with the ephemeral point.
    fn derive_key(shared_secret: &[u8], ephemeral_point: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let hkdf = Hkdf::<Sha256>::new(Some(ephemeral_point), shared_secret);
        let mut key = Zeroizing::new([0u8; 32]);
        hkdf.expand(HKDF_INFO, &mut *key)
            .map_err(|e| anyhow::anyhow!("Key derivation failed: {e}"))?;
        Ok(key)
    }
}

impl CryptoProvider for EciesProvider {
    fn keypair(&self) -> Result<KeyPair> {
        let secret = SecretKey::random(&mut OsRng);
        let public_point = secret.public_key().to_encoded_point(false);

        Ok(KeyPair {
            public_key: BASE64URL.encode(public_point.as_bytes()),
            private_key: PrivateKey::new(BASE64URL.encode(secret.to_bytes().as_slice())),
        })
    }

    fn encrypt(&self, plaintext: &[u8], public_key: &str) -> Result<Vec<u8>> {
        let recipient = Self::parse_public_key(public_key)?;

        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let ephemeral_point = ephemeral.public_key().to_encoded_point(false);
        let shared = ephemeral.diffie_hellman(&recipient);
        let key = Self::derive_key(shared.raw_secret_bytes().as_slice(), ephemeral_point.as_bytes())?;

        let cipher = Aes256Gcm::new_from_slice(&*key)
            .map_err(|e| anyhow::anyhow!("Invalid AES key: {e}"))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {e}"))?;

        let mut out = Vec::with_capacity(POINT_SIZE + NONCE_SIZE + sealed.len());
        out.extend_from_slice(ephemeral_point.as_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>> {
        anyhow::ensure!(
            ciphertext.len() > POINT_SIZE + NONCE_SIZE,
            "Ciphertext too short ({} bytes)",
            ciphertext.len()
        );
        let (point_bytes, rest) = ciphertext.split_at(POINT_SIZE);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_SIZE);

        let secret = Self::parse_private_key(private_key)?;
        let ephemeral =
            PublicKey::from_sec1_bytes(point_bytes).context("Invalid ephemeral public key")?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
        let key = Self::derive_key(shared.raw_secret_bytes().as_slice(), point_bytes)?;

        let cipher = Aes256Gcm::new_from_slice(&*key)
            .map_err(|e| anyhow::anyhow!("Invalid AES key: {e}"))?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {e}"))
    }
}
