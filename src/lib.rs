//! rk8-notifyd - authenticated push notification daemon.
//!
//! Clients connect over an untrusted transport, run a three-step
//! challenge/response handshake against a per-identity keypair, and end up
//! as registered sockets that only they can read. Trusted processes then
//! ask the daemon to notify a user, and the message is fanned out,
//! encrypted per device, to every socket registered for that user.
//!
//! # Architecture
//!
//! ```text
//! client ──ws──▶ channel::websocket ──▶ sockets::SharedSockets ◀── trigger ◀──http── trusted caller
//!                                          │
//!                 ┌────────────────────────┼──────────────────────┐
//!                 ▼                        ▼                      ▼
//!          crypto::CryptoProvider   pki::PkiStore         auth::AuthChecker
//! ```
//!
//! # Modules
//!
//! - [`sockets`] - pending sessions, handshake, session registry, dispatcher
//! - [`channel`] - transport seam and the WebSocket push-socket channel
//! - [`crypto`] - keypair/encrypt/decrypt capability (ECIES over P-256)
//! - [`pki`] - persistent PKI records (memory and JSON-file stores)
//! - [`auth`] - credential verification modules and their aggregation
//! - [`trigger`] - "notify user X" HTTP endpoint for trusted processes
//! - [`ws`] - WebSocket accept/connect halves
//! - [`config`] - configuration loading

pub mod auth;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pki;
pub mod sockets;
pub mod trigger;
pub mod ws;

pub use channel::Identity;
pub use config::Config;
pub use error::NotifyError;
pub use sockets::{NotifyRequest, SharedSockets, Timeouts};
