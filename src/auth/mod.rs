//! Credential verification for the final handshake step.
//!
//! The core asks one [`AuthChecker`] for a yes/no plus username. The
//! shipped checker, [`AuthCheck`], fans credentials out to every
//! configured [`AuthModule`] concurrently and combines their verdicts
//! according to an [`AuthPolicy`].
//!
//! ```text
//! SharedSockets ──check──► AuthCheck ──verify──► RopVerify
//!                                     └─verify──► (more modules)
//! ```
//!
//! Rust guideline compliant 2026-02

pub mod ropverify;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::{AuthConfig, AuthModuleKind};
use crate::error::NotifyError;

pub use ropverify::RopVerify;

/// Decrypted credentials from the client's final handshake message.
///
/// Either `pass` or `hash` is expected, not both.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Claimed username.
    pub user: String,
    /// Pass phrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Pre-hashed secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("hash", &self.hash.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One independent verification backend.
#[async_trait]
pub trait AuthModule: Send + Sync {
    /// Verify `credentials`.
    ///
    /// `Ok(Some(user))` accepts, `Ok(None)` rejects, `Err` means the
    /// module could not reach a verdict.
    async fn verify(&self, credentials: &Credentials) -> Result<Option<String>>;
}

/// The single verdict the handshake core consumes.
#[async_trait]
pub trait AuthChecker: Send + Sync {
    /// Resolve `credentials` to a username or an [`NotifyError::AuthFailure`].
    async fn check(&self, credentials: &Credentials) -> Result<String, NotifyError>;
}

/// How module verdicts combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthPolicy {
    /// Every module must accept; any error or rejection fails.
    #[default]
    All,
    /// The first accepting module (in configuration order) wins.
    Any,
}

/// Aggregates named [`AuthModule`]s under an [`AuthPolicy`].
pub struct AuthCheck {
    modules: Vec<(String, Box<dyn AuthModule>)>,
    policy: AuthPolicy,
}

impl std::fmt::Debug for AuthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCheck")
            .field(
                "modules",
                &self.modules.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("policy", &self.policy)
            .finish()
    }
}

impl AuthCheck {
    /// Build an aggregator.
    ///
    /// # Errors
    ///
    /// Fails when `modules` is empty: a checker that accepts nobody (or
    /// everybody) is never what the operator meant.
    pub fn new(modules: Vec<(String, Box<dyn AuthModule>)>, policy: AuthPolicy) -> Result<Self> {
        anyhow::ensure!(
            !modules.is_empty(),
            "No successfully initialized authentication modules"
        );
        Ok(Self { modules, policy })
    }

    /// Construct every configured module, skipping ones that fail to initialise.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut modules: Vec<(String, Box<dyn AuthModule>)> = Vec::new();
        for module in &config.modules {
            let built = match module.kind {
                AuthModuleKind::RopVerify => RopVerify::new(&module.url, &module.method)
                    .map(|m| Box::new(m) as Box<dyn AuthModule>),
            };
            match built {
                Ok(m) => {
                    log::info!("Auth module '{}' initialised", module.name);
                    modules.push((module.name.clone(), m));
                }
                Err(e) => {
                    log::warn!("Unable to initialise auth module '{}': {e:#}", module.name);
                }
            }
        }
        Self::new(modules, config.policy)
    }

    /// Names of the active modules, in configuration order.
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|(name, _)| name.as_str())
    }
}

#[async_trait]
impl AuthChecker for AuthCheck {
    async fn check(&self, credentials: &Credentials) -> Result<String, NotifyError> {
        let verdicts = join_all(
            self.modules
                .iter()
                .map(|(_, module)| module.verify(credentials)),
        )
        .await;

        match self.policy {
            AuthPolicy::All => {
                for ((name, _), verdict) in self.modules.iter().zip(verdicts) {
                    match verdict {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            return Err(NotifyError::AuthFailure(format!(
                                "Failed authentication with module {name}"
                            )))
                        }
                        Err(e) => {
                            return Err(NotifyError::AuthFailure(format!(
                                "Auth module {name} failed: {e:#}"
                            )))
                        }
                    }
                }
                Ok(credentials.user.clone())
            }
            AuthPolicy::Any => {
                for ((name, _), verdict) in self.modules.iter().zip(verdicts) {
                    match verdict {
                        Ok(Some(user)) => return Ok(user),
                        Ok(None) => log::debug!("Auth module {name} rejected {}", credentials.user),
                        Err(e) => log::warn!("Auth module {name} failed: {e:#}"),
                    }
                }
                Err(NotifyError::AuthFailure(format!(
                    "No auth module accepted {}",
                    credentials.user
                )))
            }
        }
    }
}
