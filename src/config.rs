//! Configuration loading.
//!
//! Precedence, lowest first: built-in defaults, the JSON config file,
//! `RK8_NOTIFYD_*` environment variables, command-line flags (applied by
//! the binary). Missing file fields keep their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::ropverify::DEFAULT_URL as ROPVERIFY_DEFAULT_URL;
use crate::auth::AuthPolicy;
use crate::sockets::Timeouts;

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Daemon configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Interface the push-socket channel binds to.
    pub host: String,
    /// Push-socket channel port.
    pub port: u16,
    /// Interface the notify endpoint binds to. Keep it on a trusted network.
    pub notify_host: String,
    /// Notify endpoint port.
    pub notify_port: u16,
    /// Handshake, acknowledgement and identify windows.
    pub timeouts: TimeoutConfig,
    /// PKI record persistence.
    pub pki: PkiConfig,
    /// Credential verification.
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            notify_host: "127.0.0.1".to_string(),
            notify_port: 8081,
            timeouts: TimeoutConfig::default(),
            pki: PkiConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Timeouts in seconds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Key issue until notification key.
    pub key_issue_secs: u64,
    /// Credentials step and auth check, each.
    pub step_secs: u64,
    /// Per-recipient acknowledgement window.
    pub ack_secs: u64,
    /// Connect until the client identifies itself.
    pub identify_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            key_issue_secs: 120,
            step_secs: 15,
            ack_secs: 10,
            identify_secs: 30,
        }
    }
}

/// Storage backend for PKI records.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PkiBackend {
    /// One JSON file per identity.
    #[default]
    FsJson,
    /// Process memory only.
    Memory,
}

/// PKI persistence settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PkiConfig {
    /// Which store to use.
    pub backend: PkiBackend,
    /// Record directory for `fs-json`.
    pub dir: PathBuf,
    /// Invalidate cached records when files change on disk.
    pub watch: bool,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            backend: PkiBackend::FsJson,
            dir: PathBuf::from("./pki_map"),
            watch: true,
        }
    }
}

/// Known auth module implementations.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthModuleKind {
    /// Remote pass phrase check.
    #[default]
    RopVerify,
}

/// One configured auth module.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AuthModuleConfig {
    /// Name used in logs and failure messages.
    pub name: String,
    /// Implementation.
    pub kind: AuthModuleKind,
    /// Verify endpoint.
    pub url: String,
    /// `post` or `get`; anything else disables the module.
    pub method: String,
}

impl Default for AuthModuleConfig {
    fn default() -> Self {
        Self {
            name: "ropverify".to_string(),
            kind: AuthModuleKind::RopVerify,
            url: ROPVERIFY_DEFAULT_URL.to_string(),
            method: "post".to_string(),
        }
    }
}

/// Auth aggregation settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// How module verdicts combine.
    pub policy: AuthPolicy,
    /// Modules in evaluation order.
    pub modules: Vec<AuthModuleConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            policy: AuthPolicy::All,
            modules: vec![AuthModuleConfig::default()],
        }
    }
}

impl Config {
    /// Directory searched for [`CONFIG_FILE`].
    ///
    /// `RK8_NOTIFYD_CONFIG_DIR` overrides the platform config directory
    /// (e.g. `~/.config/rk8-notifyd`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("RK8_NOTIFYD_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("rk8-notifyd"))
    }

    /// Load configuration and apply environment overrides.
    ///
    /// An explicit `path` must exist. Without one, a missing default
    /// config file just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Self::config_dir()?.join(CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    log::debug!("No config file at {:?}, using defaults", default_path);
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("RK8_NOTIFYD_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(port) = var("RK8_NOTIFYD_NOTIFY_PORT").and_then(|v| v.parse().ok()) {
            self.notify_port = port;
        }
        if let Some(dir) = var("RK8_NOTIFYD_PKI_DIR") {
            self.pki.dir = PathBuf::from(dir);
        }
        if let Some(url) = var("RK8_NOTIFYD_ROPVERIFY_URL") {
            for module in &mut self.auth.modules {
                if module.kind == AuthModuleKind::RopVerify {
                    module.url.clone_from(&url);
                }
            }
        }
    }

    /// Core timeouts.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            key_issue: Duration::from_secs(self.timeouts.key_issue_secs),
            step: Duration::from_secs(self.timeouts.step_secs),
            ack: Duration::from_secs(self.timeouts.ack_secs),
        }
    }

    /// How long a connection may take to identify itself.
    pub fn identify_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.identify_secs)
    }

    /// `host:port` for the push-socket channel.
    pub fn channel_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:port` for the notify endpoint.
    pub fn notify_addr(&self) -> String {
        format!("{}:{}", self.notify_host, self.notify_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.notify_port, 8081);
        assert_eq!(config.notify_host, "127.0.0.1");
        assert_eq!(config.pki.backend, PkiBackend::FsJson);
        assert_eq!(config.auth.modules.len(), 1);
        assert_eq!(config.timeouts(), Timeouts::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"notifyPort": 9001, "pki": {"backend": "memory"}, "auth": {"policy": "any"}}"#,
        )
        .unwrap();
        assert_eq!(config.notify_port, 9001);
        assert_eq!(config.port, 8080);
        assert_eq!(config.pki.backend, PkiBackend::Memory);
        assert_eq!(config.pki.dir, PathBuf::from("./pki_map"));
        assert_eq!(config.auth.policy, AuthPolicy::Any);
        assert_eq!(config.auth.modules[0].method, "post");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{"port": 9000, "timeouts": {"stepSecs": 5}, "auth": {"modules": [{"name": "ldap", "method": "get"}]}}"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.timeouts().step, Duration::from_secs(5));
        assert_eq!(config.timeouts().key_issue, Duration::from_secs(120));
        assert_eq!(config.auth.modules[0].name, "ldap");
        assert_eq!(config.auth.modules[0].url, ROPVERIFY_DEFAULT_URL);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some(Path::new("/nonexistent/rk8/config.json"))).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RK8_NOTIFYD_PORT", "7000"),
            ("RK8_NOTIFYD_NOTIFY_PORT", "not-a-port"),
            ("RK8_NOTIFYD_PKI_DIR", "/var/lib/rk8"),
            ("RK8_NOTIFYD_ROPVERIFY_URL", "http://auth.local/verify"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.port, 7000);
        assert_eq!(config.notify_port, 8081);
        assert_eq!(config.pki.dir, PathBuf::from("/var/lib/rk8"));
        assert_eq!(config.auth.modules[0].url, "http://auth.local/verify");
    }

    #[test]
    fn test_addresses() {
        let config = Config::default();
        assert_eq!(config.channel_addr(), "0.0.0.0:8080");
        assert_eq!(config.notify_addr(), "127.0.0.1:8081");
        assert_eq!(config.identify_timeout(), Duration::from_secs(30));
    }
}
