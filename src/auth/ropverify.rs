//! Username/pass phrase check against a remote verify endpoint.
//!
//! Sends `user`, `password` and `sflag=ldapBindTest` as a form (POST) or
//! query string (GET). The user is accepted when the endpoint answers
//! `200` with a body mentioning "successful".

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::{AuthModule, Credentials};

/// Default verify endpoint.
pub const DEFAULT_URL: &str = "http://127.0.0.1/wsapi/ropverify.php";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP verb used for the verify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Form body.
    Post,
    /// Query string.
    Get,
}

impl std::str::FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "post" => Ok(Self::Post),
            "get" => Ok(Self::Get),
            other => anyhow::bail!("Unsupported ropverify method '{other}'"),
        }
    }
}

#[derive(Serialize)]
struct VerifyForm<'a> {
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    sflag: &'static str,
}

/// Remote pass phrase verifier.
#[derive(Debug, Clone)]
pub struct RopVerify {
    client: reqwest::Client,
    url: String,
    method: Method,
}

impl RopVerify {
    /// Build a verifier for `url` using `method` (`"post"` or `"get"`).
    ///
    /// # Errors
    ///
    /// Fails on an unsupported method or if the HTTP client cannot be built.
    pub fn new(url: &str, method: &str) -> Result<Self> {
        let method = method.parse()?;
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            method,
        })
    }
}

#[async_trait]
impl AuthModule for RopVerify {
    async fn verify(&self, credentials: &Credentials) -> Result<Option<String>> {
        let form = VerifyForm {
            user: &credentials.user,
            password: credentials.pass.as_deref(),
            sflag: "ldapBindTest",
        };

        let request = match self.method {
            Method::Post => self.client.post(&self.url).form(&form),
            Method::Get => self.client.get(&self.url).query(&form),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                log::error!("ropverify request to {} failed: {e}", self.url);
                return Ok(None);
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            log::debug!("ropverify returned {} for {}", response.status(), credentials.user);
            return Ok(None);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                log::error!("ropverify response unreadable: {e}");
                return Ok(None);
            }
        };

        if body.to_lowercase().contains("successful") {
            Ok(Some(credentials.user.clone()))
        } else {
            Ok(None)
        }
    }
}
