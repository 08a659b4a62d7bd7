//! "Notify user X" HTTP endpoint for trusted senders.
//!
//! Any method on `/notify/{username}` (an optional trailing `/{segment}`
//! is accepted and ignored). The message is taken from the first place
//! that has one:
//!
//! 1. `?msg=...` query parameter
//! 2. `notification-message` request header
//! 3. JSON body `{"msg": "...", "url": "..."?, "ack": true?}`
//!
//! `url` and `ack` come from the query string or the body.
//!
//! | Outcome                         | Status | Body                   |
//! |---------------------------------|--------|------------------------|
//! | sent                            | 200    | `Notification Sent!`   |
//! | sent, `ack=true`                | 200    | [`AckSummary`] JSON    |
//! | no message                      | 400    | reason                 |
//! | user has no registered sockets  | 400    | reason                 |
//! | anything else                   | 404    | `Not Found`            |
//!
//! With `ack=true` the response is held until every recipient's
//! acknowledgement has settled (or the ack window plus a grace period
//! has passed).
//!
//! This endpoint has no authentication. Bind it to a trusted interface.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::any;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::sockets::{AckEvent, NotifyRequest, SharedSockets};

/// Header carrying the message when no query parameter is given.
pub const MESSAGE_HEADER: &str = "notification-message";

/// Body of a successful send without acknowledgements.
pub const SENT: &str = "Notification Sent!";

/// Slack on top of the ack window before giving up on stragglers.
const ACK_GRACE: Duration = Duration::from_secs(5);

/// Notify parameters from any of the three request locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotifyCommand {
    /// Message text.
    #[serde(default)]
    pub msg: Option<String>,
    /// Optional link.
    #[serde(default)]
    pub url: Option<String>,
    /// Hold the response for per-recipient acknowledgements.
    #[serde(default)]
    pub ack: bool,
}

/// Query string form; `ack` accepts `true` or `1`.
#[derive(Debug, Default, Deserialize)]
pub struct NotifyQuery {
    msg: Option<String>,
    url: Option<String>,
    ack: Option<String>,
}

impl NotifyCommand {
    /// Resolve the command from query, then header, then body.
    ///
    /// The body is only parsed when neither query nor header carries the
    /// message; an unreadable body counts as empty.
    pub fn resolve(query: NotifyQuery, headers: &HeaderMap, body: &[u8]) -> Self {
        let parsed = || -> NotifyCommand {
            if body.is_empty() {
                return NotifyCommand::default();
            }
            serde_json::from_slice(body).unwrap_or_else(|e| {
                log::debug!("Unparseable notify body: {e}");
                NotifyCommand::default()
            })
        };

        let header = headers
            .get(MESSAGE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let query_ack = query.ack.as_deref().map(|v| v == "true" || v == "1");

        let (msg, body) = match query.msg.or(header) {
            Some(msg) => (Some(msg), None),
            None => {
                let body = parsed();
                (body.msg.clone(), Some(body))
            }
        };
        let body = body.unwrap_or_default();

        Self {
            msg: msg.filter(|m| !m.is_empty()),
            url: query.url.or(body.url),
            ack: query_ack.unwrap_or(body.ack),
        }
    }
}

/// Response body for `ack=true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSummary {
    /// Always [`SENT`].
    pub message: String,
    /// Sockets attempted.
    pub attempted: usize,
    /// Attempts that failed.
    pub failed: usize,
    /// One entry per settled recipient, in settlement order.
    pub acks: Vec<AckReport>,
}

/// One recipient's settled acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckReport {
    /// Recipient identity.
    pub identity: String,
    /// Correlation id placed in the envelope.
    pub correlation_id: String,
    /// Decrypted acknowledgement, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Why no acknowledgement was received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<AckEvent> for AckReport {
    fn from(event: AckEvent) -> Self {
        let (payload, error) = match event.result {
            Ok(bytes) => (Some(BASE64.encode(bytes)), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            identity: event.identity.to_string(),
            correlation_id: event.correlation_id,
            payload,
            error,
        }
    }
}

/// Listener for notify requests.
#[derive(Debug, Clone)]
pub struct TriggerServer {
    sockets: SharedSockets,
}

impl TriggerServer {
    /// Endpoint dispatching through `sockets`.
    pub fn new(sockets: SharedSockets) -> Self {
        Self { sockets }
    }

    /// Routes served by [`TriggerServer::serve`].
    pub fn router(self) -> Router {
        Router::new()
            .route("/notify/:username", any(notify))
            .route("/notify/:username/:segment", any(notify_with_segment))
            .fallback(|| async { (StatusCode::NOT_FOUND, "Not Found") })
            .with_state(self.sockets)
    }

    /// Serve notify requests on `listener` until the task is dropped.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no address")?;
        log::info!("Notify endpoint listening on http://{addr}/notify/{{username}}");
        axum::serve(listener, self.router())
            .await
            .context("Notify endpoint failed")
    }
}

async fn notify_with_segment(
    State(sockets): State<SharedSockets>,
    Path((username, _segment)): Path<(String, String)>,
    query: Query<NotifyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    notify(State(sockets), Path(username), query, headers, body).await
}

async fn notify(
    State(sockets): State<SharedSockets>,
    Path(username): Path<String>,
    Query(query): Query<NotifyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let command = NotifyCommand::resolve(query, &headers, &body);
    log::info!("[notify] request for {username}");

    let Some(msg) = command.msg else {
        return (StatusCode::BAD_REQUEST, "Missing notification message").into_response();
    };
    let mut request = NotifyRequest::new(username, msg);
    if let Some(url) = command.url {
        request = request.with_url(url);
    }

    let mut acks = None;
    if command.ack {
        let (tx, rx) = mpsc::unbounded_channel::<AckEvent>();
        request = request.with_ack(move |event| {
            if tx.send(event).is_err() {
                log::debug!("[notify] ack arrived after the response was sent");
            }
        });
        acks = Some(rx);
    }

    let report = match sockets.send(request).await {
        Ok(report) => report,
        Err(e) => {
            log::warn!("[notify] {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let Some(mut rx) = acks else {
        return (StatusCode::OK, SENT).into_response();
    };

    let mut settled = Vec::with_capacity(report.attempted);
    let deadline = sockets.timeouts().ack + ACK_GRACE;
    let collect = async {
        while settled.len() < report.attempted {
            let Some(event) = rx.recv().await else { break };
            settled.push(AckReport::from(event));
        }
    };
    if tokio::time::timeout(deadline, collect).await.is_err() {
        log::warn!("[notify] gave up waiting for acknowledgements");
    }

    Json(AckSummary {
        message: SENT.to_string(),
        attempted: report.attempted,
        failed: report.failed,
        acks: settled,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Identity;
    use crate::error::NotifyError;
    use axum::http::HeaderValue;

    fn query(msg: Option<&str>, ack: Option<&str>) -> NotifyQuery {
        NotifyQuery {
            msg: msg.map(str::to_string),
            url: None,
            ack: ack.map(str::to_string),
        }
    }

    #[test]
    fn test_message_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(MESSAGE_HEADER, HeaderValue::from_static("from header"));
        let body = br#"{"msg":"from body","url":"https://x","ack":true}"#;

        let command = NotifyCommand::resolve(query(Some("from query"), Some("1")), &headers, body);
        assert_eq!(command.msg.as_deref(), Some("from query"));
        assert!(command.ack);

        let command = NotifyCommand::resolve(query(None, None), &headers, body);
        assert_eq!(command.msg.as_deref(), Some("from header"));
        assert!(!command.ack);

        let command = NotifyCommand::resolve(query(None, None), &HeaderMap::new(), body);
        assert_eq!(command.msg.as_deref(), Some("from body"));
        assert_eq!(command.url.as_deref(), Some("https://x"));
        assert!(command.ack);
    }

    #[test]
    fn test_missing_or_unreadable_body() {
        let empty = NotifyCommand::resolve(query(None, None), &HeaderMap::new(), b"");
        assert_eq!(empty, NotifyCommand::default());

        let garbage = NotifyCommand::resolve(query(None, Some("true")), &HeaderMap::new(), b"{ nope");
        assert_eq!(garbage.msg, None);
        assert!(garbage.ack);

        let blank = NotifyCommand::resolve(query(Some(""), None), &HeaderMap::new(), b"");
        assert_eq!(blank.msg, None);
    }

    #[test]
    fn test_ack_report_from_event() {
        let report = AckReport::from(AckEvent {
            identity: Identity::from("conn-1"),
            correlation_id: "c-1".to_string(),
            result: Err(NotifyError::AckTimeout("c-1".to_string())),
        });
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["identity"], "conn-1");
        assert!(json.get("payload").is_none());
        assert!(json["error"].as_str().unwrap().contains("timed out"));
    }
}
