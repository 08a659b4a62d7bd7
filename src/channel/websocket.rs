//! Push-socket channel over WebSocket.
//!
//! One task per connection drives the handshake frames into
//! [`SharedSockets`]; a writer task drains an unbounded queue of
//! [`ServerFrame`]s so that notification sends never wait on the socket.
//!
//! # Connection Flow
//!
//! ```text
//! server                              client
//!   │── identify ──────────────────────►│
//!   │◄───────────────────── identity{id}│   (within identify timeout)
//!   │── authenticate{public_key} ──────►│
//!   │◄──────────── notification_key{ct} │
//!   │── notification_key_proof{ct} ────►│
//!   │◄───────────────── credentials{ct} │
//!   │── registered{id,user} ───────────►│
//!   │── notification{ct, ack_id?} ─────►│   (any time after)
//!   │◄───────────── ack{ack_id, ct}     │
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ClientFrame, Identity, NotificationSocket, ServerFrame, SocketError};
use crate::sockets::{AckHandle, SharedSockets};
use crate::ws::{self, WsReader, WsWriter};

/// Message sent to the client when its key cannot be issued.
const INTERNAL_ERROR: &str = "Internal Error";

/// How long a closing connection may spend flushing queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ack handles remembered per connection; the oldest is forgotten first.
const MAX_TRACKED_ACKS: usize = 1024;

/// Send capability of one WebSocket connection.
///
/// Fails with [`SocketError::Closed`] once the connection's writer is gone.
/// Only acknowledgements for ids issued on this connection are routed.
#[derive(Debug, Clone)]
pub struct WsNotificationSocket {
    tx: mpsc::UnboundedSender<ServerFrame>,
    issued: Arc<Mutex<VecDeque<AckHandle>>>,
}

impl WsNotificationSocket {
    fn new(tx: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            tx,
            issued: Arc::default(),
        }
    }

    fn issued(&self) -> std::sync::MutexGuard<'_, VecDeque<AckHandle>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route a client ack. `None` if `ack_id` was never issued here.
    async fn acknowledge(&self, ack_id: &str, raw: &[u8]) -> Option<bool> {
        let handle = self
            .issued()
            .iter()
            .find(|handle| handle.correlation_id() == ack_id)
            .cloned()?;
        let settled = handle.acknowledge(raw).await;
        if settled {
            self.issued().retain(|h| h.correlation_id() != ack_id);
        }
        Some(settled)
    }
}

#[async_trait]
impl NotificationSocket for WsNotificationSocket {
    async fn send(&self, ciphertext: Vec<u8>, ack: Option<AckHandle>) -> Result<(), SocketError> {
        let frame = ServerFrame::Notification {
            payload: BASE64.encode(ciphertext),
            ack_id: ack.as_ref().map(|handle| handle.correlation_id().to_string()),
        };
        self.tx.send(frame).map_err(|_| SocketError::Closed)?;
        if let Some(handle) = ack {
            let mut issued = self.issued();
            if issued.len() == MAX_TRACKED_ACKS {
                issued.pop_front();
            }
            issued.push_back(handle);
        }
        Ok(())
    }
}

/// WebSocket listener feeding connections into the handshake core.
#[derive(Debug, Clone)]
pub struct WebSocketChannel {
    sockets: SharedSockets,
    identify_timeout: Duration,
}

impl WebSocketChannel {
    /// Channel that waits up to `identify_timeout` for each client's identity.
    pub fn new(sockets: SharedSockets, identify_timeout: Duration) -> Self {
        Self {
            sockets,
            identify_timeout,
        }
    }

    /// Accept connections on `listener` until the task is dropped.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no address")?;
        log::info!("Push-socket channel listening on ws://{addr}");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            let channel = self.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.handle(stream, peer).await {
                    log::debug!("[{peer}] connection ended: {e:#}");
                }
            });
        }
    }

    async fn handle(&self, stream: tokio::net::TcpStream, peer: SocketAddr) -> Result<()> {
        let (writer, mut reader) = ws::accept(stream).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let done = CancellationToken::new();
        let writer_task = tokio::spawn(write_frames(writer, rx, done.clone()));
        let abort = writer_task.abort_handle();

        let result = self.drive(&mut reader, &tx, peer).await;

        // Registered sockets keep senders alive, so the queue never closes
        // on its own. Once the writer exits, their sends fail as Closed.
        done.cancel();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task)
            .await
            .is_err()
        {
            log::debug!("[{peer}] writer did not drain in time");
            abort.abort();
        }
        result
    }

    async fn drive(
        &self,
        reader: &mut WsReader,
        tx: &mpsc::UnboundedSender<ServerFrame>,
        peer: SocketAddr,
    ) -> Result<()> {
        queue(tx, ServerFrame::Identify);

        let identity = match tokio::time::timeout(self.identify_timeout, next_frame(reader, tx)).await {
            Ok(Some(ClientFrame::Identity { id })) => Identity::from(id),
            Ok(Some(other)) => {
                send_error(tx, "Expected identity");
                anyhow::bail!("first frame was not an identity: {other:?}");
            }
            Ok(None) => return Ok(()),
            Err(_) => {
                send_error(tx, "Identify timed out");
                anyhow::bail!("no identity within {:?}", self.identify_timeout);
            }
        };
        log::info!("[{peer}] identified as {}", identity.short());

        match self.sockets.get_public_key_for_client(&identity).await {
            Ok(public_key) => {
                queue(tx, ServerFrame::Authenticate { public_key });
            }
            Err(e) => {
                log::error!("[{peer}] key issue for {} failed: {e}", identity.short());
                send_error(tx, INTERNAL_ERROR);
                return Ok(());
            }
        }

        let socket = Arc::new(WsNotificationSocket::new(tx.clone()));

        while let Some(frame) = next_frame(reader, tx).await {
            match frame {
                ClientFrame::Identity { .. } => send_error(tx, "Already identified"),
                ClientFrame::NotificationKey { payload } => {
                    let Some(bytes) = decode(tx, &payload) else {
                        continue;
                    };
                    match self.sockets.receive_notification_key(&identity, &bytes).await {
                        Ok(proof) => {
                            queue(
                                tx,
                                ServerFrame::NotificationKeyProof {
                                    payload: BASE64.encode(proof),
                                },
                            );
                        }
                        Err(e) => send_error(tx, &e.to_string()),
                    }
                }
                ClientFrame::Credentials { payload } => {
                    let Some(bytes) = decode(tx, &payload) else {
                        continue;
                    };
                    match self
                        .sockets
                        .complete_registration(&identity, &bytes, Arc::clone(&socket) as _)
                        .await
                    {
                        Ok(registration) => {
                            log::info!(
                                "[{peer}] {} registered for {}",
                                identity.short(),
                                registration.user
                            );
                            queue(
                                tx,
                                ServerFrame::Registered {
                                    id: registration.id.to_string(),
                                    user: registration.user,
                                },
                            );
                        }
                        Err(e) => send_error(tx, &e.to_string()),
                    }
                }
                ClientFrame::Ack { ack_id, payload } => {
                    let Some(bytes) = decode(tx, &payload) else {
                        continue;
                    };
                    match socket.acknowledge(&ack_id, &bytes).await {
                        Some(true) => {}
                        Some(false) => log::debug!("[{peer}] ack {ack_id} not settled"),
                        None => {
                            log::warn!("[{peer}] ack {ack_id} was not issued on this connection");
                            send_error(tx, "Unknown ack id");
                        }
                    }
                }
            }
        }

        log::info!("[{peer}] {} disconnected", identity.short());
        Ok(())
    }
}

/// Write queued frames until `done`, then flush what is left and close.
async fn write_frames(
    mut writer: WsWriter,
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    done: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            () = done.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.send_json(&frame).await {
            log::debug!("Frame write failed: {e:#}");
            return;
        }
    }

    while let Ok(frame) = rx.try_recv() {
        if writer.send_json(&frame).await.is_err() {
            return;
        }
    }
    if let Err(e) = writer.close().await {
        log::debug!("Close failed: {e:#}");
    }
}

/// Next well-formed client frame. Malformed frames are answered with an
/// error frame and skipped.
async fn next_frame(
    reader: &mut WsReader,
    tx: &mpsc::UnboundedSender<ServerFrame>,
) -> Option<ClientFrame> {
    // tungstenite answers pings itself.
    loop {
        let text = loop {
            match reader.recv().await? {
                Ok(ws::WsMessage::Text(text)) => break text,
                Ok(ws::WsMessage::Close { .. }) | Err(_) => return None,
                Ok(_) => {}
            }
        };
        match serde_json::from_str(&text) {
            Ok(frame) => return Some(frame),
            Err(e) => {
                log::debug!("Unrecognized frame: {e}");
                send_error(tx, "Unrecognized frame");
            }
        }
    }
}

fn decode(tx: &mpsc::UnboundedSender<ServerFrame>, payload: &str) -> Option<Vec<u8>> {
    match BASE64.decode(payload) {
        Ok(bytes) => Some(bytes),
        Err(_) => {
            send_error(tx, "Malformed payload");
            None
        }
    }
}

fn queue(tx: &mpsc::UnboundedSender<ServerFrame>, frame: ServerFrame) {
    if tx.send(frame).is_err() {
        log::debug!("Connection writer already gone");
    }
}

fn send_error(tx: &mpsc::UnboundedSender<ServerFrame>, message: &str) {
    queue(
        tx,
        ServerFrame::Error {
            message: message.to_string(),
        },
    );
}
