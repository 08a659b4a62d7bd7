//! Fan-out and acknowledgement behaviour of `SharedSockets::send`.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use rk8_notifyd::{NotifyError, NotifyRequest, Timeouts};
use support::{ack_recorder, open, seal_bytes, Harness, RecordingSocket};

async fn register(h: &Harness, id: &str, user: &str, key: &str) -> (Arc<RecordingSocket>, String) {
    let socket = Arc::new(RecordingSocket::default());
    let (public_key, registration) = h.handshake(id, user, key, Arc::clone(&socket)).await;
    registration.unwrap();
    (socket, public_key)
}

#[tokio::test(start_paused = true)]
async fn test_send_to_unknown_user_fails() {
    let h = Harness::new();
    let result = h.sockets.send(NotifyRequest::new("bob", "hello")).await;
    assert_eq!(result, Err(NotifyError::NoRegisteredSocket("bob".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_seals_per_device_and_counts_failures() {
    let h = Harness::new();
    let (phone, _) = register(&h, "conn-1", "alice", "N1").await;
    let (laptop, _) = register(&h, "conn-2", "alice", "N2").await;
    let (tablet, _) = register(&h, "conn-3", "alice", "N3").await;
    laptop.fail.store(true, Ordering::SeqCst);

    let report = h
        .sockets
        .send(NotifyRequest::new("alice", "Build finished").with_url("https://ci.local/42"))
        .await
        .unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.delivered(), 2);

    for (socket, key) in [(&phone, "N1"), (&tablet, "N3")] {
        let sent = socket.sent();
        assert_eq!(sent.len(), 1);
        let (sealed_to, envelope) = open(&sent[0].0);
        assert_eq!(sealed_to, key);
        assert_eq!(envelope, json!({"msg": "Build finished", "url": "https://ci.local/42"}));
        assert!(sent[0].1.is_none());
    }
    assert!(laptop.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_other_users_are_untouched() {
    let h = Harness::new();
    let (alice, _) = register(&h, "conn-1", "alice", "N1").await;
    let (bob, _) = register(&h, "conn-2", "bob", "N2").await;

    h.sockets.send(NotifyRequest::new("bob", "hi bob")).await.unwrap();

    assert!(alice.sent().is_empty());
    assert_eq!(bob.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ack_is_delivered_once() {
    let h = Harness::new();
    let (socket, public_key) = register(&h, "conn-1", "alice", "N1").await;
    let (on_ack, events) = ack_recorder();

    h.sockets
        .send(NotifyRequest::new("alice", "ping").with_ack(on_ack))
        .await
        .unwrap();
    assert_eq!(h.sockets.pending_acks().await, 1);

    let sent = socket.sent();
    let handle = sent[0].1.clone().unwrap();
    let (_, envelope) = open(&sent[0].0);
    assert_eq!(envelope["id"], handle.correlation_id());

    let raw = seal_bytes(&public_key, b"seen");
    assert!(handle.acknowledge(&raw).await);
    assert!(!h.sockets.acknowledge(handle.correlation_id(), &raw).await);

    tokio::time::sleep(Timeouts::default().ack * 2).await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].identity.as_ref(), "conn-1");
    assert_eq!(events[0].result, Ok(b"seen".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_times_out() {
    let h = Harness::new();
    let (socket, public_key) = register(&h, "conn-1", "alice", "N1").await;
    let (on_ack, events) = ack_recorder();

    h.sockets
        .send(NotifyRequest::new("alice", "ping").with_ack(on_ack))
        .await
        .unwrap();
    tokio::time::sleep(Timeouts::default().ack + Duration::from_secs(1)).await;

    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].result, Err(NotifyError::AckTimeout(_))));
    }
    assert_eq!(h.sockets.pending_acks().await, 0);

    // A late ack finds nothing to settle.
    let handle = socket.sent()[0].1.clone().unwrap();
    assert!(!handle.acknowledge(&seal_bytes(&public_key, b"late")).await);
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_settles_ack_immediately() {
    let h = Harness::new();
    let (socket, _) = register(&h, "conn-1", "alice", "N1").await;
    socket.fail.store(true, Ordering::SeqCst);
    let (on_ack, events) = ack_recorder();

    let report = h
        .sockets
        .send(NotifyRequest::new("alice", "ping").with_ack(on_ack))
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0].result, Err(NotifyError::SendFailure(_))));
}

#[tokio::test(start_paused = true)]
async fn test_unusable_notification_key_counts_as_failure() {
    let h = Harness::new();
    let (socket, _) = register(&h, "conn-1", "alice", "N1").await;
    h.crypto.refuse_encrypt.store(true, Ordering::SeqCst);
    let (on_ack, events) = ack_recorder();

    let report = h
        .sockets
        .send(NotifyRequest::new("alice", "ping").with_ack(on_ack))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert!(socket.sent().is_empty());
    assert!(matches!(
        &events.lock().unwrap()[0].result,
        Err(NotifyError::EncryptionFailure(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_forged_ack_does_not_preempt_genuine_ack() {
    let h = Harness::new();
    let (socket, public_key) = register(&h, "conn-1", "alice", "N1").await;
    let (on_ack, events) = ack_recorder();

    h.sockets
        .send(NotifyRequest::new("alice", "ping").with_ack(on_ack))
        .await
        .unwrap();
    let handle = socket.sent()[0].1.clone().unwrap();
    assert!(!handle.acknowledge(b"garbage").await);
    assert!(!h.sockets
        .acknowledge(handle.correlation_id(), &seal_bytes("pub-999", b"forged"))
        .await);
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(h.sockets.pending_acks().await, 1);

    assert!(handle.acknowledge(&seal_bytes(&public_key, b"seen")).await);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].result, Ok(b"seen".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_only_forged_acks_still_time_out() {
    let h = Harness::new();
    let (socket, _) = register(&h, "conn-1", "alice", "N1").await;
    let (on_ack, events) = ack_recorder();

    h.sockets
        .send(NotifyRequest::new("alice", "ping").with_ack(on_ack))
        .await
        .unwrap();
    let handle = socket.sent()[0].1.clone().unwrap();
    assert!(!handle.acknowledge(&seal_bytes("pub-999", b"forged")).await);
    tokio::time::sleep(Timeouts::default().ack + Duration::from_secs(1)).await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0].result, Err(NotifyError::AckTimeout(_))));
}
