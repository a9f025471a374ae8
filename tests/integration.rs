//! End-to-end tests: device credential -> ingestion -> relay bus -> gateway
//!
//! The server is assembled in-process with the in-memory cache; viewer
//! connections are driven through channels instead of real sockets.

use axum::extract::ws::{close_code, Message};
use futures::channel::mpsc;
use futures::{stream, SinkExt, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thingbus::auth::{CredentialAuthority, PrincipalKind, TokenError};
use thingbus::bus::{LocalBus, RelayBus, Subject};
use thingbus::cache::{CacheLookup, MemoryTokenCache, TokenCache};
use thingbus::directory::OwnershipDirectory;
use thingbus::server::{GatewayConfig, ThingbusServer, ThingbusServerConfig, UNAUTHORIZED_REASON};
use thingbus::ErrorKind;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_SECRET: &[u8] = b"test-secret-for-integration-tests";

fn server() -> (ThingbusServer, MemoryTokenCache) {
    let mut config = ThingbusServerConfig::new(TEST_SECRET.to_vec());
    config.gateway = GatewayConfig {
        auth_timeout: Duration::from_millis(200),
        forward_capacity: 64,
    };
    let cache = MemoryTokenCache::new();
    let server = ThingbusServer::with_cache(config, Arc::new(cache.clone()));
    (server, cache)
}

fn auth_frame(token: &str, thing_id: &str) -> Message {
    let body = serde_json::json!({"Token": token, "ThingId": thing_id}).to_string();
    Message::Text(body.into())
}

fn inbound(frames: Vec<Message>) -> impl Stream<Item = Result<Message, Infallible>> + Unpin + Send {
    stream::iter(frames.into_iter().map(Ok)).chain(stream::pending())
}

fn reading(token: &str, thing_id: &str, value: f64) -> Vec<u8> {
    serde_json::json!({
        "token": token,
        "Records": [{
            "Name": format!("{}:temperature", thing_id),
            "Unit": "Cel",
            "Time": 1_700_000_000.0 + value,
            "Value": value,
        }]
    })
    .to_string()
    .into_bytes()
}

/// Open a viewer session in the background
fn open_viewer(
    server: &ThingbusServer,
    token: &str,
    thing_id: &str,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded();
    let gateway = server.gateway();
    let frames = vec![auth_frame(token, thing_id)];
    let handle = tokio::spawn(async move { gateway.serve_connection(tx, inbound(frames)).await });
    (handle, rx)
}

async fn wait_for_subscribers(bus: &LocalBus, subject: &Subject, n: usize) {
    for _ in 0..400 {
        if bus.subscriber_count(subject) == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscriber count on {} never reached {}", subject, n);
}

async fn next_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
    match timeout(Duration::from_secs(2), rx.next()).await {
        Ok(Some(Message::Text(text))) => text.as_str().to_string(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_six_readings_reach_owner_in_order() {
    let (server, _cache) = server();
    let thing_token = server.registry().register("t1", "u1").await.unwrap();
    let user_token = server.authority().issue_user_token("u1").unwrap();

    let (session, mut rx) = open_viewer(&server, &user_token, "t1");
    wait_for_subscribers(&server.local_bus().unwrap(), &Subject::for_thing("t1").unwrap(), 1).await;

    let ingest = server.ingest();
    for i in 0..6 {
        let relayed = ingest
            .process("things/t1", &reading(&thing_token, "t1", i as f64))
            .await
            .unwrap();
        assert_eq!(relayed.delivered, 1);
    }

    for i in 0..6 {
        let frame = next_text(&mut rx).await;
        assert!(frame.contains("t1"), "frame {} missing thing id: {}", i, frame);

        let records: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(records[0]["Value"], i as f64);
    }

    server.gateway().shutdown_signal().stop();
    timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    assert!(rx.next().await.is_none());
}

#[tokio::test]
async fn test_mismatched_device_never_relayed() {
    let (server, _cache) = server();
    server.registry().register("t1", "u1").await.unwrap();
    let t2_token = server.registry().register("t2", "u1").await.unwrap();

    let bus = server.bus();
    let mut on_t1 = bus.subscribe(&Subject::for_thing("t1").unwrap()).await.unwrap();
    let mut on_t2 = bus.subscribe(&Subject::for_thing("t2").unwrap()).await.unwrap();

    for _ in 0..3 {
        let err = server
            .ingest()
            .process("things/t1", &reading(&t2_token, "t2", 1.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    assert!(on_t1.try_recv().is_none());
    assert!(on_t2.try_recv().is_none());
}

#[tokio::test]
async fn test_viewer_of_foreign_thing_gets_single_close() {
    let (server, _cache) = server();
    server.registry().register("t1", "u1").await.unwrap();
    let intruder = server.authority().issue_user_token("u2").unwrap();

    let (session, rx) = open_viewer(&server, &intruder, "t1");
    timeout(Duration::from_secs(2), session).await.unwrap().unwrap();

    let frames: Vec<Message> = rx.collect().await;
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, close_code::POLICY);
            assert!(frame.reason.as_str().contains(UNAUTHORIZED_REASON));
        }
        other => panic!("expected close frame, got {:?}", other),
    }
    assert_eq!(server.local_bus().unwrap().subscription_count(), 0);
}

#[tokio::test]
async fn test_admin_viewer_is_rejected() {
    let (server, _cache) = server();
    server.registry().register("t1", "u1").await.unwrap();
    let admin = server.authority().issue_admin_token().unwrap();

    let (session, rx) = open_viewer(&server, &admin, "t1");
    timeout(Duration::from_secs(2), session).await.unwrap().unwrap();

    let frames: Vec<Message> = rx.collect().await;
    assert!(matches!(frames.as_slice(), [Message::Close(Some(_))]));
}

#[tokio::test]
async fn test_removed_thing_loses_viewers_and_cache() {
    let (server, cache) = server();
    let thing_token = server.registry().register("t1", "u1").await.unwrap();
    let user_token = server.authority().issue_user_token("u1").unwrap();
    assert!(cache.get(&thing_token).await.unwrap().is_hit());

    server.registry().remove("t1").await.unwrap();
    assert_eq!(cache.get(&thing_token).await.unwrap(), CacheLookup::Miss);
    assert_eq!(cache.get("t1").await.unwrap(), CacheLookup::Miss);
    assert_eq!(server.registry().owner_of("t1").await.unwrap(), None);

    let (session, rx) = open_viewer(&server, &user_token, "t1");
    timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    let frames: Vec<Message> = rx.collect().await;
    assert!(matches!(frames.as_slice(), [Message::Close(Some(_))]));
}

#[tokio::test]
async fn test_many_viewers_of_one_thing() {
    let (server, _cache) = server();
    let thing_token = server.registry().register("t1", "u1").await.unwrap();
    let user_token = server.authority().issue_user_token("u1").unwrap();
    let subject = Subject::for_thing("t1").unwrap();

    let mut viewers = Vec::new();
    for _ in 0..5 {
        viewers.push(open_viewer(&server, &user_token, "t1"));
    }
    wait_for_subscribers(&server.local_bus().unwrap(), &subject, 5).await;

    let relayed = server
        .ingest()
        .process("things/t1", &reading(&thing_token, "t1", 42.0))
        .await
        .unwrap();
    assert_eq!(relayed.delivered, 5);

    for (_, rx) in viewers.iter_mut() {
        assert!(next_text(rx).await.contains("42"));
    }

    server.gateway().shutdown_signal().stop();
    for (session, _) in viewers {
        timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    }
    assert_eq!(server.local_bus().unwrap().subscription_count(), 0);
}

#[tokio::test]
async fn test_viewer_leaving_mid_stream() {
    let (server, _cache) = server();
    let thing_token = server.registry().register("t1", "u1").await.unwrap();
    let user_token = server.authority().issue_user_token("u1").unwrap();
    let subject = Subject::for_thing("t1").unwrap();

    let (tx, mut rx) = mpsc::unbounded();
    let (mut inbound_tx, inbound_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
    inbound_tx.send(Ok(auth_frame(&user_token, "t1"))).await.unwrap();

    let gateway = server.gateway();
    let session = tokio::spawn(async move { gateway.serve_connection(tx, inbound_rx).await });
    wait_for_subscribers(&server.local_bus().unwrap(), &subject, 1).await;

    server
        .ingest()
        .process("things/t1", &reading(&thing_token, "t1", 1.0))
        .await
        .unwrap();
    next_text(&mut rx).await;

    // Viewer hangs up
    drop(inbound_tx);
    timeout(Duration::from_secs(2), session).await.unwrap().unwrap();
    assert_eq!(server.local_bus().unwrap().subscriber_count(&subject), 0);

    // Later readings reach nobody
    let relayed = server
        .ingest()
        .process("things/t1", &reading(&thing_token, "t1", 2.0))
        .await
        .unwrap();
    assert_eq!(relayed.delivered, 0);
}

#[test]
fn test_issue_validate_every_kind() {
    let authority = CredentialAuthority::new(TEST_SECRET.to_vec(), "test");
    let other = CredentialAuthority::new(b"another-secret".to_vec(), "test");

    for kind in PrincipalKind::ALL {
        let token = match kind {
            PrincipalKind::Admin => authority.issue_admin_token(),
            PrincipalKind::User => authority.issue_user_token("u1"),
            PrincipalKind::Thing => authority.issue_thing_token("t1", "u1"),
        }
        .unwrap();

        let claims = authority.validate(kind, &token).unwrap();
        assert_eq!(claims.kind(), kind);
        assert_eq!(other.validate(kind, &token), Err(TokenError::InvalidSignature));
    }

    let thing = authority.issue_thing_token("t1", "u1").unwrap();
    assert_eq!(
        authority.validate(PrincipalKind::User, &thing),
        Err(TokenError::WrongShape)
    );
}
