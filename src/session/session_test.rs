use std::time::Duration;

use serde_json::json;

use super::*;
use crate::backoff::ReconnectPolicy;
use crate::codec::JsonCodec;
use crate::codec::json::PING;
use crate::credentials::{CredentialSource, TokenEndpoint};
use crate::message::RemoteError;
use crate::transport::{MemoryPeer, MemoryServer, MemoryTransport};

const FRAME_WAIT: Duration = Duration::from_secs(30);

fn test_config() -> SessionConfig {
    SessionConfig::new("memory", CredentialSource::StaticToken("token-1".into()))
        .with_reconnect(ReconnectPolicy {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 3,
            jitter: 0.0,
        })
        .with_command_timeout(Duration::from_secs(5))
        .with_handshake_timeout(Duration::from_secs(5))
}

fn session_with(config: SessionConfig) -> (Session, MemoryServer) {
    let (transport, server) = MemoryTransport::pair();
    (Session::new(config, transport, JsonCodec).expect("session"), server)
}

async fn recv_json(peer: &mut MemoryPeer) -> Value {
    let text = tokio::time::timeout(FRAME_WAIT, peer.recv_text())
        .await
        .expect("frame in time")
        .expect("client frame");
    serde_json::from_str(&text).expect("json frame")
}

fn send_json(peer: &MemoryPeer, value: Value) {
    assert!(peer.send_text(value.to_string()), "client is gone");
}

fn reply_ok(peer: &MemoryPeer, request: &Value, result: Value) {
    send_json(peer, json!({ "id": request["id"], "type": "result", "success": true, "result": result }));
}

fn reply_err(peer: &MemoryPeer, request: &Value, code: &str) {
    send_json(
        peer,
        json!({ "id": request["id"], "type": "result", "success": false, "error": { "code": code, "message": code } }),
    );
}

async fn accept_authenticated(server: &mut MemoryServer) -> MemoryPeer {
    let mut peer = server.accept().await.expect("client connects");
    send_json(&peer, json!({ "type": "auth_required", "ha_version": "2024.1" }));
    let auth = recv_json(&mut peer).await;
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["access_token"], "token-1");
    send_json(&peer, json!({ "type": "auth_ok", "ha_version": "2024.1" }));
    peer
}

async fn connected(config: SessionConfig) -> (Session, MemoryServer, MemoryPeer) {
    let (session, mut server) = session_with(config);
    let (result, peer) = tokio::join!(session.connect(), accept_authenticated(&mut server));
    result.expect("connect");
    (session, server, peer)
}

fn spawn_command(session: &Session, op: &str) -> JoinHandle<Result<Value, SessionError>> {
    let session = session.clone();
    let command = Command::new(op);
    tokio::spawn(async move { session.send_command(command).await })
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn starts_disconnected_and_rejects_commands_without_network() {
    let (session, server) = session_with(test_config());
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let err = session.send_command(Command::new("get_status")).await.expect_err("not ready");
    assert_eq!(err, SessionError::NotReady);
    assert_eq!(server.open_attempts(), 0);
}

#[tokio::test]
async fn connect_reaches_ready_and_is_idempotent() {
    let (session, server, _peer) = connected(test_config()).await;
    assert_eq!(session.state(), ConnectionState::Ready);

    session.connect().await.expect("second connect");
    assert_eq!(server.open_attempts(), 1);
}

#[tokio::test]
async fn invalid_config_is_rejected_at_construction() {
    let (transport, _server) = MemoryTransport::pair();
    let config = test_config().with_command_timeout(Duration::ZERO);
    assert!(matches!(Session::new(config, transport, JsonCodec), Err(ConfigError::Policy(_))));
}

#[tokio::test]
async fn handshake_rejection_fails_without_retry() {
    let (session, mut server) = session_with(test_config());
    let reject = async {
        let mut peer = server.accept().await.expect("client connects");
        send_json(&peer, json!({ "type": "auth_required" }));
        recv_json(&mut peer).await;
        send_json(&peer, json!({ "type": "auth_invalid", "message": "Invalid access token" }));
        peer
    };
    let (result, _peer) = tokio::join!(session.connect(), reject);

    assert_eq!(result, Err(SessionError::AuthRejected("Invalid access token".into())));
    assert!(matches!(session.state(), ConnectionState::Failed(SessionError::AuthRejected(_))));
    assert_eq!(server.open_attempts(), 1);
}

#[tokio::test]
async fn disconnect_fails_every_pending_request() {
    let (session, _server, mut peer) = connected(test_config()).await;
    let tasks = ["a", "b", "c"].map(|op| spawn_command(&session, op));
    for _ in 0..3 {
        recv_json(&mut peer).await;
    }
    assert_eq!(session.pending_requests(), 3);

    session.disconnect().await;

    for task in tasks {
        assert_eq!(task.await.expect("join"), Err(SessionError::ConnectionLost));
    }
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connection_loss_fails_pending_requests() {
    let (session, _server, mut peer) = connected(test_config()).await;
    let task = spawn_command(&session, "get_status");
    recv_json(&mut peer).await;

    peer.close();

    assert_eq!(task.await.expect("join"), Err(SessionError::ConnectionLost));
    assert_eq!(session.pending_requests(), 0);
    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_exponentially_then_gives_up() {
    let (session, server, mut peer) = connected(test_config()).await;
    let mut states = session.observe_state();
    server.set_refusing(true);
    peer.close();

    let mut seen = Vec::new();
    let failure = loop {
        states.changed().await.expect("driver alive");
        let state = states.borrow_and_update().clone();
        match state {
            ConnectionState::Reconnecting { attempt, delay } => seen.push((attempt, delay)),
            ConnectionState::Failed(err) => break err,
            _ => {}
        }
    };

    assert_eq!(
        seen,
        vec![
            (1, Duration::from_millis(1_000)),
            (2, Duration::from_millis(2_000)),
            (3, Duration::from_millis(4_000)),
        ]
    );
    assert_eq!(failure, SessionError::MaxRetriesExceeded { attempts: 3 });
    assert_eq!(server.open_attempts(), 4);
}

#[tokio::test]
async fn stalled_token_endpoint_is_bounded_by_handshake_timeout() {
    // accepts the token request and never answers it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let endpoint = TokenEndpoint::new(format!("http://{addr}/gui/token.html"));
    let config = SessionConfig::new("memory", CredentialSource::HttpToken(endpoint))
        .with_reconnect(ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            max_attempts: 1,
            jitter: 0.0,
        })
        .with_handshake_timeout(Duration::from_millis(300));
    let (session, server) = session_with(config);

    let started = std::time::Instant::now();
    let result = tokio::time::timeout(FRAME_WAIT, session.connect()).await.expect("connect settles");
    assert_eq!(result, Err(SessionError::MaxRetriesExceeded { attempts: 1 }));
    assert_eq!(server.open_attempts(), 2);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn unanswered_keepalive_drops_connection_into_reconnect() {
    let config = test_config().with_keepalive(Duration::from_secs(2), Command::new(PING));
    let (session, mut server, mut peer) = connected(config).await;

    let ping = recv_json(&mut peer).await;
    assert_eq!(ping["type"], "ping");
    send_json(&peer, json!({ "id": ping["id"], "type": "pong" }));

    let unanswered = recv_json(&mut peer).await;
    assert_eq!(unanswered["type"], "ping");
    assert_ne!(unanswered["id"], ping["id"]);

    let mut states = session.observe_state();
    let state = loop {
        states.changed().await.expect("driver alive");
        let state = states.borrow_and_update().clone();
        if !state.is_ready() {
            break state;
        }
    };
    assert!(matches!(state, ConnectionState::Reconnecting { attempt: 1, .. } | ConnectionState::Connecting));
    let _peer = accept_authenticated(&mut server).await;
    assert_eq!(server.open_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_while_reconnecting_restarts_backoff() {
    let mut config = test_config();
    config.reconnect.max_attempts = 10;
    let (session, mut server, mut peer) = connected(config).await;
    let mut states = session.observe_state();
    server.set_refusing(true);
    peer.close();

    loop {
        states.changed().await.expect("driver alive");
        if matches!(*states.borrow_and_update(), ConnectionState::Reconnecting { attempt: 2, .. }) {
            break;
        }
    }

    server.set_refusing(false);
    let started = tokio::time::Instant::now();
    let (result, _peer) = tokio::join!(session.connect(), accept_authenticated(&mut server));
    result.expect("reconnected");
    assert!(started.elapsed() < Duration::from_millis(2_000));
    assert_eq!(session.state(), ConnectionState::Ready);
}

// =============================================================================
// COMMANDS
// =============================================================================

#[tokio::test]
async fn response_resolves_command_and_late_duplicate_is_dropped() {
    let (session, _server, mut peer) = connected(test_config()).await;

    let task = spawn_command(&session, "get_status");
    let request = recv_json(&mut peer).await;
    assert_eq!(request["type"], "get_status");
    reply_ok(&peer, &request, json!({ "status": "ok" }));
    assert_eq!(task.await.expect("join").expect("result"), json!({ "status": "ok" }));

    reply_ok(&peer, &request, json!({ "status": "duplicate" }));

    let follow_up = spawn_command(&session, "get_config");
    let next = recv_json(&mut peer).await;
    assert!(next["id"].as_u64() > request["id"].as_u64());
    reply_ok(&peer, &next, json!({ "version": 1 }));
    assert_eq!(follow_up.await.expect("join").expect("result"), json!({ "version": 1 }));
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn remote_error_is_returned_without_retry() {
    let (session, _server, mut peer) = connected(test_config()).await;
    let task = spawn_command(&session, "call_service");
    let request = recv_json(&mut peer).await;
    reply_err(&peer, &request, "not_found");

    assert_eq!(task.await.expect("join"), Err(SessionError::Remote(RemoteError::new("not_found", "not_found"))));
    assert!(tokio::time::timeout(Duration::from_millis(100), peer.recv()).await.is_err());
}

#[tokio::test]
async fn command_times_out_and_leaves_table_empty() {
    let config = test_config().with_command_timeout(Duration::from_millis(200));
    let (session, _server, mut peer) = connected(config).await;
    let task = spawn_command(&session, "slow");
    recv_json(&mut peer).await;

    assert_eq!(task.await.expect("join"), Err(SessionError::Timeout));
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn auth_rejected_command_is_refreshed_and_retried_once() {
    let (session, _server, mut peer) = connected(test_config()).await;
    let task = spawn_command(&session, "get_config");

    let first = recv_json(&mut peer).await;
    reply_err(&peer, &first, "unauthorized");

    let reauth = recv_json(&mut peer).await;
    assert_eq!(reauth["type"], "auth");
    send_json(&peer, json!({ "type": "auth_ok" }));

    let second = recv_json(&mut peer).await;
    assert_eq!(second["type"], "get_config");
    assert_ne!(second["id"], first["id"]);
    reply_ok(&peer, &second, json!({ "location_name": "Home" }));

    assert_eq!(task.await.expect("join").expect("result"), json!({ "location_name": "Home" }));
}

#[tokio::test]
async fn second_auth_rejection_surfaces_without_third_attempt() {
    let (session, _server, mut peer) = connected(test_config()).await;
    let task = spawn_command(&session, "get_config");

    let first = recv_json(&mut peer).await;
    reply_err(&peer, &first, "unauthorized");
    recv_json(&mut peer).await;
    send_json(&peer, json!({ "type": "auth_ok" }));
    let second = recv_json(&mut peer).await;
    reply_err(&peer, &second, "unauthorized");

    assert!(matches!(task.await.expect("join"), Err(SessionError::AuthRejected(_))));
    assert!(tokio::time::timeout(Duration::from_millis(100), peer.recv()).await.is_err());
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn malformed_frame_does_not_end_connection() {
    let (session, _server, mut peer) = connected(test_config()).await;
    assert!(peer.send_text("{definitely not json"));

    let task = spawn_command(&session, "get_status");
    let request = recv_json(&mut peer).await;
    reply_ok(&peer, &request, json!("fine"));
    assert_eq!(task.await.expect("join").expect("result"), json!("fine"));
    assert_eq!(session.state(), ConnectionState::Ready);
}

// =============================================================================
// SUBSCRIPTIONS & CACHE
// =============================================================================

#[tokio::test]
async fn subscription_made_while_disconnected_is_replayed_and_receives_pushes() {
    let (session, mut server) = session_with(test_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.subscribe("light.kitchen", move |event: Event| {
        let _ = tx.send(event.payload());
    });

    let (result, mut peer) = tokio::join!(session.connect(), accept_authenticated(&mut server));
    result.expect("connect");

    let subscribe = recv_json(&mut peer).await;
    assert_eq!(subscribe, json!({ "id": subscribe["id"], "type": "subscribe_events", "event_type": "state_changed" }));
    reply_ok(&peer, &subscribe, Value::Null);

    let on = json!({ "entity_id": "light.kitchen", "state": "on", "attributes": { "brightness": 180 } });
    let hall = json!({ "entity_id": "light.hall", "state": "off" });
    for (entity, state) in [("light.hall", hall), ("light.kitchen", on.clone())] {
        send_json(
            &peer,
            json!({
                "id": subscribe["id"],
                "type": "event",
                "event": {
                    "event_type": "state_changed",
                    "data": { "entity_id": entity, "old_state": null, "new_state": state },
                    "origin": "LOCAL",
                    "time_fired": "2024-01-01T00:00:00+00:00"
                }
            }),
        );
    }

    let payload = tokio::time::timeout(FRAME_WAIT, rx.recv()).await.expect("in time").expect("event");
    assert_eq!(payload, on);
    assert_eq!(session.read_cached("light.kitchen"), Some(on));
    assert!(session.cached_entity("light.kitchen").is_some());
    assert!(rx.try_recv().is_err(), "other entities are not routed to this listener");
}

#[tokio::test]
async fn unsubscribing_last_listener_cancels_server_subscription() {
    let (session, _server, mut peer) = connected(test_config()).await;
    let handle = session.subscribe("sensor.temp", |_| {});

    let subscribe = recv_json(&mut peer).await;
    assert_eq!(subscribe["type"], "subscribe_events");
    reply_ok(&peer, &subscribe, Value::Null);

    assert!(session.unsubscribe(handle));
    let unsubscribe = recv_json(&mut peer).await;
    assert_eq!(unsubscribe["type"], "unsubscribe_events");
    assert_eq!(unsubscribe["subscription"], subscribe["id"]);

    assert!(!session.unsubscribe(handle));
}

#[tokio::test]
async fn entity_topics_share_one_server_subscription() {
    let (session, _server, mut peer) = connected(test_config()).await;
    let kitchen = session.subscribe("light.kitchen", |_| {});
    let subscribe = recv_json(&mut peer).await;
    assert_eq!(subscribe["event_type"], "state_changed");
    reply_ok(&peer, &subscribe, Value::Null);

    let pump = session.subscribe("switch.pump", |_| {});
    assert!(session.unsubscribe(kitchen));

    // the pump still needs state_changed, so the next frame is the command
    let task = spawn_command(&session, "ping");
    let next = recv_json(&mut peer).await;
    assert_eq!(next["type"], "ping");
    reply_ok(&peer, &next, Value::Null);
    task.await.expect("join").expect("ping");

    assert!(session.unsubscribe(pump));
    let unsubscribe = recv_json(&mut peer).await;
    assert_eq!(unsubscribe["type"], "unsubscribe_events");
    assert_eq!(unsubscribe["subscription"], subscribe["id"]);
}

#[tokio::test]
async fn subscribe_during_handshake_is_replayed_exactly_once() {
    let (session, mut server) = session_with(test_config());
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    let mut peer = server.accept().await.expect("client connects");
    send_json(&peer, json!({ "type": "auth_required", "ha_version": "2024.1" }));
    let auth = recv_json(&mut peer).await;
    assert_eq!(auth["type"], "auth");
    assert_eq!(session.state(), ConnectionState::Authenticating);

    session.subscribe("light.kitchen", |_| {});
    send_json(&peer, json!({ "type": "auth_ok", "ha_version": "2024.1" }));
    connecting.await.expect("join").expect("connect");

    let subscribe = recv_json(&mut peer).await;
    assert_eq!(subscribe["type"], "subscribe_events");
    reply_ok(&peer, &subscribe, Value::Null);

    session.subscribe("light.kitchen", |_| {});
    let task = spawn_command(&session, "get_config");
    let next = recv_json(&mut peer).await;
    assert_eq!(next["type"], "get_config", "no second subscribe frame");
    reply_ok(&peer, &next, json!({}));
    task.await.expect("join").expect("get_config");
}

#[tokio::test]
async fn refresh_on_ready_loads_cache() {
    let config = test_config().with_refresh_on_ready(Command::new("get_states"));
    let (session, _server, mut peer) = connected(config).await;

    let request = recv_json(&mut peer).await;
    assert_eq!(request["type"], "get_states");
    reply_ok(
        &peer,
        &request,
        json!([
            { "entity_id": "light.kitchen", "state": "off" },
            { "entity_id": "sensor.temp", "state": "21.5" }
        ]),
    );

    for _ in 0..100 {
        if session.read_cached("sensor.temp").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.read_cached("sensor.temp"), Some(json!({ "entity_id": "sensor.temp", "state": "21.5" })));
    assert_eq!(session.cache().len(), 2);
}

#[tokio::test]
async fn cache_survives_reconnect() {
    let (session, mut server, mut peer) = connected(test_config()).await;
    send_json(
        &peer,
        json!({
            "type": "event",
            "event": { "event_type": "state_changed", "data": { "entity_id": "lock.front", "new_state": "locked" } }
        }),
    );
    for _ in 0..100 {
        if session.read_cached("lock.front").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    peer.close();
    let _peer = accept_authenticated(&mut server).await;
    assert_eq!(session.read_cached("lock.front"), Some(json!("locked")));
}
