#![allow(clippy::unwrap_used)]
// End-to-end session tests: a real session task against an in-memory socket
// peer and a wiremock REST server.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use smartrent_core::{
    AttributeChanges, AttributeValue, ChangeCause, ConnectionState, CoreError, DeviceKind, HvacMode,
    OfflinePolicy, attr,
};

use common::{
    Harness, WAIT, default_snapshots, lock_snapshot, thermostat_snapshot, token_body, wait_for_state,
    wait_until,
};

fn lock_change(locked: bool) -> AttributeChanges {
    BTreeMap::from([(attr::LOCKED.to_owned(), AttributeValue::Bool(locked))])
}

// ── Handshake ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_authenticates_subscribes_and_resyncs() {
    let mut harness = Harness::new().await;
    let controller = harness.start();

    let mut server = harness.accept().await;
    assert_eq!(server.header("authorization"), Some("Bearer access-1"));

    let auth = server.expect("auth").await;
    assert_eq!(auth["token"], "access-1");
    server.ack(&auth).await;
    wait_for_state(&controller, |s| *s == ConnectionState::Authenticated).await;

    let subscribe = server.expect("subscribe").await;
    assert_eq!(subscribe["device_ids"], json!(["lock-1", "t-1"]));
    server.ack(&subscribe).await;

    let sync = server.answer_sync(&default_snapshots()).await;
    assert_eq!(sync["device_ids"], json!(["lock-1", "t-1"]));

    controller.wait_until_subscribed(WAIT).await.unwrap();
    wait_until(|| controller.list_devices().len() == 2).await;

    let lock = controller.current_state("lock-1").unwrap();
    assert_eq!(lock.kind, DeviceKind::Lock);
    assert_eq!(lock.display_name(), "Front Door");
    assert_eq!(lock.locked(), Some(false));
    assert_eq!(lock.version, 1);

    let thermostat = controller.current_state("t-1").unwrap();
    assert_eq!(thermostat.mode(), Some(HvacMode::Cool));
    assert_eq!(thermostat.cooling_setpoint(), Some(74.0));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_connect_with_returns_once_subscribed() {
    let mut harness = Harness::new().await;
    let config = harness.config.clone();
    let connector = harness.connector.clone();

    let (controller, _server) = tokio::join!(
        smartrent_core::Controller::connect_with(config, connector),
        harness.accept_subscribed(),
    );
    let controller = controller.unwrap();
    assert!(controller.connection_state().is_subscribed());
    controller.shutdown().await;
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lock_command_is_optimistic_then_confirmed() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;
    let mut updates = controller.updates();

    let pending = controller.submit_change("lock-1", lock_change(true)).await.unwrap();

    // Optimistic value is visible before the server answers.
    let optimistic = controller.current_state("lock-1").unwrap();
    assert_eq!(optimistic.locked(), Some(true));
    assert!(optimistic.is_pending(attr::LOCKED));
    assert_eq!(optimistic.version, 1);

    let command = server.expect("command").await;
    assert_eq!(command["ref"], pending.correlation_id().to_string());
    assert_eq!(command["device_id"], "lock-1");
    assert_eq!(command["attributes"], json!({"locked": true}));

    server
        .send(json!({
            "type": "ack",
            "ref": command["ref"],
            "device_id": "lock-1",
            "version": 2,
            "attributes": {"locked": true}
        }))
        .await;

    let confirmed = pending.wait().await.unwrap();
    assert_eq!(confirmed.locked(), Some(true));
    assert_eq!(confirmed.version, 2);
    assert!(confirmed.pending.is_empty());

    let causes = [updates.recv().await.unwrap().cause, updates.recv().await.unwrap().cause];
    assert_eq!(causes, [ChangeCause::Optimistic, ChangeCause::Confirmed]);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_bare_ack_confirms_without_bumping_version() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let (result, ()) = tokio::join!(controller.set_locked("lock-1", true), async {
        let command = server.expect("command").await;
        server.ack(&command).await;
    });

    let snapshot = result.unwrap();
    assert_eq!(snapshot.locked(), Some(true));
    assert_eq!(snapshot.version, 1);
    assert!(!snapshot.is_pending(attr::LOCKED));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_newer_change_supersedes_overlapping_command() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let first = controller.submit_change("lock-1", lock_change(true)).await.unwrap();
    let second = controller.submit_change("lock-1", lock_change(false)).await.unwrap();

    let result = first.wait().await;
    assert!(matches!(result, Err(CoreError::Superseded)), "got: {result:?}");

    let _stale = server.expect("command").await;
    let latest = server.expect("command").await;
    assert_eq!(latest["ref"], second.correlation_id().to_string());
    server.ack(&latest).await;

    let snapshot = second.wait().await.unwrap();
    assert_eq!(snapshot.locked(), Some(false));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_unacknowledged_command_times_out_and_reverts() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let pending = controller.submit_change("lock-1", lock_change(true)).await.unwrap();
    let _command = server.expect("command").await;

    let result = pending.wait().await;
    assert!(
        matches!(result, Err(CoreError::CommandTimeout { timeout_ms: 300 })),
        "got: {result:?}"
    );

    let reverted = controller.current_state("lock-1").unwrap();
    assert_eq!(reverted.locked(), Some(false));
    assert!(reverted.pending.is_empty());
    assert!(controller.connection_state().is_subscribed());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_rejected_command_reverts_and_reports_reason() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let (result, ()) = tokio::join!(controller.set_locked("lock-1", true), async {
        let command = server.expect("command").await;
        server
            .send(json!({
                "type": "error",
                "ref": command["ref"],
                "code": "jammed",
                "reason": "bolt is jammed"
            }))
            .await;
    });

    match result {
        Err(CoreError::CommandRejected { code, reason }) => {
            assert_eq!(code.as_deref(), Some("jammed"));
            assert_eq!(reason, "bolt is jammed");
        }
        other => panic!("expected rejection, got: {other:?}"),
    }
    assert_eq!(controller.current_state("lock-1").unwrap().locked(), Some(false));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_thermostat_helpers_send_typed_values() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let (result, ()) = tokio::join!(controller.set_hvac_mode("t-1", HvacMode::Heat), async {
        let command = server.expect("command").await;
        assert_eq!(command["attributes"], json!({"mode": "heat"}));
        server.ack(&command).await;
    });
    assert_eq!(result.unwrap().mode(), Some(HvacMode::Heat));

    let (result, ()) = tokio::join!(controller.adjust_cooling_setpoint("t-1", 2.0), async {
        let command = server.expect("command").await;
        assert_eq!(command["attributes"], json!({"cooling_setpoint": 76.0}));
        server.ack(&command).await;
    });
    assert_eq!(result.unwrap().cooling_setpoint(), Some(76.0));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_invalid_changes_are_rejected_locally() {
    let mut harness = Harness::new().await;
    let (controller, _server) = harness.connected().await;

    let unknown = controller.set_locked("garage-9", true).await;
    assert!(matches!(unknown, Err(CoreError::DeviceNotFound { .. })), "got: {unknown:?}");

    let read_only = BTreeMap::from([(attr::BATTERY_LEVEL.to_owned(), AttributeValue::Int(5))]);
    let result = controller.request_change("lock-1", read_only).await;
    assert!(matches!(result, Err(CoreError::InvalidChange { .. })), "got: {result:?}");

    let wrong_type = BTreeMap::from([(attr::LOCKED.to_owned(), AttributeValue::from("yes"))]);
    let result = controller.request_change("lock-1", wrong_type).await;
    assert!(matches!(result, Err(CoreError::InvalidChange { .. })), "got: {result:?}");

    controller.shutdown().await;
}

#[tokio::test]
async fn test_non_finite_setpoints_are_rejected_locally() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let result = controller.set_cooling_setpoint("t-1", f64::NAN).await;
    assert!(matches!(result, Err(CoreError::InvalidChange { .. })), "got: {result:?}");
    let result = controller.set_heating_setpoint("t-1", f64::INFINITY).await;
    assert!(matches!(result, Err(CoreError::InvalidChange { .. })), "got: {result:?}");

    // Nothing reached the wire and the optimistic state is untouched.
    let sent = tokio::time::timeout(Duration::from_millis(100), server.accepted.peer.recv()).await;
    assert!(sent.is_err(), "unexpected frame: {sent:?}");
    assert!(controller.current_state("t-1").unwrap().pending.is_empty());
    controller.shutdown().await;
}

// ── Events ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stale_and_duplicate_events_are_ignored() {
    let mut harness = Harness::new().await;
    let (controller, server) = harness.connected().await;

    let event = |version: u64, locked: bool| {
        json!({"type": "event", "device_id": "lock-1", "version": version, "attributes": {"locked": locked}})
    };
    server.send(event(2, true)).await;
    server.send(event(2, false)).await;
    server.send(event(1, false)).await;
    // Marker: once this lands, everything before it was processed.
    server
        .send(json!({"type": "event", "device_id": "t-1", "version": 2, "attributes": {"current_temp": 71}}))
        .await;
    wait_until(|| controller.current_state("t-1").unwrap().version == 2).await;

    let lock = controller.current_state("lock-1").unwrap();
    assert_eq!(lock.version, 2);
    assert_eq!(lock.locked(), Some(true));
    assert_eq!(lock.battery_level(), Some(88));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_events_for_unsubscribed_devices_are_dropped() {
    let mut harness = Harness::new().await;
    let (controller, server) = harness.connected().await;

    server
        .send(json!({"type": "event", "device_id": "stranger", "version": 1, "attributes": {"locked": true}}))
        .await;
    server
        .send(json!({"type": "event", "device_id": "lock-1", "version": 2, "attributes": {"locked": true}}))
        .await;
    wait_until(|| controller.current_state("lock-1").unwrap().version == 2).await;

    let result = controller.current_state("stranger");
    assert!(matches!(result, Err(CoreError::DeviceNotFound { .. })), "got: {result:?}");
    controller.shutdown().await;
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_do_not_disturb_the_session() {
    let mut harness = Harness::new().await;
    let (controller, server) = harness.connected().await;

    server.send(json!({"type": "presence", "who": "someone"})).await;
    server.send_raw("definitely not json").await;
    server.send(json!({"type": "control", "event": "heartbeat"})).await;
    server
        .send(json!({"type": "event", "device_id": "lock-1", "version": 2, "attributes": {"locked": true}}))
        .await;

    wait_until(|| controller.current_state("lock-1").unwrap().locked() == Some(true)).await;
    assert!(controller.connection_state().is_subscribed());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_too_many_malformed_frames_force_a_reconnect() {
    let mut harness = Harness::new().await;
    let (controller, server) = harness.connected().await;

    for _ in 0..=harness.config.max_protocol_errors {
        server.send_raw("{broken").await;
    }

    let _next = harness.accept_subscribed().await;
    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

// ── Connection loss ─────────────────────────────────────────────────

#[tokio::test]
async fn test_server_close_fails_in_flight_commands_and_resyncs() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let pending = controller.submit_change("lock-1", lock_change(true)).await.unwrap();
    let _command = server.expect("command").await;
    server.close().await;

    let result = pending.wait().await;
    assert!(matches!(result, Err(CoreError::ConnectionLost)), "got: {result:?}");
    wait_for_state(&controller, |s| !s.is_subscribed()).await;

    // The lock changed while we were away; the resync picks it up.
    let mut next = harness.accept().await;
    next.handshake().await;
    next.answer_sync(&[lock_snapshot(true, 5), thermostat_snapshot(3)]).await;
    controller.wait_until_subscribed(WAIT).await.unwrap();

    wait_until(|| controller.current_state("lock-1").unwrap().version == 5).await;
    let lock = controller.current_state("lock-1").unwrap();
    assert_eq!(lock.locked(), Some(true));
    assert!(lock.pending.is_empty());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_close_control_event_reconnects() {
    let mut harness = Harness::new().await;
    let (controller, server) = harness.connected().await;

    server
        .send(json!({"type": "control", "event": "close", "reason": "deploy"}))
        .await;

    let _next = harness.accept_subscribed().await;
    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_refused_dials_back_off_until_the_endpoint_returns() {
    let mut harness = Harness::new().await;
    harness.connector.refuse_next(2);
    let controller = harness.start();

    let _server = harness.accept_subscribed().await;
    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_explicit_reconnect_opens_a_fresh_connection() {
    let mut harness = Harness::new().await;
    let (controller, _server) = harness.connected().await;

    controller.reconnect().await.unwrap();

    let _next = harness.accept_subscribed().await;
    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

// ── Authentication ──────────────────────────────────────────────────

#[tokio::test]
async fn test_rejected_login_parks_in_auth_failed() {
    let mut harness = Harness::bare().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/sessions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&harness.api)
        .await;

    let controller = harness.start();
    let result = controller.wait_until_subscribed(WAIT).await;
    assert!(
        matches!(&result, Err(e) if e.is_auth_failure()),
        "got: {result:?}"
    );
    assert!(matches!(controller.connection_state(), ConnectionState::AuthFailed { .. }));

    // Parked: no socket is opened.
    let dialed = tokio::time::timeout(Duration::from_millis(150), harness.listener.accept()).await;
    assert!(dialed.is_err());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_unauthorized_handshake_parks_until_reconnect() {
    let mut harness = Harness::new().await;
    let controller = harness.start();

    let mut server = harness.accept().await;
    let auth = server.expect("auth").await;
    server
        .send(json!({"type": "error", "ref": auth["ref"], "code": "unauthorized", "reason": "account locked"}))
        .await;

    let result = controller.wait_until_subscribed(WAIT).await;
    match result {
        Err(CoreError::AuthenticationFailed { message }) => assert_eq!(message, "account locked"),
        other => panic!("expected auth failure, got: {other:?}"),
    }

    controller.reconnect().await.unwrap();
    let _next = harness.accept_subscribed().await;
    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_during_handshake_is_refreshed_once() {
    let mut harness = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/tokens"))
        .and(header("authorization-x-refresh", "refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2", "refresh-2")))
        .expect(1)
        .mount(&harness.api)
        .await;
    let controller = harness.start();

    let mut first = harness.accept().await;
    let auth = first.expect("auth").await;
    first
        .send(json!({"type": "error", "ref": auth["ref"], "code": "token_expired", "reason": "expired"}))
        .await;

    let mut second = harness.accept().await;
    assert_eq!(second.header("authorization"), Some("Bearer access-2"));
    let auth = second.expect("auth").await;
    assert_eq!(auth["token"], "access-2");
    second.ack(&auth).await;
    let subscribe = second.expect("subscribe").await;
    second.ack(&subscribe).await;
    second.answer_sync(&default_snapshots()).await;

    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_discovery_refused_token_is_refreshed_before_redialing() {
    let mut harness = Harness::new().await;
    harness.config.device_ids.clear();
    Mock::given(method("GET"))
        .and(path("/api/v2/hubs"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
        .mount(&harness.api)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/hubs"))
        .and(header("authorization", "Bearer access-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": 11, "serial": "HUB-A", "online": true }]
        })))
        .mount(&harness.api)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/hubs/11/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": 100, "name": "Front Door", "type": "entry_control", "online": true }]
        })))
        .mount(&harness.api)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/tokens"))
        .and(header("authorization-x-refresh", "refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2", "refresh-2")))
        .expect(1)
        .mount(&harness.api)
        .await;

    let controller = harness.start();
    let mut server = harness.accept().await;
    assert_eq!(server.header("authorization"), Some("Bearer access-2"));
    assert_eq!(server.handshake().await, ["100"]);
    server.answer_sync(&[]).await;

    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_rejected_upgrade_is_retried_with_a_fresh_token() {
    let mut harness = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/tokens"))
        .and(header("authorization-x-refresh", "refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2", "refresh-2")))
        .expect(1)
        .mount(&harness.api)
        .await;
    harness.connector.deny_next(401);

    let controller = harness.start();
    let mut server = harness.accept().await;
    assert_eq!(server.header("authorization"), Some("Bearer access-2"));
    let auth = server.expect("auth").await;
    assert_eq!(auth["token"], "access-2");
    server.ack(&auth).await;
    let subscribe = server.expect("subscribe").await;
    server.ack(&subscribe).await;
    server.answer_sync(&default_snapshots()).await;

    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_reauthenticate_control_sends_a_new_auth_frame() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    server.send(json!({"type": "control", "event": "reauthenticate"})).await;
    let auth = server.expect("auth").await;
    assert_eq!(auth["token"], "access-1");
    server.ack(&auth).await;

    assert!(controller.connection_state().is_subscribed());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_rejected_reauthentication_drops_the_connection() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    server.send(json!({"type": "control", "event": "reauthenticate"})).await;
    let auth = server.expect("auth").await;
    server
        .send(json!({"type": "error", "ref": auth["ref"], "code": "server_busy", "reason": "try later"}))
        .await;

    wait_for_state(&controller, |s| !s.is_subscribed()).await;
    let _next = harness.accept_subscribed().await;
    controller.wait_until_subscribed(WAIT).await.unwrap();
    controller.shutdown().await;
}

// ── Offline policy ──────────────────────────────────────────────────

#[tokio::test]
async fn test_commands_are_rejected_while_disconnected_by_default() {
    let mut harness = Harness::new().await;
    let (controller, _server) = harness.connected().await;

    controller.disconnect().await.unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);

    let result = controller.set_locked("lock-1", true).await;
    assert!(matches!(result, Err(CoreError::NotConnected)), "got: {result:?}");

    let result = controller.refresh_device("lock-1").await;
    assert!(matches!(result, Err(CoreError::NotConnected)), "got: {result:?}");
    controller.shutdown().await;
}

#[tokio::test]
async fn test_queued_commands_are_sent_after_resubscribe() {
    let mut harness = Harness::new().await;
    harness.config.offline_policy = OfflinePolicy::Queue { capacity: 1 };
    let (controller, server) = harness.connected().await;

    server.close().await;
    wait_for_state(&controller, |s| !s.is_subscribed()).await;

    let pending = controller.submit_change("lock-1", lock_change(true)).await.unwrap();
    // Queued commands carry no optimistic overlay.
    assert_eq!(controller.current_state("lock-1").unwrap().locked(), Some(false));

    let overflow = BTreeMap::from([(attr::MODE.to_owned(), AttributeValue::from("heat"))]);
    let result = controller.submit_change("t-1", overflow).await;
    assert!(matches!(result, Err(CoreError::NotConnected)), "got: {result:?}");

    let mut next = harness.accept().await;
    next.handshake().await;
    next.answer_sync(&default_snapshots()).await;
    let command = next.expect("command").await;
    assert_eq!(command["ref"], pending.correlation_id().to_string());
    next.ack(&command).await;

    let snapshot = pending.wait().await.unwrap();
    assert_eq!(snapshot.locked(), Some(true));
    controller.shutdown().await;
}

// ── Subscription management ─────────────────────────────────────────

#[tokio::test]
async fn test_subscribe_adds_devices_and_resyncs_them() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let (result, ()) = tokio::join!(controller.subscribe(vec!["lock-2".into()]), async {
        let subscribe = server.expect("subscribe").await;
        assert_eq!(subscribe["device_ids"], json!(["lock-2"]));
        server.ack(&subscribe).await;
    });
    result.unwrap();

    let mut back_door = lock_snapshot(true, 4);
    back_door["device_id"] = json!("lock-2");
    back_door["name"] = json!("Back Door");
    let sync = server.answer_sync(&[back_door]).await;
    assert_eq!(sync["device_ids"], json!(["lock-2"]));

    wait_until(|| controller.current_state("lock-2").is_ok()).await;
    assert_eq!(controller.current_state("lock-2").unwrap().display_name(), "Back Door");
    controller.shutdown().await;
}

#[tokio::test]
async fn test_refresh_device_returns_the_fresh_snapshot() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let snapshots = [lock_snapshot(true, 9)];
    let (result, sync) = tokio::join!(
        controller.refresh_device("lock-1"),
        server.answer_sync(&snapshots),
    );
    assert_eq!(sync["device_ids"], json!(["lock-1"]));

    let snapshot = result.unwrap();
    assert_eq!(snapshot.version, 9);
    assert_eq!(snapshot.locked(), Some(true));

    let unknown = controller.refresh_device("garage-9").await;
    assert!(matches!(unknown, Err(CoreError::DeviceNotFound { .. })), "got: {unknown:?}");
    controller.shutdown().await;
}

#[tokio::test]
async fn test_refresh_snapshot_is_authoritative_over_newer_events() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    server
        .send(json!({"type": "event", "device_id": "lock-1", "version": 9, "attributes": {"locked": true}}))
        .await;
    wait_until(|| controller.current_state("lock-1").unwrap().version == 9).await;

    // The server's resync answer wins even at a lower version.
    let snapshots = [lock_snapshot(false, 4)];
    let (result, _) = tokio::join!(
        controller.refresh_device("lock-1"),
        server.answer_sync(&snapshots),
    );
    let snapshot = result.unwrap();
    assert_eq!(snapshot.version, 4);
    assert_eq!(snapshot.locked(), Some(false));

    // Events are ordered against the resynced version from then on.
    server
        .send(json!({"type": "event", "device_id": "lock-1", "version": 5, "attributes": {"locked": true}}))
        .await;
    wait_until(|| controller.current_state("lock-1").unwrap().version == 5).await;
    assert_eq!(controller.current_state("lock-1").unwrap().locked(), Some(true));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_subscribe_times_out() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let (result, _frame) = tokio::join!(
        controller.subscribe(vec!["lock-2".into()]),
        server.expect("subscribe"),
    );
    assert!(
        matches!(result, Err(CoreError::CommandTimeout { .. })),
        "got: {result:?}"
    );
    controller.shutdown().await;
}

#[tokio::test]
async fn test_empty_device_list_is_filled_by_discovery() {
    let mut harness = Harness::new().await;
    harness.config.device_ids.clear();
    Mock::given(method("GET"))
        .and(path("/api/v2/hubs"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": 11, "serial": "HUB-A", "online": true }]
        })))
        .mount(&harness.api)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/hubs/11/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": 100, "name": "Front Door", "type": "entry_control", "online": true },
                { "id": 101, "name": "Hallway", "type": "thermostat", "online": true }
            ]
        })))
        .mount(&harness.api)
        .await;

    let controller = harness.start();
    let mut server = harness.accept().await;
    let subscribed = server.handshake().await;
    assert_eq!(subscribed, ["100", "101"]);

    // An event before any snapshot uses the discovered kind and name.
    server.answer_sync(&[]).await;
    server
        .send(json!({"type": "event", "device_id": 100, "version": 3, "attributes": {"locked": true}}))
        .await;
    wait_until(|| controller.current_state("100").is_ok()).await;

    let door = controller.current_state("100").unwrap();
    assert_eq!(door.kind, DeviceKind::Lock);
    assert_eq!(door.display_name(), "Front Door");
    assert_eq!(door.locked(), Some(true));
    controller.shutdown().await;
}

#[tokio::test]
async fn test_refresh_all_resyncs_every_subscribed_device() {
    let mut harness = Harness::new().await;
    let (controller, mut server) = harness.connected().await;

    let snapshots = [lock_snapshot(true, 7), thermostat_snapshot(7)];
    let (result, sync) = tokio::join!(
        controller.refresh_all(),
        server.answer_sync(&snapshots),
    );
    result.unwrap();
    assert_eq!(sync["device_ids"], json!(["lock-1", "t-1"]));
    assert_eq!(controller.current_state("lock-1").unwrap().version, 7);
    assert_eq!(controller.current_state("t-1").unwrap().version, 7);
    controller.shutdown().await;
}
