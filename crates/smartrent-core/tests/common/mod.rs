// Shared harness for session tests: wiremock for the REST login and an
// in-memory socket peer that plays the server side of the protocol.
#![allow(clippy::unwrap_used, dead_code)]

use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use smartrent_api::{Accepted, MemoryConnector, MemoryListener, ReconnectConfig};
use smartrent_core::{ConnectionState, Controller, ControllerConfig};

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(3);

pub struct Harness {
    pub api: MockServer,
    pub connector: MemoryConnector,
    pub listener: MemoryListener,
    pub config: ControllerConfig,
}

pub fn token_body(access: &str, refresh: &str) -> Value {
    json!({
        "data": {
            "access_token": access,
            "refresh_token": refresh,
            "expires": Utc::now().timestamp() + 3600,
            "user_id": 7
        }
    })
}

impl Harness {
    /// Login succeeds with `access-1`; the session subscribes to `lock-1`
    /// and `t-1`.
    pub async fn new() -> Self {
        let harness = Self::bare().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1", "refresh-1")))
            .mount(&harness.api)
            .await;
        harness
    }

    /// No REST mocks mounted.
    pub async fn bare() -> Self {
        let api = MockServer::start().await;
        let (connector, listener) = MemoryConnector::new();

        let mut config =
            ControllerConfig::new("resident@example.com", SecretString::from("hunter2".to_owned()))
                .unwrap();
        config.api_url = Url::parse(&api.uri()).unwrap();
        config.socket_url = Url::parse("ws://socket.test/socket/websocket").unwrap();
        config.device_ids = vec!["lock-1".into(), "t-1".into()];
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        config.command_timeout = Duration::from_millis(300);
        config.sweep_interval = Duration::from_millis(25);
        config.handshake_timeout = Duration::from_secs(1);
        config.connect_timeout = Duration::from_secs(2);

        Self {
            api,
            connector,
            listener,
            config,
        }
    }

    pub fn start(&self) -> Controller {
        Controller::start(self.config.clone(), self.connector.clone()).unwrap()
    }

    /// Accept the next connection without answering anything.
    pub async fn accept(&mut self) -> FakeServer {
        let accepted = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("no connection attempt")
            .unwrap();
        FakeServer { accepted }
    }

    /// Accept the next connection, complete the handshake and answer the
    /// resync with the default device snapshots.
    pub async fn accept_subscribed(&mut self) -> FakeServer {
        let mut server = self.accept().await;
        server.handshake().await;
        server.answer_sync(&default_snapshots()).await;
        server
    }

    /// Start a controller and bring it to a synced `Subscribed` state.
    pub async fn connected(&mut self) -> (Controller, FakeServer) {
        let controller = self.start();
        let server = self.accept_subscribed().await;
        controller.wait_until_subscribed(WAIT).await.unwrap();
        wait_until(|| controller.current_state("t-1").is_ok()).await;
        (controller, server)
    }
}

pub fn lock_snapshot(locked: bool, version: u64) -> Value {
    json!({
        "type": "snapshot",
        "device_id": "lock-1",
        "kind": "lock",
        "name": "Front Door",
        "version": version,
        "attributes": {"locked": locked, "battery_level": 88, "online": true}
    })
}

pub fn thermostat_snapshot(version: u64) -> Value {
    json!({
        "type": "snapshot",
        "device_id": "t-1",
        "kind": "thermostat",
        "name": "Living Room",
        "version": version,
        "attributes": {
            "mode": "cool",
            "fan_mode": "auto",
            "cooling_setpoint": 74,
            "heating_setpoint": 68,
            "current_temp": 72.5,
            "operating_state": "idle",
            "online": true
        }
    })
}

pub fn default_snapshots() -> Vec<Value> {
    vec![lock_snapshot(false, 1), thermostat_snapshot(1)]
}

/// Server side of one in-memory connection.
pub struct FakeServer {
    pub accepted: Accepted,
}

impl FakeServer {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.accepted.header(name)
    }

    /// Next frame the client sent.
    pub async fn recv(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.accepted.peer.recv())
            .await
            .expect("client sent nothing")
            .expect("client closed the connection");
        serde_json::from_str(&text).unwrap()
    }

    /// Next frame, which must be of type `frame_type`.
    pub async fn expect(&mut self, frame_type: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["type"], frame_type, "unexpected frame: {frame}");
        frame
    }

    pub async fn send(&self, frame: Value) {
        self.accepted.peer.send(frame.to_string()).await.unwrap();
    }

    pub async fn send_raw(&self, text: &str) {
        self.accepted.peer.send(text).await.unwrap();
    }

    pub async fn ack(&self, frame: &Value) {
        self.send(json!({"type": "ack", "ref": frame["ref"]})).await;
    }

    pub async fn close(&self) {
        self.accepted.peer.close(Some(1001), "going away").await;
    }

    /// Answer auth and subscribe. Returns the subscribed ids.
    pub async fn handshake(&mut self) -> Vec<String> {
        let auth = self.expect("auth").await;
        self.ack(&auth).await;
        let subscribe = self.expect("subscribe").await;
        self.ack(&subscribe).await;
        serde_json::from_value(subscribe["device_ids"].clone()).unwrap()
    }

    /// Wait for the resync request and answer it with `snapshots`.
    pub async fn answer_sync(&mut self, snapshots: &[Value]) -> Value {
        let sync = self.expect("sync").await;
        for snapshot in snapshots {
            self.send(snapshot.clone()).await;
        }
        self.ack(&sync).await;
        sync
    }
}

/// Poll `check` until it holds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub async fn wait_for_state(controller: &Controller, matches: impl Fn(&ConnectionState) -> bool) {
    let mut states = controller.state_changes();
    tokio::time::timeout(WAIT, states.wait_for(|s| matches(s)))
        .await
        .expect("state never reached")
        .unwrap();
}
