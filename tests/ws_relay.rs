//! End-to-end WebSocket scenarios against a live relay instance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secp256k1::SecretKey;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lorelay::acl::AclMode;
use lorelay::event::verify::{pubkey_of, sign_event};
use lorelay::event::{Event, Pubkey, KIND_CLIENT_AUTH, KIND_DELETION};
use lorelay::relay::{self, RelayState};
use lorelay::store::{keys, Store};
use lorelay::Config;

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).expect("test key")
}

fn note(seed: u8, created_at: i64, content: &str) -> Event {
    sign_event(&key(seed), created_at, 1, vec![], content.to_string())
}

async fn start_relay(admins: Vec<Pubkey>, acl_mode: AclMode) -> (SocketAddr, Arc<RelayState>) {
    let store = Arc::new(Store::builder().temp(true).build().unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cfg = Config {
        admins,
        acl_mode,
        relay_url: Some(format!("ws://{addr}")),
        ..Default::default()
    };
    let state = relay::build_with_store(cfg, store).unwrap();
    tokio::spawn(relay::serve(state.clone(), listener));
    (addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _response) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("connect to relay");
    ws
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

async fn recv_json_within(ws: &mut Client, wait: Duration) -> Value {
    loop {
        let message = tokio::time::timeout(wait, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn recv_json(ws: &mut Client) -> Value {
    recv_json_within(ws, Duration::from_secs(5)).await
}

#[tokio::test]
async fn auth_handshake_flow() {
    let admin_sk = key(1);
    let (addr, _state) = start_relay(vec![pubkey_of(&admin_sk)], AclMode::Follows).await;
    let mut ws = connect(addr).await;

    // 1. Unsolicited challenge on accept
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame[0], "AUTH");
    let challenge = frame[1].as_str().unwrap().to_string();

    // 2/3. REQ before auth is refused with another challenge
    send_json(&mut ws, json!(["REQ", "s1", {"kinds": [1]}])).await;
    let closed = recv_json(&mut ws).await;
    assert_eq!(closed[0], "CLOSED");
    assert_eq!(closed[1], "s1");
    assert!(closed[2].as_str().unwrap().starts_with("auth-required:"));
    let again = recv_json(&mut ws).await;
    assert_eq!(again[0], "AUTH");
    assert_eq!(again[1].as_str().unwrap(), challenge, "nonce is connection scoped");

    // 4/5. Signed kind-22242 response flips the connection to authenticated
    let auth_event = sign_event(
        &admin_sk,
        chrono::Utc::now().timestamp(),
        KIND_CLIENT_AUTH,
        vec![
            vec!["relay".to_string(), format!("ws://{addr}")],
            vec!["challenge".to_string(), challenge],
        ],
        String::new(),
    );
    send_json(&mut ws, json!(["AUTH", &auth_event])).await;
    let ok = recv_json(&mut ws).await;
    assert_eq!(ok[0], "OK");
    assert_eq!(ok[1].as_str().unwrap(), hex::encode(auth_event.id));
    assert_eq!(ok[2], true);

    // 6. The same REQ now streams and ends with EOSE
    send_json(&mut ws, json!(["REQ", "s1", {"kinds": [1]}])).await;
    let eose = recv_json(&mut ws).await;
    assert_eq!(eose[0], "EOSE");
    assert_eq!(eose[1], "s1");
}

#[tokio::test]
async fn duplicate_rejection() {
    let (addr, state) = start_relay(vec![], AclMode::None).await;
    let mut ws = connect(addr).await;
    let event = note(2, 1_700_000_100, "store me once");

    send_json(&mut ws, json!(["EVENT", &event])).await;
    let first = recv_json(&mut ws).await;
    assert_eq!(first[0], "OK");
    assert_eq!(first[2], true);
    assert_eq!(first[3], "");

    send_json(&mut ws, json!(["EVENT", &event])).await;
    let second = recv_json(&mut ws).await;
    assert_eq!(second[0], "OK");
    assert_eq!(second[2], false);
    assert_eq!(second[3], "duplicate: already have this event");

    // Exactly one row in the store
    let (lo, hi) = keys::created_range(None, None);
    assert_eq!(state.store.scan(&lo, &hi, false).unwrap().len(), 1);
}

#[tokio::test]
async fn replaceable_replacement() {
    let (addr, state) = start_relay(vec![], AclMode::None).await;
    let mut ws = connect(addr).await;

    let older = sign_event(&key(3), 100, 0, vec![], "profile v1".into());
    let newer = sign_event(&key(3), 101, 0, vec![], "profile v2".into());

    send_json(&mut ws, json!(["EVENT", &older])).await;
    assert_eq!(recv_json(&mut ws).await[2], true);
    let old_serial = state.store.serial_of(&older.id).unwrap().unwrap();
    send_json(&mut ws, json!(["EVENT", &newer])).await;
    assert_eq!(recv_json(&mut ws).await[2], true);

    let author = hex::encode(newer.pubkey);
    send_json(
        &mut ws,
        json!(["REQ", "meta", {"authors": [author], "kinds": [0]}]),
    )
    .await;
    let event_frame = recv_json(&mut ws).await;
    assert_eq!(event_frame[0], "EVENT");
    assert_eq!(
        event_frame[2]["id"].as_str().unwrap(),
        hex::encode(newer.id)
    );
    assert_eq!(recv_json(&mut ws).await[0], "EOSE");

    // The superseded row and all of its index entries are gone
    assert!(state.store.serial_of(&older.id).unwrap().is_none());
    let all = state.store.scan(&[0u8], &[0xffu8; 64], false).unwrap();
    assert!(all
        .iter()
        .filter(|k| k[0] != keys::PRE_MARKER && k[0] != keys::PRE_TOMBSTONE)
        .all(|k| keys::serial_from_suffix(k) != old_serial));
}

#[tokio::test]
async fn delete_by_e_tag() {
    let (addr, state) = start_relay(vec![], AclMode::None).await;
    let mut ws = connect(addr).await;

    let target = note(4, 1_700_000_000, "ephemeral opinion");
    send_json(&mut ws, json!(["EVENT", &target])).await;
    assert_eq!(recv_json(&mut ws).await[2], true);
    let serial = state.store.serial_of(&target.id).unwrap().unwrap();

    let deletion = sign_event(
        &key(4),
        1_700_000_010,
        KIND_DELETION,
        vec![vec!["e".to_string(), hex::encode(target.id)]],
        String::new(),
    );
    send_json(&mut ws, json!(["EVENT", &deletion])).await;
    let ok = recv_json(&mut ws).await;
    assert_eq!(ok[2], true, "deletion accepted: {ok}");

    assert!(state.store.fetch(serial).is_err());

    // Replaying the deleted event is refused
    send_json(&mut ws, json!(["EVENT", &target])).await;
    let replay = recv_json(&mut ws).await;
    assert_eq!(replay[2], false);
    assert!(replay[3].as_str().unwrap().starts_with("blocked:"));
}

#[tokio::test]
async fn deletion_of_foreign_event_is_blocked() {
    let (addr, _state) = start_relay(vec![], AclMode::None).await;
    let mut ws = connect(addr).await;

    let target = note(5, 1_700_000_000, "mine");
    send_json(&mut ws, json!(["EVENT", &target])).await;
    assert_eq!(recv_json(&mut ws).await[2], true);

    let foreign = sign_event(
        &key(6),
        1_700_000_010,
        KIND_DELETION,
        vec![vec!["e".to_string(), hex::encode(target.id)]],
        String::new(),
    );
    send_json(&mut ws, json!(["EVENT", &foreign])).await;
    let ok = recv_json(&mut ws).await;
    assert_eq!(ok[2], false);
    assert_eq!(
        ok[3].as_str().unwrap(),
        "blocked: cannot delete events that belong to other users"
    );
}

#[tokio::test]
async fn live_fanout_after_eose() {
    let (addr, _state) = start_relay(vec![], AclMode::None).await;

    let mut subscriber = connect(addr).await;
    send_json(&mut subscriber, json!(["REQ", "s", {}])).await;
    assert_eq!(recv_json(&mut subscriber).await[0], "EOSE");

    let mut publisher = connect(addr).await;
    let event = note(7, chrono::Utc::now().timestamp(), "breaking news");
    send_json(&mut publisher, json!(["EVENT", &event])).await;
    assert_eq!(recv_json(&mut publisher).await[2], true);

    let frame = recv_json_within(&mut subscriber, Duration::from_secs(1)).await;
    assert_eq!(frame[0], "EVENT");
    assert_eq!(frame[1], "s");
    assert_eq!(frame[2]["id"].as_str().unwrap(), hex::encode(event.id));
}

#[tokio::test]
async fn ephemeral_events_fan_out_without_persisting() {
    let (addr, state) = start_relay(vec![], AclMode::None).await;

    let mut subscriber = connect(addr).await;
    send_json(&mut subscriber, json!(["REQ", "live", {}])).await;
    assert_eq!(recv_json(&mut subscriber).await[0], "EOSE");

    let mut publisher = connect(addr).await;
    let event = sign_event(
        &key(11),
        chrono::Utc::now().timestamp(),
        20_001,
        vec![],
        "now you see me".to_string(),
    );
    send_json(&mut publisher, json!(["EVENT", &event])).await;
    assert_eq!(recv_json(&mut publisher).await[2], true);

    let frame = recv_json_within(&mut subscriber, Duration::from_secs(1)).await;
    assert_eq!(frame[0], "EVENT");
    assert_eq!(frame[2]["id"].as_str().unwrap(), hex::encode(event.id));

    // Never persisted
    assert!(state.store.serial_of(&event.id).unwrap().is_none());
}

#[tokio::test]
async fn auth_with_wrong_challenge_is_rejected() {
    let admin_sk = key(12);
    let (addr, _state) = start_relay(vec![pubkey_of(&admin_sk)], AclMode::Follows).await;
    let mut ws = connect(addr).await;
    assert_eq!(recv_json(&mut ws).await[0], "AUTH");

    let bad_auth = sign_event(
        &admin_sk,
        chrono::Utc::now().timestamp(),
        KIND_CLIENT_AUTH,
        vec![
            vec!["relay".to_string(), format!("ws://{addr}")],
            vec!["challenge".to_string(), "not the nonce".to_string()],
        ],
        String::new(),
    );
    send_json(&mut ws, json!(["AUTH", &bad_auth])).await;
    let ok = recv_json(&mut ws).await;
    assert_eq!(ok[0], "OK");
    assert_eq!(ok[2], false);
    assert!(ok[3].as_str().unwrap().starts_with("invalid:"));

    // Still unauthenticated: a REQ is refused
    send_json(&mut ws, json!(["REQ", "s", {}])).await;
    let closed = recv_json(&mut ws).await;
    assert_eq!(closed[0], "CLOSED");
    assert!(closed[2].as_str().unwrap().starts_with("auth-required:"));
}

#[tokio::test]
async fn ids_only_subscription_terminates() {
    let (addr, _state) = start_relay(vec![], AclMode::None).await;
    let mut ws = connect(addr).await;

    let event = note(8, 1_700_000_000, "addressed by id");
    send_json(&mut ws, json!(["EVENT", &event])).await;
    assert_eq!(recv_json(&mut ws).await[2], true);

    send_json(
        &mut ws,
        json!(["REQ", "by-id", {"ids": [hex::encode(event.id)]}]),
    )
    .await;
    let event_frame = recv_json(&mut ws).await;
    assert_eq!(event_frame[0], "EVENT");
    assert_eq!(recv_json(&mut ws).await[0], "EOSE");
    let closed = recv_json(&mut ws).await;
    assert_eq!(closed[0], "CLOSED");
    assert_eq!(closed[1], "by-id");
}

#[tokio::test]
async fn malformed_envelope_yields_notice_and_connection_survives() {
    let (addr, _state) = start_relay(vec![], AclMode::None).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, json!({"not": "an envelope"})).await;
    let notice = recv_json(&mut ws).await;
    assert_eq!(notice[0], "NOTICE");
    assert!(notice[1].as_str().unwrap().starts_with("invalid:"));

    // Still usable afterwards
    let event = note(9, 1_700_000_000, "still here");
    send_json(&mut ws, json!(["EVENT", &event])).await;
    assert_eq!(recv_json(&mut ws).await[2], true);
}

#[tokio::test]
async fn invalid_signature_is_rejected() {
    let (addr, _state) = start_relay(vec![], AclMode::None).await;
    let mut ws = connect(addr).await;

    let mut event = note(10, 1_700_000_000, "tampered");
    event.content = "altered".to_string();
    send_json(&mut ws, json!(["EVENT", &event])).await;
    let ok = recv_json(&mut ws).await;
    assert_eq!(ok[2], false);
    assert!(ok[3].as_str().unwrap().starts_with("invalid:"));
}

#[tokio::test]
async fn http_surface_serves_info_and_health() {
    let (addr, state) = start_relay(vec![], AclMode::None).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{addr}/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let info: Value = client
        .get(format!("http://{addr}/"))
        .header("accept", "application/nostr+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["software"], "lorelay");
    assert_eq!(
        info["pubkey"].as_str().unwrap(),
        state.identity.pubkey_hex()
    );
    assert_eq!(info["limitation"]["auth_required"], false);
}
