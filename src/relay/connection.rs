//! Per-connection protocol engine.
//!
//! One reader loop per accepted socket pulls frames and dispatches
//! envelopes; a writer task serializes outbound frames from a bounded
//! queue. Parse errors produce a NOTICE and the connection continues;
//! write errors are terminal.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::acl::Role;
use crate::event::envelope::{ClientEnvelope, RelayEnvelope};
use crate::event::filter::Filter;
use crate::event::verify::verify;
use crate::event::{is_ephemeral, Event, Id, Pubkey, KIND_CLIENT_AUTH, KIND_DELETION};
use crate::store::{query, SaveOutcome, Serial};

use super::publisher::ConnId;
use super::RelayState;

/// Items queued for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Ping,
}

/// Outbound queue depth; a subscriber that falls this far behind is cut.
pub const OUTBOUND_QUEUE: usize = 512;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for handing a frame to the writer; a client that cannot drain
/// its queue within this window is cut.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepted clock skew on kind-22242 auth responses, in seconds.
const AUTH_WINDOW: i64 = 600;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Drive one accepted WebSocket until the peer disconnects or misbehaves.
pub async fn serve(socket: WebSocket, remote: SocketAddr, state: Arc<RelayState>) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let kill = Arc::new(Notify::new());
    state.publisher.attach(conn_id, out_tx.clone(), kill.clone());

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let mut conn = Connection {
        conn_id,
        state: state.clone(),
        out: out_tx,
        authed: None,
        challenge: fresh_challenge(),
    };
    debug!(conn_id, %remote, "connection open");

    // Challenge issuance at accept is policy driven: only an ACL mode that
    // gates on identity sends an unsolicited AUTH.
    if state.acl.requires_auth() {
        let _ = conn.challenge_frame().await;
    }

    read_loop(&mut conn, stream, kill).await;

    state.publisher.drop_connection(conn_id);
    writer.abort();
    debug!(conn_id, %remote, "connection closed");
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        let message = match item {
            Outbound::Frame(text) => Message::Text(text),
            Outbound::Ping => Message::Ping(Vec::new()),
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn read_loop(conn: &mut Connection, mut stream: SplitStream<WebSocket>, kill: Arc<Notify>) {
    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // the first tick completes immediately
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = kill.notified() => {
                debug!(conn_id = conn.conn_id, "connection killed by publisher");
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    if conn.handle_frame(&text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(Message::Binary(_))) => {
                    last_seen = Instant::now();
                    if conn.notice("invalid: binary frames are not supported").await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > PONG_TIMEOUT {
                    warn!(conn_id = conn.conn_id, "pong deadline missed");
                    break;
                }
                if conn.out.try_send(Outbound::Ping).is_err() {
                    break;
                }
            }
        }
    }
}

struct Connection {
    conn_id: ConnId,
    state: Arc<RelayState>,
    out: mpsc::Sender<Outbound>,
    authed: Option<Pubkey>,
    challenge: String,
}

/// The peer is gone; unwinds the read loop.
struct Hangup;

impl Connection {
    async fn send(&self, envelope: RelayEnvelope) -> Result<(), Hangup> {
        let queued = tokio::time::timeout(
            SEND_TIMEOUT,
            self.out.send(Outbound::Frame(envelope.to_frame())),
        )
        .await;
        match queued {
            Ok(Ok(())) => Ok(()),
            _ => Err(Hangup),
        }
    }

    async fn notice(&self, message: &str) -> Result<(), Hangup> {
        self.send(RelayEnvelope::Notice {
            message: message.to_string(),
        })
        .await
    }

    async fn ok(&self, id: Id, accepted: bool, reason: impl Into<String>) -> Result<(), Hangup> {
        self.send(RelayEnvelope::Ok {
            id,
            accepted,
            reason: reason.into(),
        })
        .await
    }

    async fn challenge_frame(&self) -> Result<(), Hangup> {
        self.send(RelayEnvelope::Auth {
            challenge: self.challenge.clone(),
        })
        .await
    }

    async fn handle_frame(&mut self, text: &str) -> Result<(), Hangup> {
        let envelope = match ClientEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => return self.notice(&format!("invalid: {e}")).await,
        };
        match envelope {
            ClientEnvelope::Event(event) => self.on_event(*event).await,
            ClientEnvelope::Req { sub_id, filters } => self.on_req(sub_id, filters).await,
            ClientEnvelope::Close { sub_id } => {
                self.state.publisher.unregister(self.conn_id, &sub_id);
                Ok(())
            }
            ClientEnvelope::Auth(event) => self.on_auth(*event).await,
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<(), Hangup> {
        if let Err(e) = verify(&event) {
            return self.ok(event.id, false, format!("invalid: {e}")).await;
        }

        let role = self.state.acl.access_level(self.authed.as_ref());
        if role < Role::Write {
            self.ok(
                event.id,
                false,
                "auth-required: publishing events requires an authenticated identity",
            )
            .await?;
            return self.challenge_frame().await;
        }

        if is_ephemeral(event.kind) {
            self.admit(event.clone()).await;
            return self.ok(event.id, true, "").await;
        }

        if event.kind == KIND_DELETION {
            match self.state.store.serial_of(&event.id) {
                Ok(Some(_)) => {
                    return self
                        .ok(event.id, false, "duplicate: already have this event")
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "deletion duplicate check failed");
                    return self.ok(event.id, false, format!("error: {e}")).await;
                }
            }
            match self
                .state
                .store
                .process_deletion(&event, role == Role::Admin)
            {
                Ok(0) => {
                    return self
                        .ok(
                            event.id,
                            false,
                            "blocked: cannot delete events that belong to other users",
                        )
                        .await;
                }
                Ok(removed) => {
                    debug!(conn_id = self.conn_id, removed, "deletion applied");
                }
                Err(e) => {
                    error!(error = %e, "deletion failed");
                    return self.ok(event.id, false, format!("error: {e}")).await;
                }
            }
        }

        match self.state.store.save(&event) {
            Ok(SaveOutcome::Stored { .. }) | Ok(SaveOutcome::Replaced { .. }) => {
                if let Err(e) = self.state.acl.ingest(&event, &self.state.store) {
                    warn!(error = %e, "acl ingest failed");
                }
                self.admit(event.clone()).await;
                self.ok(event.id, true, "").await
            }
            Ok(SaveOutcome::Duplicate) => {
                self.ok(event.id, false, "duplicate: already have this event")
                    .await
            }
            Ok(SaveOutcome::Deleted) => self.ok(event.id, false, "blocked: deleted").await,
            Err(e) => {
                error!(error = %e, "save failed");
                self.ok(event.id, false, format!("error: {e}")).await
            }
        }
    }

    async fn on_req(&mut self, sub_id: String, filters: Vec<Filter>) -> Result<(), Hangup> {
        let role = self.state.acl.access_level(self.authed.as_ref());
        if role == Role::None {
            self.send(RelayEnvelope::Closed {
                sub_id,
                reason: "auth-required: queries require an authenticated identity".into(),
            })
            .await?;
            return self.challenge_frame().await;
        }

        let mut merged: Vec<(Serial, Event)> = Vec::new();
        let mut seen: HashSet<Serial> = HashSet::new();
        let mut live_filters = Vec::new();
        for filter in &filters {
            let results = match query::execute(&self.state.store, filter) {
                Ok(results) => results,
                Err(e) => {
                    error!(error = %e, "query failed");
                    return self
                        .send(RelayEnvelope::Closed {
                            sub_id,
                            reason: format!("error: {e}"),
                        })
                        .await;
                }
            };
            let terminal = (filter.ids_only() && results.len() == filter.ids.len())
                || filter.limit.is_some_and(|limit| results.len() >= limit);
            if !terminal {
                live_filters.push(filter.clone());
            }
            for (serial, event) in results {
                if seen.insert(serial) {
                    merged.push((serial, event));
                }
            }
        }
        merged.sort_by(|a, b| (b.1.created_at, b.0).cmp(&(a.1.created_at, a.0)));

        for (_, event) in merged {
            if !self.state.acl.can_view(&event, self.authed.as_ref()) {
                continue;
            }
            self.send(RelayEnvelope::Event {
                sub_id: sub_id.clone(),
                event: Box::new(event),
            })
            .await?;
        }
        self.send(RelayEnvelope::Eose {
            sub_id: sub_id.clone(),
        })
        .await?;

        if live_filters.is_empty() {
            // Every filter was terminal; no live phase, and any earlier
            // subscription under this id is gone
            self.state.publisher.unregister(self.conn_id, &sub_id);
            self.send(RelayEnvelope::Closed {
                sub_id,
                reason: String::new(),
            })
            .await
        } else if self
            .state
            .publisher
            .register(self.conn_id, sub_id.clone(), live_filters)
        {
            Ok(())
        } else {
            self.send(RelayEnvelope::Closed {
                sub_id,
                reason: "restricted: too many subscriptions".into(),
            })
            .await
        }
    }

    async fn on_auth(&mut self, event: Event) -> Result<(), Hangup> {
        if let Err(e) = verify(&event) {
            return self.ok(event.id, false, format!("invalid: {e}")).await;
        }
        if event.kind != KIND_CLIENT_AUTH {
            return self
                .ok(event.id, false, "invalid: auth response must be kind 22242")
                .await;
        }
        let now = chrono::Utc::now().timestamp();
        if (now - event.created_at).abs() > AUTH_WINDOW {
            return self
                .ok(event.id, false, "invalid: auth event timestamp out of range")
                .await;
        }
        if event.first_tag_value("challenge") != Some(self.challenge.as_str()) {
            return self.ok(event.id, false, "invalid: challenge mismatch").await;
        }
        let relay_matches = event
            .first_tag_value("relay")
            .map(|url| urls_match(url, &self.state.cfg.canonical_url()))
            .unwrap_or(false);
        if !relay_matches {
            return self.ok(event.id, false, "invalid: relay url mismatch").await;
        }

        self.authed = Some(event.pubkey);
        self.state.publisher.set_authed(self.conn_id, event.pubkey);
        info!(
            conn_id = self.conn_id,
            pubkey = %hex::encode(event.pubkey),
            "authenticated"
        );
        self.ok(event.id, true, "").await
    }

    async fn admit(&self, event: Event) {
        if self.state.admit_tx.send(event).await.is_err() {
            warn!("publisher admission channel closed");
        }
    }
}

fn fresh_challenge() -> String {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    hex::encode(nonce)
}

/// Compare relay URLs ignoring scheme, case and trailing slash.
fn urls_match(a: &str, b: &str) -> bool {
    normalize_url(a) == normalize_url(b)
}

fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_scheme = ["wss://", "ws://", "https://", "http://"]
        .iter()
        .find_map(|scheme| {
            let lower = trimmed.to_ascii_lowercase();
            lower
                .starts_with(scheme)
                .then(|| trimmed[scheme.len()..].to_string())
        })
        .unwrap_or_else(|| trimmed.to_string());
    without_scheme.trim_end_matches('/').to_ascii_lowercase()
}
