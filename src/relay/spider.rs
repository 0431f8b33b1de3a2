//! Outbound federation: spider content authored by the follow set.
//!
//! Peer relays come from the admins' relay-list events; the follow set is
//! the admins plus everyone their follow lists name. Each refresh period
//! the spider dials every peer, subscribes for the follow set over a
//! lookback window and offers verified events to the store. The first run
//! covers a month and is guarded by a persistent marker; later runs cover
//! twice the refresh period to tolerate jitter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::event::filter::Filter;
use crate::event::verify::verify;
use crate::event::{
    parse_hex32, Event, Pubkey, KIND_CLIENT_AUTH, KIND_FOLLOW_LIST, KIND_RELAY_LIST,
};
use crate::store::{query, SaveOutcome};

use super::RelayState;

pub const INITIAL_SYNC_MARKER: &str = "spider-initial-sync-done";

const INITIAL_LOOKBACK: Duration = Duration::from_secs(30 * 24 * 3600);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(600);
const SUB_ID: &str = "spider";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
enum SpiderError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Background task: periodically pull the follow set from peer relays.
pub async fn run(state: Arc<RelayState>) {
    let refresh = state.cfg.spider_refresh;
    info!(refresh_secs = refresh.as_secs(), "spider started");
    let mut backoff: HashMap<String, (u32, Instant)> = HashMap::new();

    loop {
        let authors = follow_set(&state);
        let relays = relay_urls(&state);
        if authors.is_empty() || relays.is_empty() {
            debug!("spider idle: no follow set or no peer relays");
        } else {
            let initial_done = matches!(state.store.get_marker(INITIAL_SYNC_MARKER), Ok(Some(_)));
            let lookback = if initial_done {
                refresh * 2
            } else {
                INITIAL_LOOKBACK
            };
            let since = chrono::Utc::now().timestamp() - lookback.as_secs() as i64;

            let mut any_success = false;
            for url in &relays {
                if let Some((fails, next_try)) = backoff.get(url) {
                    if Instant::now() < *next_try {
                        debug!(url = %url, fails, "spider backing off");
                        continue;
                    }
                }
                match pull(&state, url, &authors, since).await {
                    Ok(count) => {
                        any_success = true;
                        backoff.remove(url);
                        info!(url = %url, count, "spider pull complete");
                    }
                    Err(e) => {
                        let fails = backoff.get(url).map(|(f, _)| f + 1).unwrap_or(1);
                        let delay =
                            (BACKOFF_BASE * 2u32.saturating_pow(fails - 1)).min(BACKOFF_CAP);
                        backoff.insert(url.clone(), (fails, Instant::now() + delay));
                        warn!(url = %url, error = %e, fails, "spider pull failed");
                    }
                }
            }
            if any_success && !initial_done {
                if let Err(e) = state.store.set_marker(INITIAL_SYNC_MARKER, b"1") {
                    warn!(error = %e, "could not persist initial sync marker");
                }
            }
        }
        sleep(refresh).await;
    }
}

/// Admins plus every pubkey named in their follow lists.
pub(crate) fn follow_set(state: &RelayState) -> Vec<Pubkey> {
    let mut set: HashSet<Pubkey> = state.cfg.admins.iter().copied().collect();
    let filter = Filter {
        authors: state.cfg.admins.clone(),
        kinds: vec![KIND_FOLLOW_LIST],
        ..Default::default()
    };
    match query::execute(&state.store, &filter) {
        Ok(results) => {
            for (_, event) in results {
                for value in event.tag_values("p") {
                    if let Ok(pubkey) = parse_hex32(value) {
                        set.insert(pubkey);
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "follow set query failed"),
    }
    let mut out: Vec<Pubkey> = set.into_iter().collect();
    out.sort();
    out
}

/// Peer relay URLs from the admins' relay-list events.
pub(crate) fn relay_urls(state: &RelayState) -> Vec<String> {
    let own = state.cfg.canonical_url();
    let filter = Filter {
        authors: state.cfg.admins.clone(),
        kinds: vec![KIND_RELAY_LIST],
        ..Default::default()
    };
    let mut set = HashSet::new();
    match query::execute(&state.store, &filter) {
        Ok(results) => {
            for (_, event) in results {
                for value in event.tag_values("r") {
                    let url = value.trim().trim_end_matches('/').to_string();
                    if (url.starts_with("ws://") || url.starts_with("wss://")) && url != own {
                        set.insert(url);
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "relay list query failed"),
    }
    let mut out: Vec<String> = set.into_iter().collect();
    out.sort();
    out
}

/// Dial one peer, subscribe for the follow set since `since` and ingest
/// until end-of-stored-events.
async fn pull(
    state: &Arc<RelayState>,
    url: &str,
    authors: &[Pubkey],
    since: i64,
) -> Result<usize, SpiderError> {
    let (mut ws, _response) = timeout(DIAL_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| SpiderError::Timeout("dial"))??;
    let filter = Filter {
        authors: authors.to_vec(),
        since: Some(since),
        ..Default::default()
    };
    send_req(&mut ws, &filter).await?;

    let mut count = 0usize;
    loop {
        let message = match timeout(IDLE_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => break,
            // A peer that stalls before EOSE still yields what it sent
            Err(_) => break,
        };
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => continue,
        };
        match value.get(0).and_then(Value::as_str) {
            Some("EVENT") => {
                let raw = value.get(2).cloned().unwrap_or(Value::Null);
                let Ok(event) = serde_json::from_value::<Event>(raw) else {
                    continue;
                };
                if verify(&event).is_err() {
                    debug!(url, "spider dropped unverifiable event");
                    continue;
                }
                if !authors.contains(&event.pubkey) {
                    continue;
                }
                match state.store.save(&event) {
                    Ok(SaveOutcome::Stored { .. }) | Ok(SaveOutcome::Replaced { .. }) => {
                        count += 1;
                        if state.admit_tx.send(event).await.is_err() {
                            warn!("publisher admission channel closed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(url, error = %e, "spider store failed"),
                }
            }
            Some("EOSE") => break,
            Some("AUTH") => {
                if let Some(challenge) = value.get(1).and_then(Value::as_str) {
                    authenticate(state, &mut ws, url, challenge).await?;
                    send_req(&mut ws, &filter).await?;
                }
            }
            Some("CLOSED") => {
                debug!(url, frame = %text, "spider subscription closed by peer");
                break;
            }
            Some("NOTICE") => debug!(url, frame = %text, "peer notice"),
            _ => {}
        }
    }
    let _ = ws.close(None).await;
    Ok(count)
}

async fn send_req(ws: &mut Ws, filter: &Filter) -> Result<(), SpiderError> {
    let frame = json!(["REQ", SUB_ID, filter]).to_string();
    ws.send(Message::Text(frame.into())).await?;
    Ok(())
}

/// Answer a peer's AUTH challenge with a kind-22242 event signed by the
/// relay identity.
async fn authenticate(
    state: &Arc<RelayState>,
    ws: &mut Ws,
    url: &str,
    challenge: &str,
) -> Result<(), SpiderError> {
    let auth = state.identity.sign(
        chrono::Utc::now().timestamp(),
        KIND_CLIENT_AUTH,
        vec![
            vec!["relay".to_string(), url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        String::new(),
    );
    let frame = json!(["AUTH", auth]).to_string();
    ws.send(Message::Text(frame.into())).await?;
    Ok(())
}
