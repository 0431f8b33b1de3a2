//! Live subscription registry and fan-out.
//!
//! The registry maps connections to their subscription filter sets.
//! Mutations take the write lock; delivery takes the read lock and walks
//! every live subscription. A full or closed outbound queue drops the
//! whole connection rather than blocking the fan-out.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

use crate::acl::Acl;
use crate::event::filter::Filter;
use crate::event::{Event, Pubkey};

use super::connection::Outbound;

pub type ConnId = u64;

/// Live subscriptions one connection may hold at a time.
pub const MAX_SUBS_PER_CONN: usize = 64;

struct ConnEntry {
    tx: mpsc::Sender<Outbound>,
    kill: Arc<Notify>,
    authed: Option<Pubkey>,
    subs: HashMap<String, Vec<Filter>>,
}

pub struct Publisher {
    acl: Arc<Acl>,
    conns: RwLock<HashMap<ConnId, ConnEntry>>,
}

impl Publisher {
    pub fn new(acl: Arc<Acl>) -> Self {
        Publisher {
            acl,
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Start the fan-out task; events admitted to the store are queued on
    /// the returned channel and delivered in admission order.
    pub fn start(self: &Arc<Self>) -> mpsc::Sender<Event> {
        let (tx, mut rx) = mpsc::channel::<Event>(1024);
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                publisher.deliver(&event);
            }
        });
        tx
    }

    /// Track a freshly accepted connection.
    pub fn attach(&self, conn_id: ConnId, tx: mpsc::Sender<Outbound>, kill: Arc<Notify>) {
        let mut conns = self.conns.write().expect("publisher lock poisoned");
        conns.insert(
            conn_id,
            ConnEntry {
                tx,
                kill,
                authed: None,
                subs: HashMap::new(),
            },
        );
    }

    /// Record a successful AUTH on the connection.
    pub fn set_authed(&self, conn_id: ConnId, pubkey: Pubkey) {
        let mut conns = self.conns.write().expect("publisher lock poisoned");
        if let Some(entry) = conns.get_mut(&conn_id) {
            entry.authed = Some(pubkey);
        }
    }

    /// Register (or replace) a live subscription. Returns false when the
    /// connection is at its subscription cap (replacements always fit).
    pub fn register(&self, conn_id: ConnId, sub_id: String, filters: Vec<Filter>) -> bool {
        let mut conns = self.conns.write().expect("publisher lock poisoned");
        let Some(entry) = conns.get_mut(&conn_id) else {
            return false;
        };
        if entry.subs.len() >= MAX_SUBS_PER_CONN && !entry.subs.contains_key(&sub_id) {
            return false;
        }
        entry.subs.insert(sub_id, filters);
        true
    }

    /// Forget one subscription; idempotent.
    pub fn unregister(&self, conn_id: ConnId, sub_id: &str) {
        let mut conns = self.conns.write().expect("publisher lock poisoned");
        if let Some(entry) = conns.get_mut(&conn_id) {
            entry.subs.remove(sub_id);
        }
    }

    /// Forget a connection and all of its subscriptions; idempotent.
    pub fn drop_connection(&self, conn_id: ConnId) {
        let mut conns = self.conns.write().expect("publisher lock poisoned");
        conns.remove(&conn_id);
    }

    /// Fan an admitted event out to every matching live subscription.
    pub fn deliver(&self, event: &Event) {
        let event_value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "unserializable event dropped from fan-out");
                return;
            }
        };

        let mut dead = Vec::new();
        {
            let conns = self.conns.read().expect("publisher lock poisoned");
            for (conn_id, entry) in conns.iter() {
                if !self.acl.can_view(event, entry.authed.as_ref()) {
                    continue;
                }
                for (sub_id, filters) in &entry.subs {
                    if !filters.iter().any(|f| f.matches(event)) {
                        continue;
                    }
                    let frame = json!(["EVENT", sub_id, event_value.clone()]).to_string();
                    if entry.tx.try_send(Outbound::Frame(frame)).is_err() {
                        // Slow or gone; drop the whole connection rather
                        // than stall the fan-out.
                        dead.push(*conn_id);
                        break;
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut conns = self.conns.write().expect("publisher lock poisoned");
            for conn_id in dead {
                if let Some(entry) = conns.remove(&conn_id) {
                    entry.kill.notify_one();
                    warn!(conn_id, "dropped slow subscriber");
                }
            }
        }
    }

    /// Number of live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        let conns = self.conns.read().expect("publisher lock poisoned");
        conns.values().map(|entry| entry.subs.len()).sum()
    }
}
