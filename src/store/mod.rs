//! Embedded event store over a single LMDB keyspace.
//!
//! Every save writes the event row and all of its secondary index entries
//! in one write transaction; deletes remove them in one transaction. The
//! store never retries internally; callers decide.

pub mod keys;
pub mod query;
pub mod words;

use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{
    is_param_replaceable, is_replaceable, parse_hex32, Event, Id, KIND_DELETION,
};

/// Internal monotonically increasing event identifier, 40 bits wide.
pub type Serial = u64;

/// Largest serial the 5-byte index suffix can carry.
pub const MAX_SERIAL: Serial = (1 << 40) - 1;

const SERIAL_MARKER: &str = "serial";
const DEFAULT_MAP_SIZE: usize = 16 * 1024 * 1024 * 1024;

/// Error types for the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Env(#[from] heed::Error),

    #[error("corrupt event row: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no event with serial {0}")]
    NotFound(Serial),

    #[error("serial space exhausted")]
    SerialSpaceExhausted,

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Outcome of [`Store::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Event persisted under a fresh serial.
    Stored { serial: Serial },
    /// Event persisted, superseding an older replaceable-class row.
    Replaced { serial: Serial, old_serial: Serial },
    /// Id already present, or a replaceable-class shadow is newer or equal.
    Duplicate,
    /// Id was removed by a deletion event; replays are refused.
    Deleted,
}

pub struct StoreBuilder {
    path: Option<PathBuf>,
    temp: bool,
    map_size: usize,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            temp: false,
            map_size: DEFAULT_MAP_SIZE,
        }
    }
}

impl StoreBuilder {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Back the store with a temporary directory removed on drop.
    pub fn temp(mut self, temp: bool) -> Self {
        self.temp = temp;
        self
    }

    pub fn map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn build(self) -> Result<Store, StoreError> {
        let (path, tempdir) = if self.temp {
            let dir = TempDir::new()?;
            (dir.path().to_path_buf(), Some(dir))
        } else {
            let path = self
                .path
                .ok_or_else(|| StoreError::Corrupt("store path not configured".into()))?;
            (path, None)
        };
        Store::open_at(&path, self.map_size, tempdir)
    }
}

/// Embedded ordered KV wrapper holding events, index entries and markers.
pub struct Store {
    env: Env,
    db: Database<Bytes, Bytes>,
    serial: AtomicU64,
    _tempdir: Option<TempDir>,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Open (creating if needed) the store under `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::builder().path(path.as_ref()).build()
    }

    fn open_at(path: &Path, map_size: usize, tempdir: Option<TempDir>) -> Result<Self, StoreError> {
        fs::create_dir_all(path)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path)?
        };
        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        let rtxn = env.read_txn()?;
        let next_serial = match db.get(&rtxn, &keys::marker_key(SERIAL_MARKER))? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("bad serial marker width".into()))?;
                u64::from_be_bytes(buf)
            }
            None => 0,
        };
        drop(rtxn);
        debug!(next_serial, path = %path.display(), "store opened");

        Ok(Store {
            env,
            db,
            serial: AtomicU64::new(next_serial),
            _tempdir: tempdir,
        })
    }

    /// Persist an event together with all of its index entries.
    ///
    /// Duplicates are detected via the id index. Replaceable and
    /// parameterized-replaceable kinds atomically delete the superseded row
    /// in the same transaction; an incoming event older than or equal to
    /// the surviving one is reported as [`SaveOutcome::Duplicate`].
    pub fn save(&self, event: &Event) -> Result<SaveOutcome, StoreError> {
        let mut wtxn = self.env.write_txn()?;

        if self.db.get(&wtxn, &keys::tombstone_key(&event.id))?.is_some() {
            return Ok(SaveOutcome::Deleted);
        }
        if self.serial_of_txn(&wtxn, &event.id)?.is_some() {
            return Ok(SaveOutcome::Duplicate);
        }

        let mut old_serial = None;
        if is_replaceable(event.kind) || is_param_replaceable(event.kind) {
            let shadowed = self.replaceable_shadow(&wtxn, event)?;
            for (serial, shadow) in &shadowed {
                if shadow.created_at >= event.created_at {
                    // The surviving copy is newer or equal; reject.
                    return Ok(SaveOutcome::Duplicate);
                }
                old_serial.get_or_insert(*serial);
            }
            for (serial, shadow) in &shadowed {
                self.remove_event_txn(&mut wtxn, *serial, shadow)?;
            }
        }

        let serial = self.next_serial(&mut wtxn)?;
        self.put_event_txn(&mut wtxn, serial, event)?;
        wtxn.commit()?;

        Ok(match old_serial {
            Some(old_serial) => SaveOutcome::Replaced { serial, old_serial },
            None => SaveOutcome::Stored { serial },
        })
    }

    /// Remove the event row and every index entry derived from it.
    pub fn delete_by_serial(&self, serial: Serial) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let event = self.fetch_txn(&wtxn, serial)?;
        self.remove_event_txn(&mut wtxn, serial, &event)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Apply a kind-5 deletion event and return how many events it removed.
    ///
    /// Each removed id is tombstoned so later resubmissions are refused.
    /// The kind-5 event itself is not stored here; callers follow up with
    /// [`Store::save`] so the tombstone can propagate to peers.
    pub fn process_deletion(&self, event: &Event, admin: bool) -> Result<usize, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let mut deleted = 0;

        for value in event.tag_values("e") {
            let id = match parse_hex32(value) {
                Ok(id) => id,
                Err(_) => {
                    debug!(value, "skipping malformed e-tag in deletion");
                    continue;
                }
            };
            let Some((serial, target)) = self.fetch_by_id_txn(&wtxn, &id)? else {
                continue;
            };
            if target.kind == KIND_DELETION {
                // Deletion events are never deleted through e-tags.
                continue;
            }
            if target.pubkey != event.pubkey && !admin {
                continue;
            }
            self.remove_event_txn(&mut wtxn, serial, &target)?;
            self.db.put(&mut wtxn, &keys::tombstone_key(&id), &[])?;
            deleted += 1;
        }

        for value in event.tag_values("a") {
            let mut parts = value.splitn(3, ':');
            let (Some(kind_part), Some(pubkey_part)) = (parts.next(), parts.next()) else {
                continue;
            };
            let d_part = parts.next();
            let Ok(kind) = kind_part.parse::<u16>() else {
                continue;
            };
            let Ok(pubkey) = parse_hex32(pubkey_part) else {
                continue;
            };
            if pubkey != event.pubkey && !admin {
                continue;
            }
            let required_d = if is_param_replaceable(kind) {
                match d_part {
                    Some(d) => Some(d),
                    None => {
                        warn!(coordinate = value, "a-tag without d value for parameterized kind");
                        continue;
                    }
                }
            } else if is_replaceable(kind) {
                None
            } else {
                // Coordinates only address replaceable classes.
                continue;
            };

            let (lo, hi) = keys::pubkey_kind_range(&pubkey, kind, None, Some(event.created_at));
            let serials = self.collect_serials(&wtxn, &lo, &hi)?;
            for serial in serials {
                let target = self.fetch_txn(&wtxn, serial)?;
                if let Some(d) = required_d {
                    if target.d_tag() != Some(d) {
                        continue;
                    }
                }
                self.remove_event_txn(&mut wtxn, serial, &target)?;
                self.db
                    .put(&mut wtxn, &keys::tombstone_key(&target.id), &[])?;
                deleted += 1;
            }
        }

        wtxn.commit()?;
        Ok(deleted)
    }

    /// Retrieve the event stored under `serial`.
    pub fn fetch(&self, serial: Serial) -> Result<Event, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.fetch_txn(&rtxn, serial)
    }

    /// Serial of the event with the given id, if stored.
    pub fn serial_of(&self, id: &Id) -> Result<Option<Serial>, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.serial_of_txn(&rtxn, id)
    }

    /// Fetch an event by id together with its serial.
    pub fn fetch_by_id(&self, id: &Id) -> Result<Option<(Serial, Event)>, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.fetch_by_id_txn(&rtxn, id)
    }

    /// True when the id was removed by a deletion event.
    pub fn is_tombstoned(&self, id: &Id) -> Result<bool, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, &keys::tombstone_key(id))?.is_some())
    }

    /// Collect the keys inside the half-open range `[lo, hi)`, newest last
    /// or, with `reverse`, newest first.
    pub fn scan(&self, lo: &[u8], hi: &[u8], reverse: bool) -> Result<Vec<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let range = (Bound::Included(lo), Bound::Excluded(hi));
        let mut out = Vec::new();
        if reverse {
            for item in self.db.rev_range(&rtxn, &range)? {
                let (key, _) = item?;
                out.push(key.to_vec());
            }
        } else {
            for item in self.db.range(&rtxn, &range)? {
                let (key, _) = item?;
                out.push(key.to_vec());
            }
        }
        Ok(out)
    }

    /// Read a named marker.
    pub fn get_marker(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .db
            .get(&rtxn, &keys::marker_key(name))?
            .map(<[u8]>::to_vec))
    }

    /// Write a named marker.
    pub fn set_marker(&self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, &keys::marker_key(name), value)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Allocate a fresh serial outside of a save. Monotonic across restarts.
    pub fn allocate_serial(&self) -> Result<Serial, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let serial = self.next_serial(&mut wtxn)?;
        wtxn.commit()?;
        Ok(serial)
    }

    // ------------------------------------------------------------------
    // Transaction-scoped internals
    // ------------------------------------------------------------------

    fn next_serial(&self, wtxn: &mut RwTxn) -> Result<Serial, StoreError> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        if serial > MAX_SERIAL {
            return Err(StoreError::SerialSpaceExhausted);
        }
        self.db.put(
            wtxn,
            &keys::marker_key(SERIAL_MARKER),
            &(serial + 1).to_be_bytes(),
        )?;
        Ok(serial)
    }

    fn fetch_txn(&self, txn: &RoTxn, serial: Serial) -> Result<Event, StoreError> {
        let raw = self
            .db
            .get(txn, &keys::event_key(serial))?
            .ok_or(StoreError::NotFound(serial))?;
        Ok(serde_json::from_slice(raw)?)
    }

    fn serial_of_txn(&self, txn: &RoTxn, id: &Id) -> Result<Option<Serial>, StoreError> {
        let (lo, hi) = keys::id_range(id);
        let range = (Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice()));
        let mut iter = self.db.range(txn, &range)?;
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(keys::serial_from_suffix(key)))
            }
            None => Ok(None),
        }
    }

    fn fetch_by_id_txn(
        &self,
        txn: &RoTxn,
        id: &Id,
    ) -> Result<Option<(Serial, Event)>, StoreError> {
        match self.serial_of_txn(txn, id)? {
            Some(serial) => Ok(Some((serial, self.fetch_txn(txn, serial)?))),
            None => Ok(None),
        }
    }

    pub(crate) fn collect_serials(
        &self,
        txn: &RoTxn,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Vec<Serial>, StoreError> {
        let range = (Bound::Included(lo), Bound::Excluded(hi));
        let mut out = Vec::new();
        for item in self.db.range(txn, &range)? {
            let (key, _) = item?;
            out.push(keys::serial_from_suffix(key));
        }
        Ok(out)
    }

    /// Rows of the replaceable class the event belongs to, i.e. same
    /// (pubkey, kind) and, for parameterized kinds, same d-tag value.
    fn replaceable_shadow(
        &self,
        txn: &RoTxn,
        event: &Event,
    ) -> Result<Vec<(Serial, Event)>, StoreError> {
        let (lo, hi) = keys::pubkey_kind_range(&event.pubkey, event.kind, None, None);
        let serials = self.collect_serials(txn, &lo, &hi)?;
        let mut out = Vec::new();
        for serial in serials {
            let existing = self.fetch_txn(txn, serial)?;
            if is_param_replaceable(event.kind)
                && existing.d_tag().unwrap_or("") != event.d_tag().unwrap_or("")
            {
                continue;
            }
            out.push((serial, existing));
        }
        Ok(out)
    }

    fn put_event_txn(
        &self,
        wtxn: &mut RwTxn,
        serial: Serial,
        event: &Event,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(event)?;
        self.db.put(wtxn, &keys::event_key(serial), &raw)?;
        for key in index_keys(serial, event) {
            self.db.put(wtxn, &key, &[])?;
        }
        Ok(())
    }

    fn remove_event_txn(
        &self,
        wtxn: &mut RwTxn,
        serial: Serial,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.db.delete(wtxn, &keys::event_key(serial))?;
        for key in index_keys(serial, event) {
            self.db.delete(wtxn, &key)?;
        }
        Ok(())
    }
}

/// Every secondary index key derived from an event.
fn index_keys(serial: Serial, event: &Event) -> Vec<Vec<u8>> {
    let ts = event.created_at;
    let mut out = vec![
        keys::id_key(&event.id, serial).to_vec(),
        keys::created_key(ts, serial).to_vec(),
        keys::pubkey_key(&event.pubkey, ts, serial).to_vec(),
        keys::pubkey_kind_key(&event.pubkey, event.kind, ts, serial).to_vec(),
        keys::kind_key(event.kind, ts, serial).to_vec(),
    ];
    for tag in &event.tags {
        if tag.len() >= 2 && tag[0].len() == 1 {
            out.push(keys::tag_key(tag[0].as_bytes()[0], &tag[1], ts, serial).to_vec());
        }
    }
    for token in words::event_tokens(event) {
        out.push(keys::word_key(&token, ts, serial));
    }
    out
}
