//! Binary index key construction and parsing.
//!
//! All keys live in one LMDB keyspace partitioned by a leading prefix byte.
//! Time-suffixed keys place the biased big-endian `created_at` before the
//! 5-byte serial so that reverse scans emit events newest first with serial
//! as a deterministic tie-breaker.
//!
//! | Prefix | Layout | Purpose |
//! |---|---|---|
//! | `e` | serial(5) -> event bytes | primary row |
//! | `i` | id(32) serial(5) | lookup/dedupe by id |
//! | `c` | created_at(8) serial(5) | time-ordered scan |
//! | `p` | pubkey(32) created_at(8) serial(5) | author filters |
//! | `q` | pubkey(32) kind(2) created_at(8) serial(5) | author+kind filters |
//! | `k` | kind(2) created_at(8) serial(5) | kind filters |
//! | `t` | tagkey(1) valhash(8) created_at(8) serial(5) | single-letter tags |
//! | `w` | token(<=24) created_at(8) serial(5) | full-text search |
//! | `m` | name | markers |
//! | `x` | id(32) | deletion tombstones |
//!
//! The author and author+kind prefixes are distinct single bytes so that no
//! prefix is a prefix of another; otherwise a scan over one index could
//! stray into entries of the other for adversarially chosen pubkeys.

use sha2::{Digest, Sha256};

use crate::event::{Id, Pubkey};

use super::Serial;

pub const PRE_EVENT: u8 = b'e';
pub const PRE_ID: u8 = b'i';
pub const PRE_CREATED: u8 = b'c';
pub const PRE_PUBKEY: u8 = b'p';
pub const PRE_PUBKEY_KIND: u8 = b'q';
pub const PRE_KIND: u8 = b'k';
pub const PRE_TAG: u8 = b't';
pub const PRE_WORD: u8 = b'w';
pub const PRE_MARKER: u8 = b'm';
pub const PRE_TOMBSTONE: u8 = b'x';

/// Width of the serial suffix in bytes (40-bit serial space).
pub const SERIAL_LEN: usize = 5;

/// Width of the biased created_at segment in bytes.
pub const TS_LEN: usize = 8;

/// Width of the hashed tag value segment in bytes.
pub const TAG_HASH_LEN: usize = 8;

pub const EVENT_KEY_LEN: usize = 1 + SERIAL_LEN;
pub const ID_KEY_LEN: usize = 1 + 32 + SERIAL_LEN;
pub const CREATED_KEY_LEN: usize = 1 + TS_LEN + SERIAL_LEN;
pub const PUBKEY_KEY_LEN: usize = 1 + 32 + TS_LEN + SERIAL_LEN;
pub const PUBKEY_KIND_KEY_LEN: usize = 1 + 32 + 2 + TS_LEN + SERIAL_LEN;
pub const KIND_KEY_LEN: usize = 1 + 2 + TS_LEN + SERIAL_LEN;
pub const TAG_KEY_LEN: usize = 1 + 1 + TAG_HASH_LEN + TS_LEN + SERIAL_LEN;

/// Encode a signed timestamp order-preserving: biasing the sign bit makes
/// lexicographic byte order equal numeric order for the full i64 range.
pub fn ts_bytes(ts: i64) -> [u8; TS_LEN] {
    ((ts as u64) ^ (1 << 63)).to_be_bytes()
}

/// Inverse of [`ts_bytes`].
pub fn ts_from(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; TS_LEN];
    buf.copy_from_slice(&bytes[..TS_LEN]);
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

/// Big-endian 5-byte encoding of a 40-bit serial.
pub fn serial_bytes(serial: Serial) -> [u8; SERIAL_LEN] {
    let b = serial.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

/// Read the serial from the trailing 5 bytes of an index key.
pub fn serial_from_suffix(key: &[u8]) -> Serial {
    let tail = &key[key.len() - SERIAL_LEN..];
    let mut buf = [0u8; 8];
    buf[8 - SERIAL_LEN..].copy_from_slice(tail);
    u64::from_be_bytes(buf)
}

/// First 8 bytes of the SHA-256 of a tag value; keeps tag keys fixed-width
/// regardless of value length.
pub fn tag_value_hash(value: &str) -> [u8; TAG_HASH_LEN] {
    let digest = Sha256::digest(value.as_bytes());
    let mut out = [0u8; TAG_HASH_LEN];
    out.copy_from_slice(&digest[..TAG_HASH_LEN]);
    out
}

pub fn event_key(serial: Serial) -> [u8; EVENT_KEY_LEN] {
    let mut key = [0u8; EVENT_KEY_LEN];
    key[0] = PRE_EVENT;
    key[1..].copy_from_slice(&serial_bytes(serial));
    key
}

pub fn id_key(id: &Id, serial: Serial) -> [u8; ID_KEY_LEN] {
    let mut key = [0u8; ID_KEY_LEN];
    key[0] = PRE_ID;
    key[1..33].copy_from_slice(id);
    key[33..].copy_from_slice(&serial_bytes(serial));
    key
}

pub fn created_key(ts: i64, serial: Serial) -> [u8; CREATED_KEY_LEN] {
    let mut key = [0u8; CREATED_KEY_LEN];
    key[0] = PRE_CREATED;
    key[1..9].copy_from_slice(&ts_bytes(ts));
    key[9..].copy_from_slice(&serial_bytes(serial));
    key
}

pub fn pubkey_key(pubkey: &Pubkey, ts: i64, serial: Serial) -> [u8; PUBKEY_KEY_LEN] {
    let mut key = [0u8; PUBKEY_KEY_LEN];
    key[0] = PRE_PUBKEY;
    key[1..33].copy_from_slice(pubkey);
    key[33..41].copy_from_slice(&ts_bytes(ts));
    key[41..].copy_from_slice(&serial_bytes(serial));
    key
}

pub fn pubkey_kind_key(
    pubkey: &Pubkey,
    kind: u16,
    ts: i64,
    serial: Serial,
) -> [u8; PUBKEY_KIND_KEY_LEN] {
    let mut key = [0u8; PUBKEY_KIND_KEY_LEN];
    key[0] = PRE_PUBKEY_KIND;
    key[1..33].copy_from_slice(pubkey);
    key[33..35].copy_from_slice(&kind.to_be_bytes());
    key[35..43].copy_from_slice(&ts_bytes(ts));
    key[43..].copy_from_slice(&serial_bytes(serial));
    key
}

pub fn kind_key(kind: u16, ts: i64, serial: Serial) -> [u8; KIND_KEY_LEN] {
    let mut key = [0u8; KIND_KEY_LEN];
    key[0] = PRE_KIND;
    key[1..3].copy_from_slice(&kind.to_be_bytes());
    key[3..11].copy_from_slice(&ts_bytes(ts));
    key[11..].copy_from_slice(&serial_bytes(serial));
    key
}

pub fn tag_key(tag: u8, value: &str, ts: i64, serial: Serial) -> [u8; TAG_KEY_LEN] {
    let mut key = [0u8; TAG_KEY_LEN];
    key[0] = PRE_TAG;
    key[1] = tag;
    key[2..10].copy_from_slice(&tag_value_hash(value));
    key[10..18].copy_from_slice(&ts_bytes(ts));
    key[18..].copy_from_slice(&serial_bytes(serial));
    key
}

pub fn word_key(token: &str, ts: i64, serial: Serial) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + token.len() + TS_LEN + SERIAL_LEN);
    key.push(PRE_WORD);
    key.extend_from_slice(token.as_bytes());
    key.extend_from_slice(&ts_bytes(ts));
    key.extend_from_slice(&serial_bytes(serial));
    key
}

pub fn marker_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(PRE_MARKER);
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn tombstone_key(id: &Id) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = PRE_TOMBSTONE;
    key[1..].copy_from_slice(id);
    key
}

/// Half-open `[lo, hi)` range over a time-suffixed index.
///
/// The lower bound pins the serial segment to zero at `since`; the upper
/// bound appends `0xff` padding one byte past the serial width at `until`
/// so the half-open range covers the entire inclusive `until` second.
pub fn time_range(prefix: &[u8], since: Option<i64>, until: Option<i64>) -> (Vec<u8>, Vec<u8>) {
    let mut lo = Vec::with_capacity(prefix.len() + TS_LEN + SERIAL_LEN);
    lo.extend_from_slice(prefix);
    lo.extend_from_slice(&ts_bytes(since.unwrap_or(i64::MIN)));
    lo.extend_from_slice(&[0u8; SERIAL_LEN]);

    let mut hi = Vec::with_capacity(prefix.len() + TS_LEN + SERIAL_LEN + 1);
    hi.extend_from_slice(prefix);
    hi.extend_from_slice(&ts_bytes(until.unwrap_or(i64::MAX)));
    hi.extend_from_slice(&[0xff; SERIAL_LEN + 1]);

    (lo, hi)
}

/// Half-open range covering every id-index entry for one id.
pub fn id_range(id: &Id) -> (Vec<u8>, Vec<u8>) {
    let mut lo = Vec::with_capacity(1 + 32 + SERIAL_LEN);
    lo.push(PRE_ID);
    lo.extend_from_slice(id);
    let mut hi = lo.clone();
    lo.extend_from_slice(&[0u8; SERIAL_LEN]);
    hi.extend_from_slice(&[0xff; SERIAL_LEN + 1]);
    (lo, hi)
}

pub fn created_range(since: Option<i64>, until: Option<i64>) -> (Vec<u8>, Vec<u8>) {
    time_range(&[PRE_CREATED], since, until)
}

pub fn pubkey_range(pubkey: &Pubkey, since: Option<i64>, until: Option<i64>) -> (Vec<u8>, Vec<u8>) {
    let mut prefix = Vec::with_capacity(1 + 32);
    prefix.push(PRE_PUBKEY);
    prefix.extend_from_slice(pubkey);
    time_range(&prefix, since, until)
}

pub fn pubkey_kind_range(
    pubkey: &Pubkey,
    kind: u16,
    since: Option<i64>,
    until: Option<i64>,
) -> (Vec<u8>, Vec<u8>) {
    let mut prefix = Vec::with_capacity(1 + 32 + 2);
    prefix.push(PRE_PUBKEY_KIND);
    prefix.extend_from_slice(pubkey);
    prefix.extend_from_slice(&kind.to_be_bytes());
    time_range(&prefix, since, until)
}

pub fn kind_range(kind: u16, since: Option<i64>, until: Option<i64>) -> (Vec<u8>, Vec<u8>) {
    let mut prefix = Vec::with_capacity(1 + 2);
    prefix.push(PRE_KIND);
    prefix.extend_from_slice(&kind.to_be_bytes());
    time_range(&prefix, since, until)
}

pub fn tag_range(
    tag: u8,
    value: &str,
    since: Option<i64>,
    until: Option<i64>,
) -> (Vec<u8>, Vec<u8>) {
    let mut prefix = Vec::with_capacity(1 + 1 + TAG_HASH_LEN);
    prefix.push(PRE_TAG);
    prefix.push(tag);
    prefix.extend_from_slice(&tag_value_hash(value));
    time_range(&prefix, since, until)
}

pub fn word_range(token: &str, since: Option<i64>, until: Option<i64>) -> (Vec<u8>, Vec<u8>) {
    let mut prefix = Vec::with_capacity(1 + token.len());
    prefix.push(PRE_WORD);
    prefix.extend_from_slice(token.as_bytes());
    time_range(&prefix, since, until)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_bytes_preserves_order() {
        let samples = [i64::MIN, -1_000, -1, 0, 1, 1_700_000_000, i64::MAX];
        for pair in samples.windows(2) {
            assert!(
                ts_bytes(pair[0]) < ts_bytes(pair[1]),
                "ordering broken for {} < {}",
                pair[0],
                pair[1]
            );
        }
        for ts in samples {
            assert_eq!(ts_from(&ts_bytes(ts)), ts);
        }
    }

    #[test]
    fn test_serial_bytes_roundtrip() {
        for serial in [0u64, 1, 255, 65_536, (1 << 40) - 1] {
            let key = event_key(serial);
            assert_eq!(serial_from_suffix(&key), serial);
        }
    }

    #[test]
    fn test_key_lengths() {
        let id = [0x11u8; 32];
        let pk = [0x22u8; 32];
        assert_eq!(event_key(1).len(), EVENT_KEY_LEN);
        assert_eq!(id_key(&id, 1).len(), ID_KEY_LEN);
        assert_eq!(created_key(0, 1).len(), CREATED_KEY_LEN);
        assert_eq!(pubkey_key(&pk, 0, 1).len(), PUBKEY_KEY_LEN);
        assert_eq!(pubkey_kind_key(&pk, 1, 0, 1).len(), PUBKEY_KIND_KEY_LEN);
        assert_eq!(kind_key(1, 0, 1).len(), KIND_KEY_LEN);
        assert_eq!(tag_key(b'e', "value", 0, 1).len(), TAG_KEY_LEN);
    }

    #[test]
    fn test_time_then_serial_ordering() {
        // Newer timestamps order after older ones
        assert!(created_key(100, 9) < created_key(101, 1));
        // Same second: serial breaks the tie in insertion order
        assert!(created_key(100, 1) < created_key(100, 2));

        let pk = [0x22u8; 32];
        assert!(pubkey_key(&pk, 100, 9) < pubkey_key(&pk, 101, 1));
        assert!(pubkey_kind_key(&pk, 7, 100, 9) < pubkey_kind_key(&pk, 7, 101, 1));
    }

    #[test]
    fn test_time_range_covers_until_second() {
        let (lo, hi) = created_range(Some(100), Some(200));
        // Every serial within the window falls inside [lo, hi)
        assert!(lo <= created_key(100, 0).to_vec());
        assert!(created_key(100, 0).to_vec() < hi);
        assert!(created_key(200, (1 << 40) - 1).to_vec() < hi);
        // One second past the window is outside
        assert!(created_key(201, 0).to_vec() >= hi);
        // One second before is outside
        assert!(created_key(99, (1 << 40) - 1).to_vec() < lo);
    }

    #[test]
    fn test_unbounded_range_covers_everything() {
        let (lo, hi) = created_range(None, None);
        assert!(lo <= created_key(i64::MIN, 0).to_vec());
        assert!(created_key(i64::MAX, (1 << 40) - 1).to_vec() < hi);
    }

    #[test]
    fn test_prefixes_do_not_shadow_each_other() {
        // 'p' and 'q' partition author and author+kind entries even when a
        // pubkey starts with the other prefix byte.
        let tricky = [b'q'; 32];
        let (lo, hi) = pubkey_range(&tricky, None, None);
        let qkey = pubkey_kind_key(&tricky, 1, 0, 1);
        assert!(qkey.to_vec() < lo || qkey.to_vec() >= hi);
    }

    #[test]
    fn test_id_range_contains_only_that_id() {
        let id = [0x33u8; 32];
        let (lo, hi) = id_range(&id);
        assert!(lo <= id_key(&id, 0).to_vec());
        assert!(id_key(&id, (1 << 40) - 1).to_vec() < hi);

        let mut other = id;
        other[31] ^= 1;
        let other_key = id_key(&other, 0).to_vec();
        assert!(other_key < lo || other_key >= hi);
    }

    #[test]
    fn test_tag_value_hash_is_stable() {
        assert_eq!(tag_value_hash("abc"), tag_value_hash("abc"));
        assert_ne!(tag_value_hash("abc"), tag_value_hash("abd"));
    }
}
