//! Canonical event serialization and id computation.
//!
//! The canonical form is the minimized JSON array
//! `[0, pubkey_hex, created_at, kind, tags, content]` with a fixed escape
//! set: only `\n`, `\"`, `\\`, `\r`, `\t`, `\b` and `\f` are escaped and all
//! other bytes pass through as raw UTF-8. serde_json escapes additional
//! control characters, so the writer here is built by hand to keep ids
//! stable across implementations.

use sha2::{Digest, Sha256};

use super::{Event, Id};

/// Serialize an event into its canonical byte form.
pub fn canonical(event: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + event.content.len());
    out.extend_from_slice(b"[0,\"");
    out.extend_from_slice(hex::encode(event.pubkey).as_bytes());
    out.extend_from_slice(b"\",");
    out.extend_from_slice(event.created_at.to_string().as_bytes());
    out.push(b',');
    out.extend_from_slice(event.kind.to_string().as_bytes());
    out.push(b',');
    out.push(b'[');
    for (i, tag) in event.tags.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.push(b'[');
        for (j, item) in tag.iter().enumerate() {
            if j > 0 {
                out.push(b',');
            }
            push_escaped(&mut out, item);
        }
        out.push(b']');
    }
    out.push(b']');
    out.push(b',');
    push_escaped(&mut out, &event.content);
    out.push(b']');
    out
}

/// SHA-256 of the canonical serialization.
pub fn id_of(event: &Event) -> Id {
    let mut hasher = Sha256::new();
    hasher.update(canonical(event));
    hasher.finalize().into()
}

fn push_escaped(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{0008}' => out.extend_from_slice(b"\\b"),
            '\u{000c}' => out.extend_from_slice(b"\\f"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}
