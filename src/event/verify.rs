//! Event id and Schnorr signature verification, plus signing of
//! relay-authored events.

use once_cell::sync::Lazy;
use secp256k1::schnorr::Signature;
use secp256k1::{All, Keypair, Secp256k1, SecretKey, VerifyOnly, XOnlyPublicKey};

use super::{canonical, Event, EventError};

static SECP_VERIFY: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);
static SECP_SIGN: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Verify an event: recompute the id over the canonical form, compare
/// byte-equal against the id field, then check the Schnorr signature of the
/// id against the pubkey.
pub fn verify(event: &Event) -> Result<(), EventError> {
    if canonical::id_of(event) != event.id {
        return Err(EventError::IdMismatch);
    }
    let pubkey = XOnlyPublicKey::from_slice(&event.pubkey)
        .map_err(|e| EventError::Malformed(format!("bad pubkey: {e}")))?;
    let sig = Signature::from_slice(&event.sig)
        .map_err(|e| EventError::Malformed(format!("bad signature encoding: {e}")))?;
    SECP_VERIFY
        .verify_schnorr(&sig, &event.id, &pubkey)
        .map_err(|_| EventError::BadSignature)
}

/// X-only public key bytes for a secret key.
pub fn pubkey_of(secret: &SecretKey) -> crate::event::Pubkey {
    let keypair = Keypair::from_secret_key(&SECP_SIGN, secret);
    keypair.x_only_public_key().0.serialize()
}

/// Build and sign an event with the given secret key. Fills in `pubkey`,
/// `id` and `sig`.
pub fn sign_event(
    secret: &SecretKey,
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
) -> Event {
    let keypair = Keypair::from_secret_key(&SECP_SIGN, secret);
    let (xonly, _parity) = keypair.x_only_public_key();
    let mut event = Event {
        id: [0; 32],
        pubkey: xonly.serialize(),
        created_at,
        kind,
        tags,
        content,
        sig: [0; 64],
    };
    event.id = canonical::id_of(&event);
    let sig = SECP_SIGN.sign_schnorr(&event.id, &keypair);
    event.sig.copy_from_slice(sig.as_ref());
    event
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A deterministic secret key for tests; `seed` must be nonzero.
    pub fn test_key(seed: u8) -> SecretKey {
        SecretKey::from_slice(&[seed; 32]).expect("valid test key")
    }

    /// Shorthand: a signed text note.
    pub fn signed_note(seed: u8, created_at: i64, content: &str) -> Event {
        sign_event(&test_key(seed), created_at, 1, vec![], content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let event = signed_note(7, 1_700_000_000, "verified");
        assert!(verify(&event).is_ok());
    }

    #[test]
    fn test_verify_detects_id_tamper() {
        let mut event = signed_note(7, 1_700_000_000, "original");
        event.content = "tampered".to_string();
        assert!(matches!(verify(&event), Err(EventError::IdMismatch)));
    }

    #[test]
    fn test_verify_detects_sig_tamper() {
        let mut event = signed_note(7, 1_700_000_000, "original");
        event.sig[0] ^= 0x01;
        assert!(matches!(verify(&event), Err(EventError::BadSignature)));
    }

    #[test]
    fn test_verify_detects_wrong_author() {
        let mut event = signed_note(7, 1_700_000_000, "original");
        let other = sign_event(&test_key(9), 1_700_000_000, 1, vec![], "x".into());
        event.pubkey = other.pubkey;
        // pubkey is part of the canonical form, so the id no longer matches
        assert!(verify(&event).is_err());
    }
}
