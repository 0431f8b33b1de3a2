//! Relay identity: the secret key used to sign relay-authored events,
//! persisted in the store under a well-known marker.

use secp256k1::SecretKey;
use tracing::info;

use crate::event::verify::{pubkey_of, sign_event};
use crate::event::{Event, Pubkey};
use crate::store::{Store, StoreError};

const IDENTITY_MARKER: &str = "identity-key";

/// The relay's own signing identity.
#[derive(Clone)]
pub struct RelayIdentity {
    secret: SecretKey,
    pub pubkey: Pubkey,
}

impl RelayIdentity {
    /// Load the identity key from the store, generating and persisting a
    /// fresh one on first run.
    pub fn load_or_create(store: &Store) -> Result<Self, StoreError> {
        let secret = match store.get_marker(IDENTITY_MARKER)? {
            Some(bytes) => SecretKey::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("bad identity key: {e}")))?,
            None => {
                let secret = SecretKey::new(&mut rand::thread_rng());
                store.set_marker(IDENTITY_MARKER, &secret.secret_bytes())?;
                info!("generated fresh relay identity");
                secret
            }
        };
        let pubkey = pubkey_of(&secret);
        Ok(RelayIdentity { secret, pubkey })
    }

    /// Sign an event authored by the relay.
    pub fn sign(&self, created_at: i64, kind: u16, tags: Vec<Vec<String>>, content: String) -> Event {
        sign_event(&self.secret, created_at, kind, tags, content)
    }

    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.pubkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::verify::verify;

    #[test]
    fn test_identity_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = {
            let store = Store::open(dir.path()).unwrap();
            RelayIdentity::load_or_create(&store).unwrap().pubkey
        };
        let second = {
            let store = Store::open(dir.path()).unwrap();
            RelayIdentity::load_or_create(&store).unwrap().pubkey
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_identity_signs_valid_events() {
        let store = Store::builder().temp(true).build().unwrap();
        let identity = RelayIdentity::load_or_create(&store).unwrap();
        let event = identity.sign(1_700_000_000, 1, vec![], "relay says hi".into());
        assert_eq!(event.pubkey, identity.pubkey);
        assert!(verify(&event).is_ok());
    }
}
