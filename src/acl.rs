//! Access control: role resolution from authenticated identity.
//!
//! Policies form a closed set selected by configured tag. The active
//! policy sits behind a reader-writer lock and is swapped wholesale on
//! reconfigure; role lookups take the read side.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::event::filter::Filter;
use crate::event::{is_privileged, Event, Pubkey, KIND_FOLLOW_LIST};
use crate::store::{query, Store, StoreError};

/// Ordered roles; later grants subsume earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    None,
    Read,
    Write,
    Admin,
}

/// Configured policy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AclMode {
    #[default]
    None,
    Follows,
}

impl FromStr for AclMode {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, AclError> {
        match s {
            "none" => Ok(AclMode::None),
            "follows" => Ok(AclMode::Follows),
            other => Err(AclError::UnknownMode(other.to_string())),
        }
    }
}

impl AclMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclMode::None => "none",
            AclMode::Follows => "follows",
        }
    }
}

/// Error types for access control.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("unknown acl mode {0:?}")]
    UnknownMode(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capability set every policy provides.
pub trait AccessPolicy: Send + Sync {
    /// Policy tag, matching the configuration enum.
    fn kind(&self) -> &'static str;

    /// Recompute derived state (e.g. follow tables) from the store.
    fn configure(&self, store: &Store) -> Result<(), AclError>;

    /// Role of the given identity; `None` identity means unauthenticated.
    fn access_level(&self, pubkey: Option<&Pubkey>) -> Role;
}

/// Mode `none`: every party, identified or not, may write.
struct OpenPolicy;

impl AccessPolicy for OpenPolicy {
    fn kind(&self) -> &'static str {
        "none"
    }

    fn configure(&self, _store: &Store) -> Result<(), AclError> {
        Ok(())
    }

    fn access_level(&self, _pubkey: Option<&Pubkey>) -> Role {
        Role::Write
    }
}

/// Mode `follows`: admins have admin; parties in any admin's follow list
/// have write; other authenticated parties read; unauthenticated none.
struct FollowsPolicy {
    admins: Vec<Pubkey>,
    follows: RwLock<HashSet<Pubkey>>,
}

impl AccessPolicy for FollowsPolicy {
    fn kind(&self) -> &'static str {
        "follows"
    }

    fn configure(&self, store: &Store) -> Result<(), AclError> {
        let mut table = HashSet::new();
        let filter = Filter {
            authors: self.admins.clone(),
            kinds: vec![KIND_FOLLOW_LIST],
            ..Default::default()
        };
        for (_, event) in query::execute(store, &filter)? {
            for value in event.tag_values("p") {
                if let Ok(pubkey) = crate::event::parse_hex32(value) {
                    table.insert(pubkey);
                }
            }
        }
        debug!(follows = table.len(), "follow table recomputed");
        let mut follows = self.follows.write().expect("follows lock poisoned");
        *follows = table;
        Ok(())
    }

    fn access_level(&self, pubkey: Option<&Pubkey>) -> Role {
        let Some(pubkey) = pubkey else {
            return Role::None;
        };
        if self.admins.contains(pubkey) {
            return Role::Admin;
        }
        let follows = self.follows.read().expect("follows lock poisoned");
        if follows.contains(pubkey) {
            Role::Write
        } else {
            Role::Read
        }
    }
}

/// The active access policy plus the admin set it was built from.
pub struct Acl {
    admins: Vec<Pubkey>,
    policy: RwLock<Arc<dyn AccessPolicy>>,
}

impl Acl {
    /// Build and configure the policy selected by `mode`.
    pub fn new(mode: AclMode, admins: Vec<Pubkey>, store: &Store) -> Result<Self, AclError> {
        let acl = Acl {
            admins: admins.clone(),
            policy: RwLock::new(make_policy(mode, admins)),
        };
        acl.policy.read().expect("policy lock poisoned").configure(store)?;
        info!(mode = mode.as_str(), "access control configured");
        Ok(acl)
    }

    /// Swap the active policy for a different mode and reconfigure it.
    pub fn reconfigure(&self, mode: AclMode, store: &Store) -> Result<(), AclError> {
        let policy = make_policy(mode, self.admins.clone());
        policy.configure(store)?;
        *self.policy.write().expect("policy lock poisoned") = policy;
        info!(mode = mode.as_str(), "access control reconfigured");
        Ok(())
    }

    /// Role of an identity under the active policy.
    pub fn access_level(&self, pubkey: Option<&Pubkey>) -> Role {
        self.policy
            .read()
            .expect("policy lock poisoned")
            .access_level(pubkey)
    }

    /// Tag of the active policy.
    pub fn mode(&self) -> &'static str {
        self.policy.read().expect("policy lock poisoned").kind()
    }

    /// Whether the active policy gates access on authentication.
    pub fn requires_auth(&self) -> bool {
        self.mode() == "follows"
    }

    pub fn is_admin(&self, pubkey: &Pubkey) -> bool {
        self.admins.contains(pubkey)
    }

    pub fn admins(&self) -> &[Pubkey] {
        &self.admins
    }

    /// React to a newly stored event: a follow list published by an admin
    /// changes the role table.
    pub fn ingest(&self, event: &Event, store: &Store) -> Result<(), AclError> {
        if event.kind == KIND_FOLLOW_LIST && self.admins.contains(&event.pubkey) {
            self.policy
                .read()
                .expect("policy lock poisoned")
                .configure(store)?;
        }
        Ok(())
    }

    /// Privileged-kind read gate: such events are disclosed only to the
    /// author, to parties p-tagged in them, or to an admin.
    pub fn can_view(&self, event: &Event, viewer: Option<&Pubkey>) -> bool {
        if !is_privileged(event.kind) {
            return true;
        }
        let Some(viewer) = viewer else {
            return false;
        };
        if viewer == &event.pubkey || self.is_admin(viewer) {
            return true;
        }
        let viewer_hex = hex::encode(viewer);
        event.tag_values("p").any(|p| p == viewer_hex)
    }
}

fn make_policy(mode: AclMode, admins: Vec<Pubkey>) -> Arc<dyn AccessPolicy> {
    match mode {
        AclMode::None => Arc::new(OpenPolicy),
        AclMode::Follows => Arc::new(FollowsPolicy {
            admins,
            follows: RwLock::new(HashSet::new()),
        }),
    }
}
