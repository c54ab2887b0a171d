//! Account session context passed to every key-hierarchy operation
//!
//! A `Session` is a plain value. Callers that share one across threads wrap
//! it themselves; nothing here locks.

use std::collections::HashMap;

use mega_core::{NodeHandle, UserHandle};
use secrecy::SecretString;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::MasterKey;
use crate::keys::ShareKey;
use crate::links::{LinkKind, PublicLink};

#[derive(Debug)]
pub struct Session {
    user_handle: Option<UserHandle>,
    master_key: Option<MasterKey>,
    session_id: Option<SecretString>,
    share_keys: HashMap<NodeHandle, ShareKey>,
}

impl Session {
    /// A logged-in account session.
    pub fn new(user_handle: UserHandle, master_key: MasterKey, session_id: SecretString) -> Self {
        Self {
            user_handle: Some(user_handle),
            master_key: Some(master_key),
            session_id: Some(session_id),
            share_keys: HashMap::new(),
        }
    }

    /// An anonymous session browsing a public folder link. Every node key in
    /// the listing is wrapped (directly or through a sub-share) by the link key.
    pub fn for_public_folder(link: &PublicLink) -> CryptoResult<Self> {
        let key = match (link.kind(), link.share_key()) {
            (LinkKind::Folder, Some(key)) => key.clone(),
            _ => {
                return Err(CryptoError::InvalidLink(format!(
                    "{} is not a folder link",
                    link.handle()
                )))
            }
        };

        let mut session = Self::anonymous();
        session.seed_share_key(link.handle().clone(), key);
        Ok(session)
    }

    /// No account and no keys; share keys can still be seeded.
    pub fn anonymous() -> Self {
        Self {
            user_handle: None,
            master_key: None,
            session_id: None,
            share_keys: HashMap::new(),
        }
    }

    pub fn user_handle(&self) -> Option<&UserHandle> {
        self.user_handle.as_ref()
    }

    pub fn master_key(&self) -> Option<&MasterKey> {
        self.master_key.as_ref()
    }

    pub fn session_id(&self) -> Option<&SecretString> {
        self.session_id.as_ref()
    }

    /// Make `key` available for nodes whose key string names `handle`.
    pub fn seed_share_key(&mut self, handle: NodeHandle, key: ShareKey) {
        self.share_keys.insert(handle, key);
    }

    pub fn share_key(&self, handle: &NodeHandle) -> Option<&ShareKey> {
        self.share_keys.get(handle)
    }

    pub fn share_keys(&self) -> impl Iterator<Item = (&NodeHandle, &ShareKey)> {
        self.share_keys.iter()
    }

    /// True when `owner` (the prefix of a node key string) is this account.
    pub fn is_own(&self, owner: &str) -> bool {
        self.user_handle
            .as_ref()
            .is_some_and(|handle| handle.as_str() == owner)
    }
}
