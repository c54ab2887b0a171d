//! Node listing DTOs, key hierarchy resolution and new-node key material
//!
//! A node's `k` field is `owner:wrapped` (several entries joined by `/` when
//! the node is reachable through more than one share). `owner` is either the
//! account's user handle, meaning the key is wrapped with the master key, or
//! the handle of a share root whose share key wraps it. Only the first entry
//! is used.
//!
//! Resolution runs in two passes over one listing: collect every share key,
//! then unwrap each node key. `ok` entries are wrapped with the master key.
//! A share root's `sk` is wrapped with the master key when the account owns
//! it, otherwise with the key of the nearest enclosing share. Failures stay
//! local to the node.

use std::collections::{HashMap, HashSet};
use std::io::Read;

use mega_core::{NodeHandle, NodeType, UserHandle};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::attributes::{decrypt_attributes, encrypt_attributes, Attributes, Fingerprint};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{
    generate_folder_key, unwrap_key_b64, wrap_key_b64, FileKey, FolderKey, NodeKey, ShareKey,
};
use crate::links::PublicLink;
use crate::session::Session;
use crate::stream::{AesCtrStream, StreamMode};
use crate::KEY_SIZE;

/// One entry of the listing's `f` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    #[serde(rename = "h")]
    pub handle: NodeHandle,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeHandle>,
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<UserHandle>,
    #[serde(rename = "t")]
    pub node_type: NodeType,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<String>,
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    /// Share key of a share root, wrapped with the master key or an
    /// enclosing share's key
    #[serde(rename = "sk", default, skip_serializing_if = "Option::is_none")]
    pub share_key: Option<String>,
}

/// One entry of the listing's `ok` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawShareKey {
    #[serde(rename = "h")]
    pub handle: NodeHandle,
    /// Share key wrapped with the master key
    #[serde(rename = "k")]
    pub key: String,
    /// Authentication hash of the share key (not verified here)
    #[serde(rename = "ha", default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// The listing response body (`f` nodes and `ok` share keys)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeListing {
    #[serde(rename = "f", default)]
    pub nodes: Vec<RawNode>,
    #[serde(rename = "ok", default)]
    pub share_keys: Vec<RawShareKey>,
}

/// A listed node with its keys resolved where possible
#[derive(Debug, Clone)]
pub struct Node {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub owner: Option<UserHandle>,
    pub node_type: NodeType,
    pub size: u64,
    pub created: Option<i64>,
    /// `None` when the node has no key or its key could not be resolved
    pub attributes: Option<Attributes>,
    key: Option<NodeKey>,
    share_key: Option<ShareKey>,
}

impl Node {
    pub fn name(&self) -> Option<&str> {
        self.attributes.as_ref().map(|a| a.name.as_str())
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.attributes.as_ref().and_then(|a| a.fingerprint.as_ref())
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn node_key(&self) -> CryptoResult<&NodeKey> {
        self.key.as_ref().ok_or_else(|| self.key_access("node key"))
    }

    pub fn file_key(&self) -> CryptoResult<&FileKey> {
        match &self.key {
            Some(NodeKey::File(key)) => Ok(key),
            _ => Err(self.key_access("file key")),
        }
    }

    pub fn folder_key(&self) -> CryptoResult<&FolderKey> {
        match &self.key {
            Some(NodeKey::Folder(key)) => Ok(key),
            _ => Err(self.key_access("folder key")),
        }
    }

    /// Set on share roots: the key wrapping every node key below it.
    pub fn share_key(&self) -> Option<&ShareKey> {
        self.share_key.as_ref()
    }

    /// Decrypting stream over this file's downloaded content.
    pub fn decrypter<R: Read>(&self, source: R) -> CryptoResult<AesCtrStream<R>> {
        let key = self.file_key()?;
        Ok(AesCtrStream::for_file_key(source, self.size, key))
    }

    /// Public link material: the node key for files, the share key for folders.
    pub fn public_link(&self) -> CryptoResult<PublicLink> {
        match (&self.key, &self.share_key) {
            (Some(NodeKey::File(key)), _) => Ok(PublicLink::file(self.handle.clone(), key.clone())),
            (Some(NodeKey::Folder(_)), Some(share)) => {
                Ok(PublicLink::folder(self.handle.clone(), share.clone()))
            }
            (Some(NodeKey::Folder(_)), None) => Err(self.key_access("share key")),
            (None, _) => Err(self.key_access("node key")),
        }
    }

    fn key_access(&self, capability: &'static str) -> CryptoError {
        CryptoError::KeyAccess {
            handle: self.handle.to_string(),
            capability,
        }
    }
}

/// Resolve every node of `listing` against `session`.
///
/// Never fails as a whole: a node whose key cannot be unwrapped keeps
/// `None` keys and attributes, and accessing them reports
/// [`CryptoError::KeyAccess`].
pub fn resolve_nodes(session: &Session, listing: &NodeListing) -> Vec<Node> {
    let shares = collect_share_keys(session, listing);

    let nodes: Vec<Node> = listing
        .nodes
        .iter()
        .map(|raw| resolve_node(session, &shares, raw))
        .collect();

    debug!(
        nodes = nodes.len(),
        shares = shares.len(),
        unresolved = nodes
            .iter()
            .filter(|n| n.node_type.has_key() && !n.has_key())
            .count(),
        "resolved node listing"
    );
    nodes
}

fn collect_share_keys(session: &Session, listing: &NodeListing) -> HashMap<NodeHandle, ShareKey> {
    let mut shares: HashMap<NodeHandle, ShareKey> = session
        .share_keys()
        .map(|(handle, key)| (handle.clone(), key.clone()))
        .collect();

    if let Some(master) = session.master_key() {
        for ok in &listing.share_keys {
            if !shares.contains_key(&ok.handle) {
                if let Some(key) = unwrap_share_key(&ok.handle, master.as_bytes(), &ok.key) {
                    shares.insert(ok.handle.clone(), key);
                }
            }
        }
    }

    let parents: HashMap<&NodeHandle, &NodeHandle> = listing
        .nodes
        .iter()
        .filter_map(|node| node.parent.as_ref().map(|parent| (&node.handle, parent)))
        .collect();
    let share_roots: HashSet<&NodeHandle> = listing
        .nodes
        .iter()
        .filter(|node| node.share_key.is_some())
        .map(|node| &node.handle)
        .collect();
    let mut pending: Vec<&RawNode> = listing
        .nodes
        .iter()
        .filter(|node| node.share_key.is_some() && !shares.contains_key(&node.handle))
        .collect();

    // A sub-share may wait on an enclosing sub-share listed after it.
    loop {
        let before = pending.len();
        pending.retain(|node| {
            let Some(wrapping) = sk_wrapping_key(session, &shares, &parents, &share_roots, node)
            else {
                return true;
            };
            let wrapped = node.share_key.as_deref().unwrap_or_default();
            if let Some(key) = unwrap_share_key(&node.handle, &wrapping, wrapped) {
                shares.insert(node.handle.clone(), key);
            }
            false
        });
        if pending.len() == before {
            break;
        }
    }

    for node in pending {
        warn!(handle = %node.handle, "no key available to unwrap share key");
    }
    shares
}

/// Key wrapping a node's `sk`: the master key for the account's own shares,
/// otherwise the share key of the nearest enclosing share root.
///
/// `None` while that enclosing share is still unresolved.
fn sk_wrapping_key(
    session: &Session,
    shares: &HashMap<NodeHandle, ShareKey>,
    parents: &HashMap<&NodeHandle, &NodeHandle>,
    share_roots: &HashSet<&NodeHandle>,
    node: &RawNode,
) -> Option<Zeroizing<[u8; KEY_SIZE]>> {
    if let Some(master) = session.master_key() {
        let own = node
            .owner
            .as_ref()
            .map_or(true, |owner| session.is_own(owner.as_str()));
        if own {
            return Some(Zeroizing::new(*master.as_bytes()));
        }
    }

    let mut current = node.parent.as_ref();
    // Bounded walk: a malformed listing may contain a parent cycle.
    for _ in 0..=parents.len() {
        let handle = current?;
        if let Some(share) = shares.get(handle) {
            return Some(Zeroizing::new(*share.as_bytes()));
        }
        if share_roots.contains(handle) {
            return None;
        }
        current = parents.get(handle).copied();
    }
    None
}

fn unwrap_share_key(
    handle: &NodeHandle,
    wrapping: &[u8; KEY_SIZE],
    wrapped: &str,
) -> Option<ShareKey> {
    match unwrap_key_b64(wrapping, wrapped).and_then(|raw| ShareKey::from_slice(&raw)) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(%handle, error = %e, "could not unwrap share key");
            None
        }
    }
}

fn resolve_node(session: &Session, shares: &HashMap<NodeHandle, ShareKey>, raw: &RawNode) -> Node {
    let key = match (&raw.key, raw.node_type.has_key()) {
        (Some(key_string), true) => {
            match resolve_node_key(session, shares, &raw.handle, raw.node_type, key_string) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(handle = %raw.handle, error = %e, "node key unavailable");
                    None
                }
            }
        }
        _ => None,
    };

    let attributes = match (&key, &raw.attributes) {
        (Some(key), Some(blob)) => Some(decrypt_attributes(blob, &key.aes_key())),
        _ => None,
    };

    Node {
        handle: raw.handle.clone(),
        parent: raw.parent.clone(),
        owner: raw.owner.clone(),
        node_type: raw.node_type,
        size: raw.size.unwrap_or(0),
        created: raw.created,
        attributes,
        key,
        share_key: shares.get(&raw.handle).cloned(),
    }
}

/// Unwrap one node key string (`owner:wrapped[/owner:wrapped...]`).
pub fn resolve_node_key(
    session: &Session,
    shares: &HashMap<NodeHandle, ShareKey>,
    handle: &NodeHandle,
    node_type: NodeType,
    key_string: &str,
) -> CryptoResult<NodeKey> {
    let entry = key_string.split('/').next().unwrap_or_default();
    let (owner, wrapped) = entry
        .split_once(':')
        .ok_or_else(|| CryptoError::Encoding(format!("malformed key string on node {handle}")))?;

    let wrapping: &[u8; KEY_SIZE] = match shares.get(&NodeHandle(owner.to_string())) {
        Some(share) => share.as_bytes(),
        None => match session.master_key() {
            Some(master) if session.is_own(owner) => master.as_bytes(),
            _ => {
                return Err(CryptoError::UnresolvedShareKey {
                    handle: handle.to_string(),
                    share: owner.to_string(),
                })
            }
        },
    };

    let raw = Zeroizing::new(unwrap_key_b64(wrapping, wrapped)?);
    match node_type {
        NodeType::File => Ok(NodeKey::File(FileKey::from_slice(&raw)?)),
        NodeType::Directory => Ok(NodeKey::Folder(FolderKey::from_slice(&raw)?)),
        _ => Err(CryptoError::Unsupported("only files and directories carry keys")),
    }
}

/// Key material for the node-creation request that completes an upload
#[derive(Debug, Clone)]
pub struct NewFileNode {
    pub key: FileKey,
    /// `k`: the 32-byte file key wrapped with the target key, base64url
    pub wrapped_key: String,
    /// `a`: encrypted attributes, base64url
    pub attributes: String,
}

impl NewFileNode {
    /// Build from an encrypting stream that has been read to the end.
    ///
    /// `wrapping` is the master key, or the share key when uploading into a
    /// shared folder.
    pub fn from_finished_upload<R: Read>(
        stream: &AesCtrStream<R>,
        attributes: &Attributes,
        wrapping: &[u8; KEY_SIZE],
    ) -> CryptoResult<Self> {
        if stream.mode() != StreamMode::Encrypt {
            return Err(CryptoError::Unsupported(
                "node keys come from encrypting streams",
            ));
        }
        let key = stream
            .node_key()
            .ok_or(CryptoError::StreamNotFinished {
                position: stream.position(),
                length: stream.length(),
            })?;

        Ok(Self {
            attributes: encrypt_attributes(attributes, &key.aes_key())?,
            wrapped_key: wrap_key_b64(wrapping, key.as_bytes())?,
            key,
        })
    }
}

/// Key material for creating a directory
#[derive(Debug, Clone)]
pub struct NewFolderNode {
    pub key: FolderKey,
    pub wrapped_key: String,
    pub attributes: String,
}

impl NewFolderNode {
    /// A fresh random folder key, with `name` encrypted under it.
    pub fn generate(name: &str, wrapping: &[u8; KEY_SIZE]) -> CryptoResult<Self> {
        let key = generate_folder_key();
        Ok(Self {
            attributes: encrypt_attributes(&Attributes::new(name), key.as_bytes())?,
            wrapped_key: wrap_key_b64(wrapping, key.as_bytes())?,
            key,
        })
    }
}
