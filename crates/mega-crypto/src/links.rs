//! Public file and folder links
//!
//! Accepted forms:
//! - `https://mega.nz/file/<handle>#<key>` and `https://mega.nz/folder/<handle>#<key>`
//! - legacy `https://mega.nz/#!<handle>!<key>` and `https://mega.nz/#F!<handle>!<key>`
//!
//! File links carry the 32-byte node key, folder links the 16-byte share key
//! of the linked subtree.

use std::fmt;
use std::str::FromStr;

use mega_core::NodeHandle;

use crate::encoding::{base64url_decode, base64url_encode};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{FileKey, ShareKey};

const LINK_HOST: &str = "mega.nz";
const KNOWN_HOSTS: &[&str] = &["mega.nz", "mega.co.nz", "mega.io"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkKey {
    File(FileKey),
    Folder(ShareKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicLink {
    handle: NodeHandle,
    key: LinkKey,
}

impl PublicLink {
    pub fn file(handle: NodeHandle, key: FileKey) -> Self {
        Self {
            handle,
            key: LinkKey::File(key),
        }
    }

    pub fn folder(handle: NodeHandle, key: ShareKey) -> Self {
        Self {
            handle,
            key: LinkKey::Folder(key),
        }
    }

    pub fn parse(url: &str) -> CryptoResult<Self> {
        let invalid = |why: &str| CryptoError::InvalidLink(format!("{why}: {url}"));

        let trimmed = url.trim();
        let rest = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let (host, path) = rest.split_once('/').ok_or_else(|| invalid("missing path"))?;
        let host = host.strip_prefix("www.").unwrap_or(host);
        if !KNOWN_HOSTS.contains(&host) {
            return Err(invalid("unknown host"));
        }

        let (kind, handle, key) = if let Some(legacy) = path.strip_prefix("#F!") {
            let (handle, key) = legacy.split_once('!').ok_or_else(|| invalid("missing key"))?;
            (LinkKind::Folder, handle, key)
        } else if let Some(legacy) = path.strip_prefix("#!") {
            let (handle, key) = legacy.split_once('!').ok_or_else(|| invalid("missing key"))?;
            (LinkKind::File, handle, key)
        } else if let Some(modern) = path.strip_prefix("file/") {
            let (handle, key) = modern.split_once('#').ok_or_else(|| invalid("missing key"))?;
            (LinkKind::File, handle, key)
        } else if let Some(modern) = path.strip_prefix("folder/") {
            let (handle, key) = modern.split_once('#').ok_or_else(|| invalid("missing key"))?;
            (LinkKind::Folder, handle, key)
        } else {
            return Err(invalid("unrecognised link format"));
        };

        // Folder links may point inside the tree: `<key>/file/<sub>` or `<key>!<sub>`
        let key = key.split(|c: char| c == '/' || c == '!').next().unwrap_or_default();
        if handle.is_empty() || key.is_empty() {
            return Err(invalid("empty handle or key"));
        }

        let raw = base64url_decode(key)?;
        let handle = NodeHandle(handle.to_string());
        Ok(match kind {
            LinkKind::File => Self::file(handle, FileKey::from_slice(&raw)?),
            LinkKind::Folder => Self::folder(handle, ShareKey::from_slice(&raw)?),
        })
    }

    pub fn kind(&self) -> LinkKind {
        match self.key {
            LinkKey::File(_) => LinkKind::File,
            LinkKey::Folder(_) => LinkKind::Folder,
        }
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn file_key(&self) -> Option<&FileKey> {
        match &self.key {
            LinkKey::File(key) => Some(key),
            LinkKey::Folder(_) => None,
        }
    }

    pub fn share_key(&self) -> Option<&ShareKey> {
        match &self.key {
            LinkKey::Folder(key) => Some(key),
            LinkKey::File(_) => None,
        }
    }

    fn encoded_key(&self) -> String {
        match &self.key {
            LinkKey::File(key) => base64url_encode(key.as_bytes()),
            LinkKey::Folder(key) => base64url_encode(key.as_bytes()),
        }
    }

    /// The pre-2020 `#!` / `#F!` form.
    pub fn to_legacy_url(&self) -> String {
        let marker = match self.kind() {
            LinkKind::File => "#!",
            LinkKind::Folder => "#F!",
        };
        format!(
            "https://{LINK_HOST}/{marker}{}!{}",
            self.handle,
            self.encoded_key()
        )
    }
}

impl fmt::Display for PublicLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segment = match self.kind() {
            LinkKind::File => "file",
            LinkKind::Folder => "folder",
        };
        write!(
            f,
            "https://{LINK_HOST}/{segment}/{}#{}",
            self.handle,
            self.encoded_key()
        )
    }
}

impl FromStr for PublicLink {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
