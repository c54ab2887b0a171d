use serde::{Deserialize, Serialize};
use std::fmt;

/// Node kind as encoded in the `t` field of a listing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeType {
    File,
    Directory,
    /// Cloud drive root
    Root,
    Inbox,
    Trash,
}

impl NodeType {
    /// Only files and directories carry a wrapped key.
    pub fn has_key(self) -> bool {
        matches!(self, NodeType::File | NodeType::Directory)
    }
}

impl TryFrom<u8> for NodeType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(NodeType::File),
            1 => Ok(NodeType::Directory),
            2 => Ok(NodeType::Root),
            3 => Ok(NodeType::Inbox),
            4 => Ok(NodeType::Trash),
            other => Err(format!("unknown node type {other}")),
        }
    }
}

impl From<NodeType> for u8 {
    fn from(t: NodeType) -> u8 {
        match t {
            NodeType::File => 0,
            NodeType::Directory => 1,
            NodeType::Root => 2,
            NodeType::Inbox => 3,
            NodeType::Trash => 4,
        }
    }
}

/// Server-assigned node identifier (8 base64url chars on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(pub String);

/// Account identifier (11 base64url chars on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserHandle(pub String);

impl NodeHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl UserHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for UserHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
