//! Opaque 32-byte node identifiers.
//!
//! The final byte of an identifier is a type marker: a node and its
//! gateway share the first 31 bytes and differ only in that marker, so
//! either id can be derived from the other.

use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a node identifier in bytes.
pub const ID_LEN: usize = 32;

/// Type marker for a mix node id.
pub const TYPE_NODE: u8 = 0x02;

/// Type marker for a gateway id.
pub const TYPE_GATEWAY: u8 = 0x01;

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("invalid id length: expected {ID_LEN}, found {0}")]
    InvalidLength(usize),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Opaque identifier for a registered mix node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// The reserved identity the scheduler signs its own round errors with.
    pub const SCHEDULER: NodeId = NodeId([0xFF; ID_LEN]);

    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Parses an id from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeIdError> {
        if bytes.len() != ID_LEN {
            return Err(NodeIdError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(bytes);
        Ok(NodeId(arr))
    }

    /// Parses an id from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, NodeIdError> {
        Self::from_bytes(&hex::decode(s)?)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The gateway identifier paired with this node id.
    pub fn gateway(&self) -> NodeId {
        let mut bytes = self.0;
        bytes[ID_LEN - 1] = TYPE_GATEWAY;
        NodeId(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(D::Error::custom)
    }
}
