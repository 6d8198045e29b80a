//! Wire types exchanged with nodes and end users.
//!
//! The transport that carries these (and its authentication) lives
//! outside this crate; here they are plain serde structs. Anything the
//! scheduler signs uses a deterministic length-prefixed byte encoding so
//! signatures are stable across serialization changes.

use serde::{Deserialize, Serialize};

use mixnet_common::crypto;
use mixnet_common::round::NUM_PHASES;
use mixnet_common::{Activity, NodeId, RoundPhase};

use crate::error::RegistrarError;
use crate::ndf::SignedNdf;

/// Serde helper: byte vectors as hex strings.
pub(crate) mod hex_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}

/// One heartbeat poll from a mix node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissioningPoll {
    pub activity: Activity,
    /// Highest update id the node has observed.
    #[serde(default)]
    pub last_update: u64,
    /// Hex hash of the full NDF the node currently holds.
    #[serde(default)]
    pub full_ndf_hash: String,
    /// The node's advertised server address; empty to keep the
    /// registered one.
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub gateway_address: String,
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub gateway_version: String,
    /// Signed round error, present only when reporting ERROR.
    #[serde(default)]
    pub error: Option<RoundError>,
    /// Client-reported errors to attach to the node's current round.
    #[serde(default)]
    pub client_errors: Vec<ClientError>,
}

/// Response to a node poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionPollResponse {
    /// Present only when the caller's NDF hash is stale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_ndf: Option<SignedNdf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_ndf: Option<SignedNdf>,
    /// Every update with id greater than the caller's `last_update`.
    pub updates: Vec<RoundInfo>,
}

/// A signed snapshot of a round, published into the update log on every
/// phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub id: u64,
    /// Strictly monotonic, gap-free log position; assigned by the log.
    pub update_id: u64,
    pub phase: RoundPhase,
    pub batch_size: u32,
    pub topology: Vec<NodeId>,
    /// Unix-nano timestamp per phase, indexed by [`RoundPhase::index`].
    pub timestamps: [u64; NUM_PHASES],
    pub errors: Vec<RoundError>,
    #[serde(with = "hex_bytes", default)]
    pub signature: Vec<u8>,
}

impl RoundInfo {
    /// Deterministic bytes the scheduler signs. Excludes the signature
    /// itself and the signatures inside attached errors (those carry
    /// their own).
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(128);
        buffer.extend_from_slice(&self.id.to_be_bytes());
        buffer.extend_from_slice(&self.update_id.to_be_bytes());
        buffer.push(self.phase.index() as u8);
        buffer.extend_from_slice(&self.batch_size.to_be_bytes());
        buffer.extend_from_slice(&(self.topology.len() as u32).to_be_bytes());
        for id in &self.topology {
            buffer.extend_from_slice(id.as_bytes());
        }
        for ts in &self.timestamps {
            buffer.extend_from_slice(&ts.to_be_bytes());
        }
        buffer.extend_from_slice(&(self.errors.len() as u32).to_be_bytes());
        for err in &self.errors {
            buffer.extend_from_slice(&err.signing_bytes());
        }
        buffer
    }
}

/// An error raised against a round, signed by whoever reported it (a
/// team member, or the scheduler itself for timeouts and bans).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundError {
    /// Round the error is associated with; zero when unassociated.
    pub round_id: u64,
    /// Identity of the reporter.
    pub node_id: NodeId,
    pub error: String,
    #[serde(with = "hex_bytes", default)]
    pub signature: Vec<u8>,
}

impl RoundError {
    /// Build and sign an error in one step.
    pub fn signed(
        round_id: u64,
        node_id: NodeId,
        error: impl Into<String>,
        key: &ed25519_dalek::SigningKey,
    ) -> Self {
        let mut round_error = RoundError {
            round_id,
            node_id,
            error: error.into(),
            signature: Vec::new(),
        };
        round_error.signature = crypto::sign(key, &round_error.signing_bytes());
        round_error
    }

    /// Deterministic bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(64 + self.error.len());
        buffer.extend_from_slice(&self.round_id.to_be_bytes());
        buffer.extend_from_slice(self.node_id.as_bytes());
        buffer.extend_from_slice(&(self.error.len() as u32).to_be_bytes());
        buffer.extend_from_slice(self.error.as_bytes());
        buffer
    }

    /// Verify the signature against the reporter's public key.
    pub fn verify(&self, public_key: &[u8]) -> Result<bool, RegistrarError> {
        Ok(crypto::verify(
            public_key,
            &self.signing_bytes(),
            &self.signature,
        )?)
    }
}

/// An end-client error attached to a round by a team member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientError {
    pub client_id: String,
    pub error: String,
}
