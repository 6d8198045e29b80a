//! Record types stored by the persistence layer.
//!
//! Timestamps are unix nanoseconds throughout.

use std::fmt;

use serde::{Deserialize, Serialize};

use mixnet_common::NodeId;

/// Network status of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Registered but not currently participating (offline too long or
    /// administratively disabled).
    Inactive,
    /// Normal operation.
    Active,
    /// Removed from the network by operator action.
    Banned,
    /// Missed every poll in the last metric interval; excluded from the
    /// advertised NDF while pruning is enabled.
    Stale,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Inactive => "Inactive",
            Status::Active => "Active",
            Status::Banned => "Banned",
            Status::Stale => "Stale",
        };
        write!(f, "{}", s)
    }
}

/// Operator-facing application record; each application owns one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Application {
    pub id: u64,
    pub name: String,
    pub url: String,
    pub location: String,
    /// Geographic bin of the node's location.
    pub geo_bin: String,
    pub gps_location: String,
    pub team: String,
    pub network: String,
}

/// A registered (or pre-provisioned) node row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// One-time registration code; primary key.
    pub code: String,
    /// Ordering tag used by the simple team composer.
    pub sequence: String,
    /// Node identifier; absent until the node registers.
    pub id: Option<NodeId>,
    /// Salt the node id was generated from.
    pub salt: Vec<u8>,
    pub server_address: String,
    pub gateway_address: String,
    /// Node TLS certificate, PEM.
    pub node_certificate: String,
    /// Gateway TLS certificate, PEM.
    pub gateway_certificate: String,
    /// Hex-encoded Ed25519 key the node signs round errors with.
    pub public_key: String,
    pub date_registered: u64,
    pub status: Status,
    pub application_id: u64,
}

impl Node {
    /// A pre-provisioned row holding only a registration code and
    /// ordering tag, awaiting `register_node`.
    pub fn unregistered(code: &str, sequence: &str, application_id: u64) -> Self {
        Node {
            code: code.to_string(),
            sequence: sequence.to_string(),
            id: None,
            salt: Vec::new(),
            server_address: String::new(),
            gateway_address: String::new(),
            node_certificate: String::new(),
            gateway_certificate: String::new(),
            public_key: String::new(),
            date_registered: 0,
            status: Status::Inactive,
            application_id,
        }
    }
}

/// Per-node poll counts over one metric interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetric {
    pub node_id: NodeId,
    pub start_time: u64,
    pub end_time: u64,
    pub num_pings: u64,
}

/// Timing summary of one finished round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMetric {
    pub id: u64,
    pub precomp_start: u64,
    pub precomp_end: u64,
    pub realtime_start: u64,
    pub realtime_end: u64,
    pub round_end: u64,
    pub batch_size: u32,
}

/// An error recorded against a failed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundErrorRecord {
    pub round_id: u64,
    pub error: String,
}

/// Country-to-bin mapping row for geographic team composition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoBin {
    pub country: String,
    pub bin: u8,
}
