//! The aggregate network state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use tracing::debug;

use mixnet_common::{crypto, NodeId};

use crate::error::RegistrarError;
use crate::ndf::{NdfState, NetworkDefinition};
use crate::state::node::NodeState;
use crate::state::round::{RoundMap, RoundState};
use crate::state::updates::{MonotonicCounter, UpdateLog};
use crate::wire::RoundInfo;

/// Concurrent map of node id to live node state.
///
/// Lookup-or-create is a single atomic operation under the write lock so
/// two concurrent callers can never race a duplicate record into
/// existence.
#[derive(Default)]
pub struct NodeMap {
    inner: RwLock<HashMap<NodeId, Arc<NodeState>>>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<NodeState>> {
        self.inner.read().get(id).cloned()
    }

    /// Insert a freshly registered node; false when the id already exists.
    pub fn insert(&self, node: Arc<NodeState>) -> bool {
        let mut inner = self.inner.write();
        if inner.contains_key(&node.id()) {
            return false;
        }
        inner.insert(node.id(), node);
        true
    }

    /// Atomic lookup-or-create.
    pub fn get_or_create<F>(&self, id: NodeId, create: F) -> Arc<NodeState>
    where
        F: FnOnce() -> NodeState,
    {
        let mut inner = self.inner.write();
        Arc::clone(inner.entry(id).or_insert_with(|| Arc::new(create())))
    }

    pub fn all(&self) -> Vec<Arc<NodeState>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// The authoritative view of the network: every node, every live round,
/// the signed NDF pair, the update log, and the scheduler's signing key.
pub struct NetworkState {
    signing_key: SigningKey,
    nodes: NodeMap,
    rounds: RoundMap,
    ndf: NdfState,
    updates: UpdateLog,
    round_counter: MonotonicCounter,
}

impl NetworkState {
    pub fn new(
        signing_key: SigningKey,
        initial_ndf: NetworkDefinition,
        round_id_path: PathBuf,
        update_id_path: PathBuf,
    ) -> Result<Self, RegistrarError> {
        Ok(NetworkState {
            signing_key,
            nodes: NodeMap::new(),
            rounds: RoundMap::new(),
            ndf: NdfState::new(initial_ndf),
            updates: UpdateLog::new(MonotonicCounter::load(update_id_path)?),
            round_counter: MonotonicCounter::load(round_id_path)?,
        })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// The scheduler's public key, for verifying its signed artifacts.
    pub fn public_key(&self) -> Vec<u8> {
        crypto::public_key_bytes(&self.signing_key)
    }

    pub fn node_map(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn round_map(&self) -> &RoundMap {
        &self.rounds
    }

    pub fn ndf(&self) -> &NdfState {
        &self.ndf
    }

    pub fn update_log(&self) -> &UpdateLog {
        &self.updates
    }

    /// Allocate the next round id (persisted, never reused).
    pub fn next_round_id(&self) -> Result<u64, RegistrarError> {
        self.round_counter.next()
    }

    /// Materialize a round record and insert it into the round map.
    pub fn create_round(
        &self,
        id: u64,
        topology: Vec<NodeId>,
        batch_size: u32,
        now: u64,
    ) -> Arc<RoundState> {
        let round = Arc::new(RoundState::new(id, topology, batch_size, now));
        self.rounds.insert(Arc::clone(&round));
        round
    }

    /// Sign and append a round snapshot to the update log, returning its
    /// update id.
    pub fn add_round_update(&self, info: RoundInfo) -> Result<u64, RegistrarError> {
        debug!(round = info.id, phase = %info.phase, "publishing round update");
        self.updates.add(info, &self.signing_key)
    }

    pub fn get_updates_since(&self, last_seen: u64) -> Vec<RoundInfo> {
        self.updates.get_updates_since(last_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixnet_common::crypto::generate_signing_key;
    use mixnet_common::RoundPhase;
    use tempfile::tempdir;

    fn nid(b: u8) -> NodeId {
        NodeId::new([b; 32])
    }

    fn network(dir: &std::path::Path) -> NetworkState {
        NetworkState::new(
            generate_signing_key(),
            NetworkDefinition::default(),
            dir.join("roundId.txt"),
            dir.join("updateId.txt"),
        )
        .expect("network state")
    }

    #[test]
    fn test_round_ids_monotonic_across_restart() {
        let dir = tempdir().expect("tempdir");
        let first = network(dir.path());
        assert_eq!(first.next_round_id().expect("id"), 1);
        assert_eq!(first.next_round_id().expect("id"), 2);
        drop(first);

        let second = network(dir.path());
        assert_eq!(second.next_round_id().expect("id"), 3);
    }

    #[test]
    fn test_create_round_lands_in_map() {
        let dir = tempdir().expect("tempdir");
        let state = network(dir.path());
        let id = state.next_round_id().expect("id");
        let round = state.create_round(id, vec![nid(1), nid(2)], 32, 0);
        assert_eq!(round.phase(), RoundPhase::Pending);
        assert!(state.round_map().get(id).is_some());
    }

    #[test]
    fn test_add_round_update_assigns_ids() {
        let dir = tempdir().expect("tempdir");
        let state = network(dir.path());
        let round = state.create_round(1, vec![nid(1)], 32, 0);

        let first = state
            .add_round_update(round.build_round_info())
            .expect("update");
        let second = state
            .add_round_update(round.build_round_info())
            .expect("update");
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(state.get_updates_since(0).len(), 2);
        assert_eq!(state.get_updates_since(first).len(), 1);
    }

    #[test]
    fn test_node_map_get_or_create_is_single_entry() {
        let map = NodeMap::new();
        let make = |b: u8| {
            NodeState::new(
                nid(b),
                1,
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                Vec::new(),
                "0".to_string(),
            )
        };
        let a = map.get_or_create(nid(1), || make(1));
        let b = map.get_or_create(nid(1), || make(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);

        assert!(!map.insert(a));
        assert_eq!(map.len(), 1);
    }
}
