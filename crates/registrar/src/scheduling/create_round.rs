//! Team composition: building a round out of the waiting pool.
//!
//! Two composers implement the same seam: the simple composer forms a
//! team as soon as the pool holds a full team and orders it by each
//! node's numeric ordering tag (or a random permutation), the secure
//! composer waits for a larger threshold and always randomizes. Neither
//! mutates global state beyond drawing from (and, on failure, refilling)
//! the pool; publication is the scheduler's job.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;

use mixnet_common::NodeId;

use crate::config::Params;
use crate::error::RegistrarError;
use crate::state::node::NodeState;
use crate::state::pool::WaitingPool;

/// A composed team, not yet published into the network state.
pub struct ProtoRound {
    pub id: u64,
    pub topology: Vec<NodeId>,
    pub batch_size: u32,
    pub node_states: Vec<Arc<NodeState>>,
}

/// The composition seam the scheduler is polymorphic over.
pub trait TeamComposer: Send + Sync {
    /// Pool occupancy required before composition is attempted.
    fn pool_requirement(&self, params: &Params) -> usize;

    /// Draw a team and build its topology.
    fn compose(
        &self,
        params: &Params,
        pool: &WaitingPool,
        round_id: u64,
    ) -> Result<ProtoRound, RegistrarError>;
}

/// Simple composition: a team forms the moment `team_size` nodes wait.
pub struct SimpleComposer;

impl TeamComposer for SimpleComposer {
    fn pool_requirement(&self, params: &Params) -> usize {
        params.team_size as usize
    }

    fn compose(
        &self,
        params: &Params,
        pool: &WaitingPool,
        round_id: u64,
    ) -> Result<ProtoRound, RegistrarError> {
        pool.clean_offline(params.node_cleanup_interval());
        let team_size = params.team_size as usize;
        let nodes = pool.pick_n_rand_at_threshold(team_size, team_size)?;

        let topology = if params.random_ordering {
            random_topology(&nodes)
        } else {
            match ordered_topology(&nodes) {
                Ok(topology) => topology,
                Err(e) => {
                    // Drawn nodes must not be stranded outside the pool.
                    for node in nodes {
                        pool.add(node);
                    }
                    return Err(e);
                }
            }
        };

        Ok(ProtoRound {
            id: round_id,
            topology,
            batch_size: params.batch_size,
            node_states: nodes,
        })
    }
}

/// Secure composition: waits for `threshold` candidates, then randomizes
/// the drawn team.
pub struct SecureComposer;

impl TeamComposer for SecureComposer {
    fn pool_requirement(&self, params: &Params) -> usize {
        params.threshold as usize
    }

    fn compose(
        &self,
        params: &Params,
        pool: &WaitingPool,
        round_id: u64,
    ) -> Result<ProtoRound, RegistrarError> {
        pool.clean_offline(params.node_cleanup_interval());
        let nodes = pool
            .pick_n_rand_at_threshold(params.team_size as usize, params.threshold as usize)?;

        Ok(ProtoRound {
            id: round_id,
            topology: random_topology(&nodes),
            batch_size: params.batch_size,
            node_states: nodes,
        })
    }
}

/// Order the drawn nodes by a Fisher–Yates permutation of `[0..n)`.
fn random_topology(nodes: &[Arc<NodeState>]) -> Vec<NodeId> {
    let mut positions: Vec<usize> = (0..nodes.len()).collect();
    positions.shuffle(&mut thread_rng());

    let mut topology = vec![None; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        topology[positions[i]] = Some(node.id());
    }
    topology.into_iter().flatten().collect()
}

/// Place each node at the position given by its numeric ordering tag.
fn ordered_topology(nodes: &[Arc<NodeState>]) -> Result<Vec<NodeId>, RegistrarError> {
    let mut topology: Vec<Option<NodeId>> = vec![None; nodes.len()];
    for node in nodes {
        let tag = node.ordering();
        let position: usize = tag.parse().map_err(|_| {
            RegistrarError::BadOrdering(format!(
                "could not parse ordering tag '{}' from node {}",
                tag,
                node.id()
            ))
        })?;
        let slot = topology.get_mut(position).ok_or_else(|| {
            RegistrarError::BadOrdering(format!(
                "ordering tag {} of node {} is outside the team",
                position,
                node.id()
            ))
        })?;
        if slot.is_some() {
            return Err(RegistrarError::BadOrdering(format!(
                "ordering tag {} is claimed twice",
                position
            )));
        }
        *slot = Some(node.id());
    }
    Ok(topology.into_iter().flatten().collect())
}
