//! The waiting pool: nodes in WAITING that may be drafted into a team.
//!
//! The pool is the scheduler's only source of round participants. It is
//! partitioned into an online and an offline subset; only online nodes
//! are eligible for team formation. Drafted nodes leave the pool and
//! re-enter it when they next report WAITING.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::index::sample;
use rand::thread_rng;

use mixnet_common::NodeId;

use crate::error::RegistrarError;
use crate::now_nanos;
use crate::state::node::NodeState;

#[derive(Default)]
struct PoolInner {
    online: HashMap<NodeId, Arc<NodeState>>,
    offline: HashMap<NodeId, Arc<NodeState>>,
}

/// The set of WAITING nodes eligible for team composition.
#[derive(Default)]
pub struct WaitingPool {
    inner: Mutex<PoolInner>,
}

impl WaitingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a node into the online subset.
    pub fn add(&self, node: Arc<NodeState>) {
        let mut inner = self.inner.lock();
        inner.offline.remove(&node.id());
        inner.online.insert(node.id(), node);
    }

    /// Move a node to the offline subset (not eligible for teams).
    pub fn set_offline(&self, node: Arc<NodeState>) {
        let mut inner = self.inner.lock();
        inner.online.remove(&node.id());
        inner.offline.insert(node.id(), node);
    }

    /// Move a node back to the online subset.
    pub fn set_online(&self, node: Arc<NodeState>) {
        self.add(node);
    }

    /// Remove a node from both subsets.
    pub fn ban(&self, id: &NodeId) {
        let mut inner = self.inner.lock();
        inner.online.remove(id);
        inner.offline.remove(id);
    }

    /// Drop offline nodes whose last poll is older than `older_than`.
    pub fn clean_offline(&self, older_than: Duration) {
        let cutoff = now_nanos().saturating_sub(older_than.as_nanos() as u64);
        self.inner
            .lock()
            .offline
            .retain(|_, node| node.last_poll() >= cutoff);
    }

    /// Draw `n` distinct nodes uniformly at random, provided the online
    /// subset holds at least `threshold` nodes. Picked nodes leave the
    /// pool.
    pub fn pick_n_rand_at_threshold(
        &self,
        n: usize,
        threshold: usize,
    ) -> Result<Vec<Arc<NodeState>>, RegistrarError> {
        let mut inner = self.inner.lock();
        let have = inner.online.len();
        if have < threshold || n > have {
            return Err(RegistrarError::PoolInsufficient {
                have,
                need: threshold.max(n),
            });
        }

        let ids: Vec<NodeId> = inner.online.keys().copied().collect();
        let mut rng = thread_rng();
        // The lock is held throughout, so every sampled id is present.
        let picked: Vec<Arc<NodeState>> = sample(&mut rng, ids.len(), n)
            .into_iter()
            .filter_map(|i| inner.online.remove(&ids[i]))
            .collect();
        Ok(picked)
    }

    pub fn online_len(&self) -> usize {
        self.inner.lock().online.len()
    }

    pub fn offline_len(&self) -> usize {
        self.inner.lock().offline.len()
    }

    pub fn contains_online(&self, id: &NodeId) -> bool {
        self.inner.lock().online.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(b: u8) -> NodeId {
        NodeId::new([b; 32])
    }

    fn node(b: u8) -> Arc<NodeState> {
        let n = Arc::new(NodeState::new(
            nid(b),
            b as u64,
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            Vec::new(),
            "0".to_string(),
        ));
        n.stamp_last_poll(now_nanos());
        n
    }

    #[test]
    fn test_add_and_pick() {
        let pool = WaitingPool::new();
        for b in 1..=5 {
            pool.add(node(b));
        }
        assert_eq!(pool.online_len(), 5);

        let picked = pool.pick_n_rand_at_threshold(3, 3).expect("pick");
        assert_eq!(picked.len(), 3);
        // Picked nodes are distinct and removed from the pool.
        let mut ids: Vec<NodeId> = picked.iter().map(|n| n.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.online_len(), 2);
    }

    #[test]
    fn test_pick_below_threshold_fails() {
        let pool = WaitingPool::new();
        pool.add(node(1));
        pool.add(node(2));
        let result = pool.pick_n_rand_at_threshold(2, 3);
        assert!(matches!(
            result,
            Err(RegistrarError::PoolInsufficient { have: 2, need: 3 })
        ));
        // Nothing consumed on failure.
        assert_eq!(pool.online_len(), 2);
    }

    #[test]
    fn test_offline_nodes_not_picked() {
        let pool = WaitingPool::new();
        let a = node(1);
        let b = node(2);
        pool.add(a.clone());
        pool.add(b);
        pool.set_offline(a.clone());
        assert_eq!(pool.online_len(), 1);
        assert_eq!(pool.offline_len(), 1);
        assert!(pool.pick_n_rand_at_threshold(2, 2).is_err());

        pool.set_online(a);
        assert_eq!(pool.online_len(), 2);
        assert!(pool.pick_n_rand_at_threshold(2, 2).is_ok());
    }

    #[test]
    fn test_ban_removes_from_both_subsets() {
        let pool = WaitingPool::new();
        let a = node(1);
        pool.add(a.clone());
        pool.ban(&a.id());
        assert_eq!(pool.online_len(), 0);

        pool.add(a.clone());
        pool.set_offline(a.clone());
        pool.ban(&a.id());
        assert_eq!(pool.offline_len(), 0);
    }

    #[test]
    fn test_clean_offline_drops_stale_nodes() {
        let pool = WaitingPool::new();
        let fresh = node(1);
        let stale = node(2);
        stale.stamp_last_poll(now_nanos() - Duration::from_secs(600).as_nanos() as u64);
        pool.set_offline(fresh);
        pool.set_offline(stale);

        pool.clean_offline(Duration::from_secs(300));
        assert_eq!(pool.offline_len(), 1);
    }
}
