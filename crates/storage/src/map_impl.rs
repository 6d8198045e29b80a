//! In-memory map backend for the [`Database`](crate::Database) trait.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use mixnet_common::NodeId;

use crate::database::{Database, StorageError};
use crate::models::{
    Application, Node, NodeMetric, RoundErrorRecord, RoundMetric, Status,
};

#[derive(Default)]
struct MapInner {
    applications: HashMap<u64, Application>,
    /// Keyed by registration code.
    nodes: HashMap<String, Node>,
    clients: HashMap<String, u32>,
    users: HashSet<String>,
    node_metrics: Vec<NodeMetric>,
    round_metrics: HashMap<u64, (RoundMetric, Vec<NodeId>)>,
    round_errors: Vec<RoundErrorRecord>,
    states: HashMap<String, String>,
    bins: HashMap<String, u8>,
}

/// In-memory [`Database`] used when no relational backend is configured,
/// and by the whole test suite.
#[derive(Default)]
pub struct MapImpl {
    inner: Mutex<MapInner>,
}

impl MapImpl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the country-to-bin mapping.
    pub fn set_bins(&self, bins: HashMap<String, u8>) {
        self.inner.lock().bins = bins;
    }

    // Inspection accessors for tests and operator tooling.

    pub fn node_metrics(&self) -> Vec<NodeMetric> {
        self.inner.lock().node_metrics.clone()
    }

    pub fn round_metrics(&self) -> Vec<(RoundMetric, Vec<NodeId>)> {
        self.inner.lock().round_metrics.values().cloned().collect()
    }

    pub fn round_errors(&self) -> Vec<RoundErrorRecord> {
        self.inner.lock().round_errors.clone()
    }
}

impl Database for MapImpl {
    fn insert_application(
        &self,
        application: Application,
        unregistered_node: Node,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&unregistered_node.code) {
            return Err(StorageError::Duplicate(unregistered_node.code));
        }
        inner.applications.insert(application.id, application);
        inner
            .nodes
            .insert(unregistered_node.code.clone(), unregistered_node);
        Ok(())
    }

    fn register_node(
        &self,
        id: &NodeId,
        salt: &[u8],
        code: &str,
        server_addr: &str,
        server_cert: &str,
        gateway_addr: &str,
        gateway_cert: &str,
        public_key: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(code)
            .ok_or_else(|| StorageError::InvalidCode(code.to_string()))?;
        node.id = Some(*id);
        node.salt = salt.to_vec();
        node.server_address = server_addr.to_string();
        node.node_certificate = server_cert.to_string();
        node.gateway_address = gateway_addr.to_string();
        node.gateway_certificate = gateway_cert.to_string();
        node.public_key = public_key.to_string();
        node.status = Status::Active;
        Ok(())
    }

    fn update_salt(&self, id: &NodeId, salt: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let node = node_by_id_mut(&mut inner, id)?;
        node.salt = salt.to_vec();
        Ok(())
    }

    fn update_node_sequence(&self, id: &NodeId, sequence: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let node = node_by_id_mut(&mut inner, id)?;
        node.sequence = sequence.to_string();
        Ok(())
    }

    fn update_node_addresses(
        &self,
        id: &NodeId,
        node_addr: &str,
        gateway_addr: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let node = node_by_id_mut(&mut inner, id)?;
        node.server_address = node_addr.to_string();
        node.gateway_address = gateway_addr.to_string();
        Ok(())
    }

    fn get_node(&self, code: &str) -> Result<Node, StorageError> {
        self.inner
            .lock()
            .nodes
            .get(code)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("node with code {}", code)))
    }

    fn get_node_by_id(&self, id: &NodeId) -> Result<Node, StorageError> {
        self.inner
            .lock()
            .nodes
            .values()
            .find(|n| n.id.as_ref() == Some(id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("node {}", id)))
    }

    fn get_nodes_by_status(&self, status: Status) -> Result<Vec<Node>, StorageError> {
        Ok(self
            .inner
            .lock()
            .nodes
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect())
    }

    fn get_active_nodes(&self) -> Result<Vec<Node>, StorageError> {
        Ok(self
            .inner
            .lock()
            .nodes
            .values()
            .filter(|n| n.status == Status::Active && n.id.is_some())
            .cloned()
            .collect())
    }

    fn insert_node_metric(&self, metric: NodeMetric) -> Result<(), StorageError> {
        trace!(node = %metric.node_id, pings = metric.num_pings, "inserting node metric");
        self.inner.lock().node_metrics.push(metric);
        Ok(())
    }

    fn insert_round_metric(
        &self,
        metric: RoundMetric,
        topology: &[NodeId],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.round_metrics.contains_key(&metric.id) {
            return Err(StorageError::Duplicate(format!("round metric {}", metric.id)));
        }
        inner
            .round_metrics
            .insert(metric.id, (metric, topology.to_vec()));
        Ok(())
    }

    fn insert_round_error(&self, round_id: u64, error: &str) -> Result<(), StorageError> {
        self.inner.lock().round_errors.push(RoundErrorRecord {
            round_id,
            error: error.to_string(),
        });
        Ok(())
    }

    fn upsert_state(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .states
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_state_value(&self, key: &str) -> Result<String, StorageError> {
        self.inner
            .lock()
            .states
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("state key {}", key)))
    }

    fn get_bins(&self) -> Result<HashMap<String, u8>, StorageError> {
        Ok(self.inner.lock().bins.clone())
    }

    fn insert_client_reg_code(&self, code: &str, uses: u32) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.clients.contains_key(code) {
            return Err(StorageError::Duplicate(code.to_string()));
        }
        inner.clients.insert(code.to_string(), uses);
        Ok(())
    }

    fn use_code(&self, code: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        match inner.clients.get_mut(code) {
            Some(uses) if *uses > 0 => {
                *uses -= 1;
                Ok(())
            }
            _ => Err(StorageError::InvalidCode(code.to_string())),
        }
    }

    fn insert_user(&self, public_key: &str) -> Result<(), StorageError> {
        self.inner.lock().users.insert(public_key.to_string());
        Ok(())
    }
}

fn node_by_id_mut<'a>(
    inner: &'a mut MapInner,
    id: &NodeId,
) -> Result<&'a mut Node, StorageError> {
    inner
        .nodes
        .values_mut()
        .find(|n| n.id.as_ref() == Some(id))
        .ok_or_else(|| StorageError::NotFound(format!("node {}", id)))
}
