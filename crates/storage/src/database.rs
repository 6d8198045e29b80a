//! The object-safe persistence trait and its [`Storage`] wrapper.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use mixnet_common::NodeId;

use crate::models::{Application, Node, NodeMetric, RoundMetric, Status};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("registration code {0} is invalid or exhausted")]
    InvalidCode(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Persistence operations the core consumes.
///
/// Implementations must be safe to call from concurrent poll handlers
/// and the scheduler task; the in-memory variant is [`crate::MapImpl`],
/// a relational backend is an external drop-in.
pub trait Database: Send + Sync {
    /// Insert an application record along with its pre-provisioned node row.
    fn insert_application(
        &self,
        application: Application,
        unregistered_node: Node,
    ) -> Result<(), StorageError>;

    /// Attach identity, addresses, certificates and the signing key to the
    /// node row matching `code`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), StorageError>;

    /// Replace the salt for the node with the given id.
    fn update_salt(&self, id: &NodeId, salt: &[u8]) -> Result<(), StorageError>;

    /// Replace the ordering tag for the node with the given id.
    fn update_node_sequence(&self, id: &NodeId, sequence: &str) -> Result<(), StorageError>;

    /// Replace both address fields for the node with the given id.
    fn update_node_addresses(
        &self,
        id: &NodeId,
        node_addr: &str,
        gateway_addr: &str,
    ) -> Result<(), StorageError>;

    /// Fetch the node row for a registration code.
    fn get_node(&self, code: &str) -> Result<Node, StorageError>;

    /// Fetch the node row for a node id.
    fn get_node_by_id(&self, id: &NodeId) -> Result<Node, StorageError>;

    /// All node rows currently carrying `status`.
    fn get_nodes_by_status(&self, status: Status) -> Result<Vec<Node>, StorageError>;

    /// All registered, active node rows.
    fn get_active_nodes(&self) -> Result<Vec<Node>, StorageError>;

    fn insert_node_metric(&self, metric: NodeMetric) -> Result<(), StorageError>;

    /// Insert a round metric with the ordered topology it ran over.
    fn insert_round_metric(
        &self,
        metric: RoundMetric,
        topology: &[NodeId],
    ) -> Result<(), StorageError>;

    fn insert_round_error(&self, round_id: u64, error: &str) -> Result<(), StorageError>;

    /// Insert or overwrite a key/value state entry.
    fn upsert_state(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Read a key/value state entry.
    fn get_state_value(&self, key: &str) -> Result<String, StorageError>;

    /// Country-to-bin mapping for geographic composition.
    fn get_bins(&self) -> Result<HashMap<String, u8>, StorageError>;

    /// Provision a client registration code with a number of uses.
    fn insert_client_reg_code(&self, code: &str, uses: u32) -> Result<(), StorageError>;

    /// Consume one use of a client registration code.
    fn use_code(&self, code: &str) -> Result<(), StorageError>;

    /// Record a registered client public key.
    fn insert_user(&self, public_key: &str) -> Result<(), StorageError>;
}

/// Cloneable handle over the active [`Database`] implementation.
#[derive(Clone)]
pub struct Storage {
    db: Arc<dyn Database>,
}

impl Storage {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Storage { db }
    }

    /// The underlying database handle.
    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Pre-provision node registration codes with incrementing
    /// application ids. Failures are logged and skipped so one bad row
    /// does not block the rest of the file.
    pub fn populate_node_reg_codes<'a, I>(&self, infos: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (i, (code, sequence)) in infos.into_iter().enumerate() {
            let app_id = (i + 1) as u64;
            let app = Application {
                id: app_id,
                ..Application::default()
            };
            let node = Node::unregistered(code, sequence, app_id);
            if let Err(e) = self.db.insert_application(app, node) {
                warn!(code, error = %e, "unable to populate node registration code");
            }
        }
    }

    /// Pre-provision client registration codes.
    pub fn populate_client_reg_codes<'a, I>(&self, codes: I, uses: u32)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for code in codes {
            if let Err(e) = self.db.insert_client_reg_code(code, uses) {
                warn!(code, error = %e, "unable to populate client registration code");
            }
        }
    }
}

impl std::ops::Deref for Storage {
    type Target = dyn Database;

    fn deref(&self) -> &Self::Target {
        self.db.as_ref()
    }
}
