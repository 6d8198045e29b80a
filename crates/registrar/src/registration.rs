//! Node and client registration.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use mixnet_common::{crypto, NodeId};

use crate::error::RegistrarError;
use crate::ndf::{NdfGateway, NdfNode};
use crate::poll::Registrar;
use crate::state::node::NodeState;

/// Maps a node's advertised address to a country code. The real lookup
/// is an external collaborator; deployments without one fall back to the
/// configured default.
pub trait GeoLookup: Send + Sync {
    fn country_code(&self, address: &str) -> Option<String>;
}

/// Geo lookup that answers every query with one fixed country.
pub struct StaticGeoLookup {
    country: String,
}

impl StaticGeoLookup {
    pub fn new(country: &str) -> Self {
        StaticGeoLookup {
            country: country.to_string(),
        }
    }
}

impl GeoLookup for StaticGeoLookup {
    fn country_code(&self, _address: &str) -> Option<String> {
        Some(self.country.clone())
    }
}

impl Registrar {
    /// Register a node against a pre-provisioned one-time registration
    /// code: persist its row, create its live state, and publish it into
    /// the NDF.
    #[allow(clippy::too_many_arguments)]
    pub fn register_node(
        &self,
        id: NodeId,
        server_addr: &str,
        server_cert: &str,
        gateway_addr: &str,
        gateway_cert: &str,
        reg_code: &str,
        public_key_hex: &str,
    ) -> Result<(), RegistrarError> {
        let row = self.storage.get_node(reg_code)?;
        if row.id.is_some() {
            return Err(RegistrarError::AuthFailed(format!(
                "registration code {} has already been used",
                reg_code
            )));
        }

        // Ordering tag: the provisioned sequence, else the geo lookup,
        // else the configured fallback country.
        let ordering = if row.sequence.is_empty() {
            self.geo
                .country_code(server_addr)
                .unwrap_or_else(|| self.params.default_country.clone())
        } else {
            row.sequence.clone()
        };

        self.storage.register_node(
            &id,
            &[],
            reg_code,
            server_addr,
            server_cert,
            gateway_addr,
            gateway_cert,
            public_key_hex,
        )?;
        if row.sequence.is_empty() {
            // Persist the derived tag so a restart restores it.
            self.storage.update_node_sequence(&id, &ordering)?;
        }

        let public_key = hex::decode(public_key_hex)
            .map_err(|e| RegistrarError::Fatal(format!("bad node public key: {}", e)))?;
        let node = Arc::new(NodeState::new(
            id,
            row.application_id,
            server_addr.to_string(),
            gateway_addr.to_string(),
            server_cert.to_string(),
            gateway_cert.to_string(),
            public_key,
            ordering,
        ));
        if !self.state.node_map().insert(Arc::clone(&node)) {
            return Err(RegistrarError::AuthFailed(format!(
                "node {} is already registered",
                id
            )));
        }

        self.publish_node(&node)?;
        info!(node = %id, code = reg_code, "node registered");
        Ok(())
    }

    /// Rebuild live node state and the NDF from storage after a restart.
    pub fn restore_from_storage(&self) -> Result<usize, RegistrarError> {
        let rows = self.storage.get_active_nodes()?;
        let mut restored = 0usize;
        for row in rows {
            let node = Arc::new(NodeState::from_record(&row)?);
            if self.state.node_map().insert(Arc::clone(&node)) {
                self.publish_node(&node)?;
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "restored nodes from storage");
        }
        Ok(restored)
    }

    /// Upsert a node's entry pair into the NDF, re-sign, and export.
    fn publish_node(&self, node: &Arc<NodeState>) -> Result<(), RegistrarError> {
        let entry = NdfNode {
            id: node.id(),
            address: node.server_address(),
            tls_certificate: node.node_certificate(),
        };
        let gateway = NdfGateway {
            id: node.id().gateway(),
            address: node.gateway_address(),
            tls_certificate: node.gateway_certificate(),
        };
        self.state.ndf().update(self.state.signing_key(), |def| {
            def.upsert_node(entry, gateway);
            Ok(())
        })?;
        self.export_ndf_file();
        Ok(())
    }

    /// Client registration: consume one use of the registration code and
    /// return the registrar's signature over the client's public key.
    pub fn register_user(
        &self,
        reg_code: &str,
        client_pub_key: &str,
    ) -> Result<Vec<u8>, RegistrarError> {
        info!(code = reg_code, "verifying client registration code");
        self.storage.use_code(reg_code)?;

        let digest = Sha256::digest(client_pub_key.as_bytes());
        let signature = crypto::sign(self.state.signing_key(), &digest);

        if let Err(e) = self.storage.insert_user(client_pub_key) {
            warn!(error = %e, "could not record registered user");
        }
        Ok(signature)
    }

    /// The client software version the network currently expects.
    pub fn current_client_version(&self) -> String {
        self.client_version.read().clone()
    }

    /// Operator update of the expected client version.
    pub fn set_client_version(&self, version: &str) -> Result<(), RegistrarError> {
        version
            .parse::<mixnet_common::Version>()
            .map_err(|_| RegistrarError::VersionIncompatible {
                component: "client",
                found: version.to_string(),
                required: "a parseable major.minor.patch version".to_string(),
            })?;
        *self.client_version.write() = version.to_string();
        Ok(())
    }
}
