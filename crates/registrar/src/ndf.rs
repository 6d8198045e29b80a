//! The network definition file (NDF).
//!
//! The NDF is the signed authoritative description of the network: node
//! and gateway entries, addresses, certificates, and the cryptographic
//! groups. The *full* document carries certificate material for back-end
//! peers; the *partial* document strips it and is what end users see.
//!
//! [`NdfState`] owns the unpruned master document plus the currently
//! advertised (pruned, signed) full and partial copies. All mutation goes
//! through its write lock and re-signs both copies, so readers always
//! observe a consistent signed pair. Consumers detect staleness by hash
//! comparison.

use std::collections::HashSet;

use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use mixnet_common::{crypto, NodeId};

use crate::error::RegistrarError;

/// A cyclic group used by the mix protocol, as advertised to peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub prime: String,
    pub generator: String,
}

/// Node entry in the NDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdfNode {
    pub id: NodeId,
    pub address: String,
    pub tls_certificate: String,
}

/// Gateway entry in the NDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdfGateway {
    pub id: NodeId,
    pub address: String,
    pub tls_certificate: String,
}

/// The network definition document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub timestamp: u64,
    pub registration_address: String,
    pub nodes: Vec<NdfNode>,
    pub gateways: Vec<NdfGateway>,
    pub cmix: Group,
    pub e2e: Group,
}

impl NetworkDefinition {
    /// The partial rendition served to end users: certificate material
    /// removed, everything else intact.
    pub fn strip(&self) -> NetworkDefinition {
        let mut stripped = self.clone();
        for node in &mut stripped.nodes {
            node.tls_certificate = String::new();
        }
        for gw in &mut stripped.gateways {
            gw.tls_certificate = String::new();
        }
        stripped
    }

    /// A copy excluding the given node ids and their paired gateways.
    pub fn without_nodes(&self, pruned: &HashSet<NodeId>) -> NetworkDefinition {
        let mut out = self.clone();
        out.nodes.retain(|n| !pruned.contains(&n.id));
        out.gateways.retain(|g| {
            // Gateway ids are derived; match on the owning node id.
            !pruned.iter().any(|p| p.gateway() == g.id)
        });
        out
    }

    /// Insert or replace the entry pair for a node.
    pub fn upsert_node(&mut self, node: NdfNode, gateway: NdfGateway) {
        self.nodes.retain(|n| n.id != node.id);
        self.gateways.retain(|g| g.id != gateway.id);
        self.nodes.push(node);
        self.gateways.push(gateway);
    }

    /// Update the address of a node entry.
    pub fn update_node_address(&mut self, id: &NodeId, addr: &str) -> Result<(), RegistrarError> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == *id)
            .ok_or_else(|| {
                RegistrarError::Fatal(format!(
                    "could not find node {} in the network definition to update its address",
                    id
                ))
            })?;
        node.address = addr.to_string();
        Ok(())
    }

    /// Update the address of the gateway paired with a node.
    pub fn update_gateway_address(
        &mut self,
        node_id: &NodeId,
        addr: &str,
    ) -> Result<(), RegistrarError> {
        let gid = node_id.gateway();
        let gw = self
            .gateways
            .iter_mut()
            .find(|g| g.id == gid)
            .ok_or_else(|| {
                RegistrarError::Fatal(format!(
                    "could not find gateway {} in the network definition to update its address",
                    gid
                ))
            })?;
        gw.address = addr.to_string();
        Ok(())
    }
}

/// A marshalled, hashed, signed NDF ready to hand to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedNdf {
    /// The marshalled JSON document.
    pub document: String,
    /// Hex SHA-256 of `document`.
    pub hash: String,
    /// Hex Ed25519 signature over the document bytes.
    pub signature: String,
}

impl SignedNdf {
    /// Marshal, hash and sign a definition.
    pub fn sign(def: &NetworkDefinition, key: &SigningKey) -> Result<SignedNdf, RegistrarError> {
        let document = serde_json::to_string(def)
            .map_err(|e| RegistrarError::Fatal(format!("could not marshal NDF: {}", e)))?;
        let hash = hex::encode(Sha256::digest(document.as_bytes()));
        let signature = hex::encode(crypto::sign(key, document.as_bytes()));
        Ok(SignedNdf {
            document,
            hash,
            signature,
        })
    }

    /// True when the caller's hex hash matches this document's hash.
    pub fn compare_hash(&self, their_hash: &str) -> bool {
        self.hash == their_hash
    }

    /// Parse the document back out (for tests and the on-disk export).
    pub fn definition(&self) -> Result<NetworkDefinition, RegistrarError> {
        serde_json::from_str(&self.document)
            .map_err(|e| RegistrarError::Fatal(format!("could not unmarshal NDF: {}", e)))
    }
}

struct NdfInner {
    /// Master document including pruned nodes.
    unpruned: NetworkDefinition,
    /// Nodes excluded from the advertised copies.
    pruned: HashSet<NodeId>,
    full: Option<SignedNdf>,
    partial: Option<SignedNdf>,
}

/// The NDF write-lock holder of the network state.
pub struct NdfState {
    inner: RwLock<NdfInner>,
}

impl NdfState {
    pub fn new(initial: NetworkDefinition) -> Self {
        NdfState {
            inner: RwLock::new(NdfInner {
                unpruned: initial,
                pruned: HashSet::new(),
                full: None,
                partial: None,
            }),
        }
    }

    /// True once a signed full NDF has been published.
    pub fn is_ready(&self) -> bool {
        self.inner.read().full.is_some()
    }

    /// Mutate the unpruned master document and republish both signed
    /// copies under one write lock.
    pub fn update<F>(&self, key: &SigningKey, mutate: F) -> Result<(), RegistrarError>
    where
        F: FnOnce(&mut NetworkDefinition) -> Result<(), RegistrarError>,
    {
        let mut inner = self.inner.write();
        mutate(&mut inner.unpruned)?;
        resign(&mut inner, key)
    }

    /// Replace the pruned-node set and republish.
    pub fn set_pruned(
        &self,
        pruned: HashSet<NodeId>,
        key: &SigningKey,
    ) -> Result<(), RegistrarError> {
        let mut inner = self.inner.write();
        inner.pruned = pruned;
        resign(&mut inner, key)
    }

    pub fn pruned(&self) -> HashSet<NodeId> {
        self.inner.read().pruned.clone()
    }

    /// Restore one pruned node to the advertised NDF. True when the node
    /// was pruned and a republish happened.
    pub fn unprune(&self, id: &NodeId, key: &SigningKey) -> Result<bool, RegistrarError> {
        // Fast path for the common case: every poll calls this, almost
        // never against a pruned node.
        if !self.inner.read().pruned.contains(id) {
            return Ok(false);
        }
        let mut inner = self.inner.write();
        if !inner.pruned.remove(id) {
            return Ok(false);
        }
        resign(&mut inner, key)?;
        Ok(true)
    }

    pub fn full(&self) -> Option<SignedNdf> {
        self.inner.read().full.clone()
    }

    pub fn partial(&self) -> Option<SignedNdf> {
        self.inner.read().partial.clone()
    }

    /// Hash comparison against the advertised full NDF. A missing NDF
    /// matches nothing.
    pub fn compare_full_hash(&self, their_hash: &str) -> bool {
        self.inner
            .read()
            .full
            .as_ref()
            .map(|f| f.compare_hash(their_hash))
            .unwrap_or(false)
    }

    pub fn compare_partial_hash(&self, their_hash: &str) -> bool {
        self.inner
            .read()
            .partial
            .as_ref()
            .map(|p| p.compare_hash(their_hash))
            .unwrap_or(false)
    }

    /// Copy of the unpruned master document.
    pub fn unpruned(&self) -> NetworkDefinition {
        self.inner.read().unpruned.clone()
    }
}

/// Export the advertised full NDF document as JSON on disk. Best-effort:
/// callers log the error and continue.
pub fn export_ndf(state: &NdfState, path: &std::path::Path) -> Result<(), RegistrarError> {
    let Some(full) = state.full() else {
        return Ok(());
    };
    std::fs::write(path, full.document.as_bytes()).map_err(|e| {
        RegistrarError::Fatal(format!(
            "unable to output NDF JSON file {}: {}",
            path.display(),
            e
        ))
    })
}

fn resign(inner: &mut NdfInner, key: &SigningKey) -> Result<(), RegistrarError> {
    inner.unpruned.timestamp = crate::now_nanos();
    let advertised = inner.unpruned.without_nodes(&inner.pruned);
    inner.full = Some(SignedNdf::sign(&advertised, key)?);
    inner.partial = Some(SignedNdf::sign(&advertised.strip(), key)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixnet_common::crypto::generate_signing_key;
    use mixnet_common::node_id::{ID_LEN, TYPE_NODE};

    fn nid(b: u8) -> NodeId {
        let mut bytes = [b; ID_LEN];
        bytes[ID_LEN - 1] = TYPE_NODE;
        NodeId::new(bytes)
    }

    fn entry(b: u8) -> (NdfNode, NdfGateway) {
        let id = nid(b);
        (
            NdfNode {
                id,
                address: format!("10.0.0.{}:11420", b),
                tls_certificate: format!("cert-{}", b),
            },
            NdfGateway {
                id: id.gateway(),
                address: format!("10.0.0.{}:8443", b),
                tls_certificate: format!("gw-cert-{}", b),
            },
        )
    }

    fn state_with_nodes(key: &SigningKey, ids: &[u8]) -> NdfState {
        let state = NdfState::new(NetworkDefinition::default());
        for b in ids {
            let (n, g) = entry(*b);
            state
                .update(key, |def| {
                    def.upsert_node(n.clone(), g.clone());
                    Ok(())
                })
                .expect("update");
        }
        state
    }

    #[test]
    fn test_strip_removes_certificates() {
        let (n, g) = entry(1);
        let mut def = NetworkDefinition::default();
        def.upsert_node(n, g);
        let stripped = def.strip();
        assert!(stripped.nodes[0].tls_certificate.is_empty());
        assert!(stripped.gateways[0].tls_certificate.is_empty());
        assert_eq!(stripped.nodes[0].address, def.nodes[0].address);
    }

    #[test]
    fn test_ready_after_first_publish() {
        let key = generate_signing_key();
        let state = NdfState::new(NetworkDefinition::default());
        assert!(!state.is_ready());
        state.update(&key, |_| Ok(())).expect("update");
        assert!(state.is_ready());
    }

    #[test]
    fn test_hash_roundtrip() {
        let key = generate_signing_key();
        let state = state_with_nodes(&key, &[1, 2]);
        let full = state.full().expect("full ndf");

        // Current hash matches; any other does not.
        assert!(state.compare_full_hash(&full.hash));
        assert!(!state.compare_full_hash("deadbeef"));

        // Signature verifies under the scheduler key.
        let ok = crypto::verify(
            &crypto::public_key_bytes(&key),
            full.document.as_bytes(),
            &hex::decode(&full.signature).expect("hex"),
        )
        .expect("verify");
        assert!(ok);
    }

    #[test]
    fn test_address_update_changes_hash() {
        let key = generate_signing_key();
        let state = state_with_nodes(&key, &[1]);
        let before = state.full().expect("full").hash;

        state
            .update(&key, |def| def.update_node_address(&nid(1), "9.9.9.9:11420"))
            .expect("update");

        let after = state.full().expect("full");
        assert_ne!(before, after.hash);
        let def = after.definition().expect("definition");
        assert_eq!(def.nodes[0].address, "9.9.9.9:11420");
    }

    #[test]
    fn test_update_unknown_node_fails() {
        let key = generate_signing_key();
        let state = state_with_nodes(&key, &[1]);
        let result = state.update(&key, |def| def.update_node_address(&nid(9), "x:1"));
        assert!(result.is_err());
    }

    #[test]
    fn test_pruning_excludes_node_and_gateway() {
        let key = generate_signing_key();
        let state = state_with_nodes(&key, &[1, 2, 3]);

        let mut pruned = HashSet::new();
        pruned.insert(nid(2));
        state.set_pruned(pruned, &key).expect("set pruned");

        let def = state.full().expect("full").definition().expect("definition");
        assert_eq!(def.nodes.len(), 2);
        assert!(def.nodes.iter().all(|n| n.id != nid(2)));
        assert!(def.gateways.iter().all(|g| g.id != nid(2).gateway()));

        // Master document still carries everything.
        assert_eq!(state.unpruned().nodes.len(), 3);

        // Unpruning restores the entry.
        state.set_pruned(HashSet::new(), &key).expect("set pruned");
        let def = state.full().expect("full").definition().expect("definition");
        assert_eq!(def.nodes.len(), 3);
    }

    #[test]
    fn test_partial_tracks_full() {
        let key = generate_signing_key();
        let state = state_with_nodes(&key, &[1]);
        let partial = state.partial().expect("partial");
        let def = partial.definition().expect("definition");
        assert!(def.nodes[0].tls_certificate.is_empty());
        assert!(state.compare_partial_hash(&partial.hash));
    }
}
