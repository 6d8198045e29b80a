//! The node polling endpoint.
//!
//! Every node hits [`Registrar::poll`] once per heartbeat. The handler
//! authenticates the caller, keeps its addresses and the NDF in sync,
//! probes connectivity, validates reported round errors, and submits the
//! reported activity through the edge check. A recorded transition is
//! handed to the scheduler together with the node's polling-lock token,
//! which serializes that node's pipeline until the scheduler is done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use mixnet_common::{Activity, NodeId, Version};
use mixnet_storage::Storage;

use crate::config::Params;
use crate::connectivity::ConnectivityProber;
use crate::error::RegistrarError;
use crate::ndf::{export_ndf, SignedNdf};
use crate::now_nanos;
use crate::registration::GeoLookup;
use crate::state::network::NetworkState;
use crate::state::node::{Connectivity, NodeState, UpdateNotification};
use crate::wire::{PermissionPollResponse, PermissioningPoll};

/// The placeholder host a gateway advertises when it wants the
/// registrar to substitute the node's public host.
pub const GATEWAY_REPLACE_IP_PLACEHOLDER: &str = "CHANGE_TO_PUBLIC_IP";

/// From a failed connectivity terminal, every poll with
/// `count % RECHECK_MODULUS == RECHECK_REMAINDER` forces a re-probe.
const RECHECK_MODULUS: u64 = 211;
const RECHECK_REMAINDER: u64 = 13;

/// Authenticated caller identity, established by the wire transport.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub node_id: NodeId,
    pub is_authenticated: bool,
    /// Dynamic hosts (unregistered transient peers) may never poll.
    pub is_dynamic_host: bool,
}

/// The permissioning server implementation behind the RPC surface.
pub struct Registrar {
    pub(crate) params: Params,
    pub(crate) state: Arc<NetworkState>,
    pub(crate) storage: Storage,
    pub(crate) prober: Arc<dyn ConnectivityProber>,
    pub(crate) geo: Arc<dyn GeoLookup>,
    update_tx: mpsc::UnboundedSender<UpdateNotification>,
    stopped: Arc<AtomicBool>,
    min_server_version: Version,
    min_gateway_version: Version,
    pub(crate) client_version: RwLock<String>,
}

impl Registrar {
    pub fn new(
        params: Params,
        state: Arc<NetworkState>,
        storage: Storage,
        prober: Arc<dyn ConnectivityProber>,
        geo: Arc<dyn GeoLookup>,
        update_tx: mpsc::UnboundedSender<UpdateNotification>,
        stopped: Arc<AtomicBool>,
    ) -> Result<Self, RegistrarError> {
        let min_server_version =
            parse_version("server", &params.min_server_version)?;
        let min_gateway_version =
            parse_version("gateway", &params.min_gateway_version)?;
        let client_version = RwLock::new(params.client_version.clone());
        Ok(Registrar {
            params,
            state,
            storage,
            prober,
            geo,
            update_tx,
            stopped,
            min_server_version,
            min_gateway_version,
            client_version,
        })
    }

    pub fn state(&self) -> &Arc<NetworkState> {
        &self.state
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The NDF is servable once it has been signed at least once and the
    /// configured minimum of nodes has registered.
    pub fn ndf_ready(&self) -> bool {
        self.state.ndf().is_ready()
            && self.state.node_map().len() >= self.params.minimum_nodes as usize
    }

    /// The unified node poll.
    pub async fn poll(
        &self,
        msg: PermissioningPoll,
        auth: &AuthContext,
    ) -> Result<PermissionPollResponse, RegistrarError> {
        let mut response = PermissionPollResponse::default();

        if !self.ndf_ready() {
            return Err(RegistrarError::NdfNotReady);
        }
        if !auth.is_authenticated || auth.is_dynamic_host {
            return Err(RegistrarError::AuthFailed(auth.node_id.to_string()));
        }
        let node = self
            .state
            .node_map()
            .get(&auth.node_id)
            .ok_or(RegistrarError::UnknownNode(auth.node_id))?;
        if node.is_banned() {
            return Err(RegistrarError::Banned(auth.node_id));
        }
        self.check_version(&msg)?;

        let activity = msg.activity;
        node.increment_poll_count();
        node.stamp_last_poll(now_nanos());

        // A pruned node that polls again re-enters the advertised NDF.
        if self.state.ndf().unprune(&node.id(), self.state.signing_key())? {
            self.export_ndf_file();
        }

        self.check_addresses(&node, &msg)?;

        if !self.state.ndf().compare_full_hash(&msg.full_ndf_hash) {
            trace!(node = %auth.node_id, "returning a new NDF");
            response.full_ndf = self.state.ndf().full();
            response.partial_ndf = self.state.ndf().partial();
        }

        response.updates = self.state.get_updates_since(msg.last_update);

        if !self.check_connectivity(&node, activity).await? {
            return Ok(response);
        }

        debug!(node = %auth.node_id, activity = %activity, "updating node state");

        // A malformed ERROR report carries no payload to record.
        if activity == Activity::Error && msg.error.is_none() {
            return Err(RegistrarError::BadError(format!(
                "a malformed error was received from {} with no error payload",
                auth.node_id
            )));
        }

        // NOT_STARTED never produces an update.
        if activity == Activity::NotStarted {
            return Ok(response);
        }

        // Once round creation has stopped, polls are answered but no
        // further transitions are taken, and the polling lock stays free.
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(response);
        }

        // The polling lock is taken here. If no transition occurs it is
        // released at the end of this scope; otherwise ownership moves
        // into the notification and the scheduler releases it when it
        // finishes processing, blocking all polls from this node until
        // then.
        let token = node.polling_lock().lock_owned().await;

        self.verify_error(&msg, &node)?;

        match node.update(activity)? {
            Some(mut notification) => {
                if notification.to_activity == Activity::Error {
                    notification.round_error = msg.error.clone();
                }
                notification.client_errors = msg.client_errors.clone();
                notification.polling_token = Some(token);
                if self.update_tx.send(notification).is_err() {
                    // Scheduler is gone (shutdown); the token drops with
                    // the unsent notification.
                    warn!(node = %auth.node_id, "scheduler unavailable, dropping update");
                }
            }
            None => drop(token),
        }

        Ok(response)
    }

    /// NDF poll for clients and back-end servers. Returns `None` when the
    /// caller's hash is current.
    pub fn poll_ndf(
        &self,
        their_hash: &str,
        auth: &AuthContext,
    ) -> Result<Option<SignedNdf>, RegistrarError> {
        if !self.ndf_ready() {
            return Err(RegistrarError::NdfNotReady);
        }

        // Unauthenticated callers (end users) only ever see the partial.
        if !auth.is_authenticated || auth.is_dynamic_host {
            if self.state.ndf().compare_partial_hash(their_hash) {
                return Ok(None);
            }
            trace!("returning a new partial NDF to a client");
            return Ok(self.state.ndf().partial());
        }

        if self.state.ndf().compare_full_hash(their_hash) {
            return Ok(None);
        }
        trace!("returning a new full NDF to a back-end server");
        Ok(self.state.ndf().full())
    }

    /// Gateway versions are checked only when reported (a server may poll
    /// before its gateway has started); the server version always is.
    fn check_version(&self, msg: &PermissioningPoll) -> Result<(), RegistrarError> {
        if !msg.gateway_version.is_empty() {
            let gateway = parse_version("gateway", &msg.gateway_version)?;
            if !Version::is_compatible(&self.min_gateway_version, &gateway) {
                return Err(RegistrarError::VersionIncompatible {
                    component: "gateway",
                    found: msg.gateway_version.clone(),
                    required: self.min_gateway_version.to_string(),
                });
            }
        } else {
            trace!("gateway version string is empty, skipping gateway version check");
        }

        let server = parse_version("server", &msg.server_version)?;
        if !Version::is_compatible(&self.min_server_version, &server) {
            return Err(RegistrarError::VersionIncompatible {
                component: "server",
                found: msg.server_version.clone(),
                required: self.min_server_version.to_string(),
            });
        }
        Ok(())
    }

    /// Sync reported addresses into the node record and the NDF. Any
    /// actual change rewrites the affected entries, re-signs the NDF and
    /// re-exports the JSON file.
    fn check_addresses(
        &self,
        node: &Arc<NodeState>,
        msg: &PermissioningPoll,
    ) -> Result<(), RegistrarError> {
        let server_address = if msg.server_address.is_empty() {
            node.server_address()
        } else {
            msg.server_address.clone()
        };
        let gateway_address =
            resolve_gateway_placeholder(&msg.gateway_address, &server_address)?;

        let node_update = node.update_server_address(&server_address);
        let gateway_update = node.update_gateway_address(&gateway_address);
        if !node_update && !gateway_update {
            return Ok(());
        }

        debug!(
            node = %node.id(),
            server = %server_address,
            gateway = %gateway_address,
            "updating advertised addresses"
        );
        if node_update {
            // A moved server invalidates what we knew about its ports.
            node.set_connectivity(Connectivity::Unknown);
        }

        let id = node.id();
        self.state.ndf().update(self.state.signing_key(), |def| {
            if node_update {
                def.update_node_address(&id, &server_address)?;
            }
            if gateway_update {
                def.update_gateway_address(&id, &gateway_address)?;
            }
            Ok(())
        })?;
        self.export_ndf_file();

        if let Err(e) =
            self.storage
                .update_node_addresses(&id, &server_address, &gateway_address)
        {
            warn!(node = %id, error = %e, "could not persist address change");
        }
        Ok(())
    }

    /// Dispatch on the connectivity FSM. `Ok(true)` lets the poll proceed
    /// to the state update; `Ok(false)` answers the poll without one.
    async fn check_connectivity(
        &self,
        node: &Arc<NodeState>,
        activity: Activity,
    ) -> Result<bool, RegistrarError> {
        match node.connectivity() {
            Connectivity::Unknown => {
                self.spawn_probe(node);
                // Errors are recorded even while reachability is unknown.
                Ok(activity == Activity::Error)
            }
            Connectivity::Verifying => Ok(activity == Activity::Error),
            Connectivity::Successful => Ok(true),
            failed @ (Connectivity::NodeFailed
            | Connectivity::GatewayFailed
            | Connectivity::BothFailed) => {
                if activity == Activity::Error {
                    return Ok(true);
                }
                // Periodically force a fresh probe; roughly every few
                // minutes at the usual heartbeat rate.
                if node.poll_count() % RECHECK_MODULUS == RECHECK_REMAINDER {
                    node.set_connectivity(Connectivity::Unknown);
                }
                Err(port_failed_error(failed, node))
            }
        }
    }

    /// Probe the node's ports in the background and map the outcome onto
    /// the FSM.
    fn spawn_probe(&self, node: &Arc<NodeState>) {
        node.set_connectivity(Connectivity::Verifying);
        let node = Arc::clone(node);
        let prober = Arc::clone(&self.prober);
        let skip_gateway = self.params.disable_gateway_ping;
        tokio::spawn(async move {
            let node_ok = prober.probe_node(&node.server_address()).await;
            let gateway_ok = if skip_gateway {
                true
            } else {
                prober.probe_gateway(&node.gateway_address()).await
            };
            let result = match (node_ok, gateway_ok) {
                (true, true) => Connectivity::Successful,
                (false, true) => Connectivity::NodeFailed,
                (true, false) => Connectivity::GatewayFailed,
                (false, false) => Connectivity::BothFailed,
            };
            trace!(node = %node.id(), connectivity = %result, "probe finished");
            node.set_connectivity(result);
        });
    }

    /// Validate an attached round error: its round id must match the
    /// node's current round (when nonzero) and its signature must verify
    /// under the reporter's registered key.
    fn verify_error(
        &self,
        msg: &PermissioningPoll,
        node: &Arc<NodeState>,
    ) -> Result<(), RegistrarError> {
        let Some(error) = &msg.error else {
            return Ok(());
        };

        if error.round_id != 0 {
            let round = node.current_round().ok_or_else(|| {
                RegistrarError::BadError(
                    "node cannot submit a round error when it is not participating in a round"
                        .to_string(),
                )
            })?;
            if error.round_id != round.id() {
                return Err(RegistrarError::BadError(
                    "this error is not associated with the round the submitting node is participating in"
                        .to_string(),
                ));
            }
        }

        let reporter_key = if error.node_id == node.id() {
            node.public_key()
        } else {
            self.state
                .node_map()
                .get(&error.node_id)
                .map(|n| n.public_key())
                .ok_or_else(|| {
                    RegistrarError::BadError(format!(
                        "reporter {} is not a known node",
                        error.node_id
                    ))
                })?
        };
        if !error.verify(&reporter_key)? {
            return Err(RegistrarError::BadError(
                "failed to verify round error signature".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn export_ndf_file(&self) {
        if let Err(e) = export_ndf(self.state.ndf(), &self.params.ndf_output_path) {
            warn!(error = %e, "could not export NDF");
        }
    }
}

fn parse_version(component: &'static str, raw: &str) -> Result<Version, RegistrarError> {
    raw.parse().map_err(|_| RegistrarError::VersionIncompatible {
        component,
        found: raw.to_string(),
        required: "a parseable major.minor.patch version".to_string(),
    })
}

fn port_failed_error(failed: Connectivity, node: &Arc<NodeState>) -> RegistrarError {
    let message = match failed {
        Connectivity::NodeFailed => format!(
            "node {} cannot be contacted by permissioning, are ports properly forwarded?",
            node.id()
        ),
        Connectivity::GatewayFailed => format!(
            "gateway with address {} cannot be contacted by permissioning, are ports properly forwarded?",
            node.gateway_address()
        ),
        _ => format!(
            "both node {} and gateway with address {} cannot be contacted by permissioning, are ports properly forwarded?",
            node.id(),
            node.gateway_address()
        ),
    };
    RegistrarError::PortFailed(message)
}

/// Replace the gateway's placeholder host with the node's own host,
/// keeping the gateway's port.
fn resolve_gateway_placeholder(
    gateway_address: &str,
    node_address: &str,
) -> Result<String, RegistrarError> {
    if gateway_address.is_empty() {
        return Ok(String::new());
    }
    let (gw_host, gw_port) = split_host_port(gateway_address)
        .ok_or_else(|| RegistrarError::Fatal(format!("bad gateway address {}", gateway_address)))?;
    if gw_host != GATEWAY_REPLACE_IP_PLACEHOLDER {
        return Ok(gateway_address.to_string());
    }
    let (node_host, _) = split_host_port(node_address)
        .ok_or_else(|| RegistrarError::Fatal(format!("bad node address {}", node_address)))?;
    Ok(format!("{}:{}", node_host, gw_port))
}

fn split_host_port(address: &str) -> Option<(&str, &str)> {
    address.rsplit_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::connectivity::AlwaysOnline;
    use crate::ndf::{Group, NetworkDefinition};
    use crate::registration::StaticGeoLookup;
    use crate::wire::RoundError;
    use mixnet_common::crypto::{self, generate_signing_key};
    use mixnet_common::node_id::{ID_LEN, TYPE_NODE};
    use mixnet_storage::MapImpl;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn nid(b: u8) -> NodeId {
        let mut bytes = [b; ID_LEN];
        bytes[ID_LEN - 1] = TYPE_NODE;
        NodeId::new(bytes)
    }

    struct Harness {
        registrar: Registrar,
        update_rx: UnboundedReceiver<UpdateNotification>,
        node_keys: Vec<ed25519_dalek::SigningKey>,
        _dir: TempDir,
    }

    /// A registrar with `n` registered nodes, connectivity pre-verified.
    fn harness(n: u8) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = Params {
            minimum_nodes: n as u32,
            team_size: n as u32,
            min_server_version: "1.0.0".to_string(),
            min_gateway_version: "1.0.0".to_string(),
            ndf_output_path: dir.path().join("ndf.json"),
            ..Params::default()
        };
        let state = Arc::new(
            NetworkState::new(
                generate_signing_key(),
                NetworkDefinition {
                    registration_address: params.public_address.clone(),
                    cmix: Group::default(),
                    e2e: Group::default(),
                    ..NetworkDefinition::default()
                },
                dir.path().join("roundId.txt"),
                dir.path().join("updateId.txt"),
            )
            .expect("network state"),
        );
        let storage = Storage::new(Arc::new(MapImpl::new()));
        let codes: Vec<(String, String)> = (1..=n)
            .map(|b| (format!("CODE-{}", b), (b - 1).to_string()))
            .collect();
        storage.populate_node_reg_codes(codes.iter().map(|(c, s)| (c.as_str(), s.as_str())));

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let registrar = Registrar::new(
            params,
            state,
            storage,
            Arc::new(AlwaysOnline),
            Arc::new(StaticGeoLookup::new("ZZ")),
            update_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .expect("registrar");

        let mut node_keys = Vec::new();
        for b in 1..=n {
            let key = generate_signing_key();
            registrar
                .register_node(
                    nid(b),
                    &format!("10.0.0.{}:11420", b),
                    "node-cert",
                    &format!("10.0.0.{}:8443", b),
                    "gw-cert",
                    &format!("CODE-{}", b),
                    &hex::encode(crypto::public_key_bytes(&key)),
                )
                .expect("register node");
            node_keys.push(key);

            let node = registrar
                .state()
                .node_map()
                .get(&nid(b))
                .expect("registered node");
            node.set_connectivity(Connectivity::Successful);
        }

        Harness {
            registrar,
            update_rx,
            node_keys,
            _dir: dir,
        }
    }

    fn auth(b: u8) -> AuthContext {
        AuthContext {
            node_id: nid(b),
            is_authenticated: true,
            is_dynamic_host: false,
        }
    }

    fn waiting_poll() -> PermissioningPoll {
        PermissioningPoll {
            activity: Activity::Waiting,
            last_update: 0,
            full_ndf_hash: String::new(),
            server_address: String::new(),
            gateway_address: String::new(),
            server_version: "1.0.0".to_string(),
            gateway_version: "1.0.0".to_string(),
            error: None,
            client_errors: vec![],
        }
    }

    #[tokio::test]
    async fn test_poll_before_ndf_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(
            NetworkState::new(
                generate_signing_key(),
                NetworkDefinition::default(),
                dir.path().join("roundId.txt"),
                dir.path().join("updateId.txt"),
            )
            .expect("network state"),
        );
        let (update_tx, _update_rx) = mpsc::unbounded_channel();
        let registrar = Registrar::new(
            Params::default(),
            state,
            Storage::new(Arc::new(MapImpl::new())),
            Arc::new(AlwaysOnline),
            Arc::new(StaticGeoLookup::new("ZZ")),
            update_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .expect("registrar");

        let result = registrar.poll(waiting_poll(), &auth(1)).await;
        assert!(matches!(result, Err(RegistrarError::NdfNotReady)));
    }

    #[tokio::test]
    async fn test_poll_rejects_unauthenticated_and_dynamic() {
        let h = harness(1);
        let mut unauthenticated = auth(1);
        unauthenticated.is_authenticated = false;
        let result = h.registrar.poll(waiting_poll(), &unauthenticated).await;
        assert!(matches!(result, Err(RegistrarError::AuthFailed(_))));

        let mut dynamic = auth(1);
        dynamic.is_dynamic_host = true;
        let result = h.registrar.poll(waiting_poll(), &dynamic).await;
        assert!(matches!(result, Err(RegistrarError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_poll_rejects_unknown_and_banned() {
        let h = harness(1);
        let result = h.registrar.poll(waiting_poll(), &auth(9)).await;
        assert!(matches!(result, Err(RegistrarError::UnknownNode(_))));

        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        node.ban();
        let result = h.registrar.poll(waiting_poll(), &auth(1)).await;
        assert!(matches!(result, Err(RegistrarError::Banned(_))));
    }

    #[tokio::test]
    async fn test_poll_rejects_old_versions() {
        let h = harness(1);

        let mut poll = waiting_poll();
        poll.server_version = "0.9.0".to_string();
        let result = h.registrar.poll(poll, &auth(1)).await;
        assert!(matches!(
            result,
            Err(RegistrarError::VersionIncompatible {
                component: "server",
                ..
            })
        ));

        let mut poll = waiting_poll();
        poll.gateway_version = "0.1.0".to_string();
        let result = h.registrar.poll(poll, &auth(1)).await;
        assert!(matches!(
            result,
            Err(RegistrarError::VersionIncompatible {
                component: "gateway",
                ..
            })
        ));

        // An empty gateway version skips the gateway check entirely.
        let mut poll = waiting_poll();
        poll.gateway_version = String::new();
        assert!(h.registrar.poll(poll, &auth(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_gateway_placeholder_substitution() {
        let h = harness(1);
        let mut poll = waiting_poll();
        poll.gateway_address = format!("{}:9000", GATEWAY_REPLACE_IP_PLACEHOLDER);
        h.registrar.poll(poll, &auth(1)).await.expect("poll");

        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        assert_eq!(node.gateway_address(), "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_ndf_returned_only_on_stale_hash() {
        let mut h = harness(1);

        let response = h
            .registrar
            .poll(waiting_poll(), &auth(1))
            .await
            .expect("poll");
        let full = response.full_ndf.expect("stale hash gets the full NDF");
        assert!(response.partial_ndf.is_some());

        // Drain the WAITING notification so the next poll can take the lock.
        let notification = h.update_rx.recv().await.expect("notification");
        drop(notification);

        let mut poll = waiting_poll();
        poll.full_ndf_hash = full.hash.clone();
        let response = h.registrar.poll(poll, &auth(1)).await.expect("poll");
        assert!(response.full_ndf.is_none());
        assert!(response.partial_ndf.is_none());
    }

    #[tokio::test]
    async fn test_address_change_rewrites_and_resigns_ndf() {
        let mut h = harness(1);
        let before = h.registrar.state().ndf().full().expect("full").hash;

        let mut poll = waiting_poll();
        poll.server_address = "192.0.2.7:11420".to_string();
        h.registrar.poll(poll, &auth(1)).await.expect("poll");
        h.update_rx.recv().await.expect("notification");

        let after = h.registrar.state().ndf().full().expect("full");
        assert_ne!(before, after.hash);
        let def = after.definition().expect("definition");
        assert_eq!(def.nodes[0].address, "192.0.2.7:11420");

        // The address change reset connectivity for a fresh probe.
        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        assert_ne!(node.connectivity(), Connectivity::Successful);
    }

    #[tokio::test]
    async fn test_not_started_produces_no_update() {
        let mut h = harness(1);
        let mut poll = waiting_poll();
        poll.activity = Activity::NotStarted;
        h.registrar.poll(poll, &auth(1)).await.expect("poll");
        assert!(h.update_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_waiting_hands_off_polling_lock() {
        let mut h = harness(1);
        h.registrar.poll(waiting_poll(), &auth(1)).await.expect("poll");

        let notification = h.update_rx.recv().await.expect("notification");
        assert_eq!(notification.to_activity, Activity::Waiting);
        assert!(notification.polling_token.is_some());

        // While the scheduler (here: the test) holds the notification,
        // the node's polling pipeline is blocked.
        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        assert!(node.polling_lock().try_lock().is_err());

        drop(notification);
        assert!(node.polling_lock().try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_repeat_activity_releases_lock_immediately() {
        let mut h = harness(1);
        h.registrar.poll(waiting_poll(), &auth(1)).await.expect("poll");
        drop(h.update_rx.recv().await.expect("notification"));

        // Second WAITING poll: no transition, lock free afterwards.
        h.registrar.poll(waiting_poll(), &auth(1)).await.expect("poll");
        assert!(h.update_rx.try_recv().is_err());
        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        assert!(node.polling_lock().try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_error_without_payload_rejected() {
        let h = harness(1);
        let mut poll = waiting_poll();
        poll.activity = Activity::Error;
        let result = h.registrar.poll(poll, &auth(1)).await;
        assert!(matches!(result, Err(RegistrarError::BadError(_))));
    }

    #[tokio::test]
    async fn test_error_with_bad_signature_rejected() {
        let mut h = harness(1);
        h.registrar.poll(waiting_poll(), &auth(1)).await.expect("poll");
        drop(h.update_rx.recv().await.expect("notification"));

        let forged_key = generate_signing_key();
        let mut poll = waiting_poll();
        poll.activity = Activity::Error;
        poll.error = Some(RoundError::signed(0, nid(1), "boom", &forged_key));
        let result = h.registrar.poll(poll, &auth(1)).await;
        assert!(matches!(result, Err(RegistrarError::BadError(_))));
        // The failed poll released the lock on its way out.
        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        assert!(node.polling_lock().try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_error_with_valid_signature_accepted() {
        let mut h = harness(1);
        h.registrar.poll(waiting_poll(), &auth(1)).await.expect("poll");
        drop(h.update_rx.recv().await.expect("notification"));

        let mut poll = waiting_poll();
        poll.activity = Activity::Error;
        poll.error = Some(RoundError::signed(0, nid(1), "boom", &h.node_keys[0]));
        h.registrar.poll(poll, &auth(1)).await.expect("poll");

        let notification = h.update_rx.recv().await.expect("notification");
        assert_eq!(notification.to_activity, Activity::Error);
        assert_eq!(
            notification.round_error.as_ref().map(|e| e.error.as_str()),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn test_error_with_mismatched_round_id_rejected() {
        let mut h = harness(1);
        h.registrar.poll(waiting_poll(), &auth(1)).await.expect("poll");
        drop(h.update_rx.recv().await.expect("notification"));

        // Round id 42 while the node has no round at all.
        let mut poll = waiting_poll();
        poll.activity = Activity::Error;
        poll.error = Some(RoundError::signed(42, nid(1), "boom", &h.node_keys[0]));
        let result = h.registrar.poll(poll, &auth(1)).await;
        assert!(matches!(result, Err(RegistrarError::BadError(_))));
    }

    #[tokio::test]
    async fn test_failed_connectivity_returns_port_failed() {
        let h = harness(1);
        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        node.set_connectivity(Connectivity::NodeFailed);
        let result = h.registrar.poll(waiting_poll(), &auth(1)).await;
        assert!(matches!(result, Err(RegistrarError::PortFailed(_))));
    }

    #[tokio::test]
    async fn test_failed_connectivity_recheck_cadence() {
        let h = harness(1);
        let node = h.registrar.state().node_map().get(&nid(1)).expect("node");
        node.set_connectivity(Connectivity::BothFailed);

        // Push the counter to one below the recheck point; the next poll
        // lands exactly on count % 211 == 13 and resets to Unknown.
        for _ in 0..RECHECK_REMAINDER.saturating_sub(1) {
            node.increment_poll_count();
        }
        let result = h.registrar.poll(waiting_poll(), &auth(1)).await;
        assert!(matches!(result, Err(RegistrarError::PortFailed(_))));
        assert_eq!(node.connectivity(), Connectivity::Unknown);
    }

    #[tokio::test]
    async fn test_poll_ndf_partial_for_clients_full_for_backends() {
        let h = harness(1);

        let mut client = auth(1);
        client.is_authenticated = false;
        let partial = h
            .registrar
            .poll_ndf("", &client)
            .expect("poll ndf")
            .expect("stale hash gets a body");
        let def = partial.definition().expect("definition");
        assert!(def.nodes[0].tls_certificate.is_empty());
        // Hash now current: empty response.
        assert!(h
            .registrar
            .poll_ndf(&partial.hash, &client)
            .expect("poll ndf")
            .is_none());

        let full = h
            .registrar
            .poll_ndf("", &auth(1))
            .expect("poll ndf")
            .expect("stale hash gets a body");
        let def = full.definition().expect("definition");
        assert_eq!(def.nodes[0].tls_certificate, "node-cert");
    }

    #[test]
    fn test_resolve_gateway_placeholder() {
        let resolved = resolve_gateway_placeholder("CHANGE_TO_PUBLIC_IP:8443", "1.2.3.4:11420")
            .expect("resolve");
        assert_eq!(resolved, "1.2.3.4:8443");

        let untouched =
            resolve_gateway_placeholder("5.6.7.8:8443", "1.2.3.4:11420").expect("resolve");
        assert_eq!(untouched, "5.6.7.8:8443");

        assert_eq!(
            resolve_gateway_placeholder("", "1.2.3.4:11420").expect("resolve"),
            ""
        );
        assert!(resolve_gateway_placeholder("noport", "1.2.3.4:11420").is_err());
    }
}
