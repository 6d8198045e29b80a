//! Connectivity probing seam.
//!
//! The poll handler verifies that a node's advertised server and gateway
//! ports are actually reachable before letting it participate. The probe
//! itself is a pluggable collaborator so tests (and deployments behind
//! exotic transports) can swap it out.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

/// Probes a node's advertised addresses.
#[async_trait]
pub trait ConnectivityProber: Send + Sync {
    /// True when the node's server port accepts connections.
    async fn probe_node(&self, address: &str) -> bool;

    /// True when the gateway port accepts connections.
    async fn probe_gateway(&self, address: &str) -> bool;
}

/// Default prober: a bounded TCP connect against the advertised address.
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        TcpProber { timeout }
    }

    async fn connect(&self, address: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!(address, error = %e, "probe connect failed");
                false
            }
            Err(_) => {
                trace!(address, "probe timed out");
                false
            }
        }
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        TcpProber::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl ConnectivityProber for TcpProber {
    async fn probe_node(&self, address: &str) -> bool {
        self.connect(address).await
    }

    async fn probe_gateway(&self, address: &str) -> bool {
        self.connect(address).await
    }
}

/// A prober that reports every port as reachable. For tests and
/// single-host development networks.
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProber for AlwaysOnline {
    async fn probe_node(&self, _address: &str) -> bool {
        true
    }

    async fn probe_gateway(&self, _address: &str) -> bool {
        true
    }
}
