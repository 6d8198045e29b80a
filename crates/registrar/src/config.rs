//! Registrar configuration, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::RegistrarError;
use crate::ndf::Group;

/// Which team composition algorithm the scheduler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingAlgorithm {
    Simple,
    Secure,
}

/// All recognized configuration options.
///
/// Every field has a default so a partial TOML file is enough; durations
/// are plain integers with their unit in the field name and typed
/// accessors below.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Nodes that must register before the first NDF is considered
    /// complete.
    pub minimum_nodes: u32,
    pub scheduling_algorithm: SchedulingAlgorithm,
    /// Number of nodes in a team.
    pub team_size: u32,
    /// Number of slots in a batch.
    pub batch_size: u32,
    /// Simple mode only: shuffle the team instead of ordering by tag.
    pub random_ordering: bool,
    /// Minimum spacing between assigning rounds.
    pub minimum_delay_ms: u64,
    /// Delay before a queued round goes realtime.
    pub realtime_delay_ms: u64,
    /// Offline nodes older than this are dropped from the pool.
    pub node_cleanup_interval_s: u64,
    /// Secure mode only: pool size required before a team forms.
    pub threshold: u32,
    /// Per-phase round timeout.
    pub round_timeout_s: u64,
    pub node_metric_interval_s: u64,
    pub ban_tracker_interval_s: u64,
    pub disable_gateway_ping: bool,
    pub disable_ndf_pruning: bool,
    /// Retention window for pruned nodes (configuration surface; node
    /// records themselves are kept forever).
    pub prune_retention_limit_s: u64,
    pub min_server_version: String,
    pub min_gateway_version: String,
    /// Address this server advertises in the NDF.
    pub public_address: String,
    /// Hex Ed25519 seed file for the scheduler signing key.
    pub key_path: PathBuf,
    /// TLS certificate advertised to nodes (opaque to the core).
    pub cert_path: PathBuf,
    /// Signed NDF JSON is exported here on every change.
    pub ndf_output_path: PathBuf,
    pub round_id_path: PathBuf,
    pub update_id_path: PathBuf,
    pub db_username: String,
    pub db_password: String,
    pub db_name: String,
    pub db_address: String,
    /// One `code,sequence` pair per line.
    pub reg_codes_file_path: Option<PathBuf>,
    pub client_reg_codes: Vec<String>,
    pub client_version: String,
    pub disabled_nodes_poll_duration_s: u64,
    pub disabled_nodes_path: Option<PathBuf>,
    /// How long shutdown waits for the scheduler to drain.
    pub scheduling_kill_timeout_s: u64,
    pub close_timeout_s: u64,
    /// Country code assumed when the geo lookup has no answer.
    pub default_country: String,
    pub cmix_group: Group,
    pub e2e_group: Group,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            minimum_nodes: 3,
            scheduling_algorithm: SchedulingAlgorithm::Simple,
            team_size: 3,
            batch_size: 32,
            random_ordering: false,
            minimum_delay_ms: 60,
            realtime_delay_ms: 2000,
            node_cleanup_interval_s: 180,
            threshold: 3,
            round_timeout_s: 60,
            node_metric_interval_s: 180,
            ban_tracker_interval_s: 30,
            disable_gateway_ping: false,
            disable_ndf_pruning: false,
            prune_retention_limit_s: 86_400,
            min_server_version: "0.0.0".to_string(),
            min_gateway_version: "0.0.0".to_string(),
            public_address: "0.0.0.0:11420".to_string(),
            key_path: PathBuf::from("registrar-key.hex"),
            cert_path: PathBuf::from("registrar-cert.pem"),
            ndf_output_path: PathBuf::from("ndf.json"),
            round_id_path: PathBuf::from("roundId.txt"),
            update_id_path: PathBuf::from("updateId.txt"),
            db_username: String::new(),
            db_password: String::new(),
            db_name: String::new(),
            db_address: String::new(),
            reg_codes_file_path: None,
            client_reg_codes: Vec::new(),
            client_version: "0.0.0".to_string(),
            disabled_nodes_poll_duration_s: 60,
            disabled_nodes_path: None,
            scheduling_kill_timeout_s: 10,
            close_timeout_s: 10,
            default_country: "ZZ".to_string(),
            cmix_group: Group::default(),
            e2e_group: Group::default(),
        }
    }
}

impl Params {
    pub fn minimum_delay(&self) -> Duration {
        Duration::from_millis(self.minimum_delay_ms)
    }

    pub fn realtime_delay(&self) -> Duration {
        Duration::from_millis(self.realtime_delay_ms)
    }

    pub fn node_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.node_cleanup_interval_s)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_s)
    }

    pub fn node_metric_interval(&self) -> Duration {
        Duration::from_secs(self.node_metric_interval_s)
    }

    pub fn ban_tracker_interval(&self) -> Duration {
        Duration::from_secs(self.ban_tracker_interval_s)
    }

    pub fn disabled_nodes_poll_duration(&self) -> Duration {
        Duration::from_secs(self.disabled_nodes_poll_duration_s)
    }

    pub fn scheduling_kill_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduling_kill_timeout_s)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_s)
    }
}

/// Load parameters from a TOML file.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Params, RegistrarError> {
    let p = path.as_ref();
    let s = fs::read_to_string(p)
        .map_err(|e| RegistrarError::Fatal(format!("could not read config {}: {}", p.display(), e)))?;
    toml::from_str(&s)
        .map_err(|e| RegistrarError::Fatal(format!("could not parse config {}: {}", p.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let params = Params::default();
        assert_eq!(params.team_size, 3);
        assert_eq!(params.scheduling_algorithm, SchedulingAlgorithm::Simple);
        assert_eq!(params.round_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_partial_toml() {
        let toml = r#"
            team_size = 5
            batch_size = 1000
            scheduling_algorithm = "secure"
            threshold = 20
            random_ordering = true
            min_server_version = "3.1.0"
            client_reg_codes = ["AAA", "BBB"]
        "#;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        write!(tmp.reopen().expect("reopen"), "{}", toml).expect("write");

        let params = load_from_file(tmp.path()).expect("load");
        assert_eq!(params.team_size, 5);
        assert_eq!(params.batch_size, 1000);
        assert_eq!(params.scheduling_algorithm, SchedulingAlgorithm::Secure);
        assert_eq!(params.threshold, 20);
        assert!(params.random_ordering);
        assert_eq!(params.min_server_version, "3.1.0");
        assert_eq!(params.client_reg_codes.len(), 2);
        // Untouched fields keep their defaults.
        assert_eq!(params.round_timeout_s, 60);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(load_from_file("/definitely/not/here.toml").is_err());
    }
}
