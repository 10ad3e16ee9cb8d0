use models::Endpoint;
use std::time::Duration;

/// Node configuration, matching the operator-facing option names.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster_name: String,
    pub listen_address: String,
    pub seeds: Vec<String>,

    pub partitioner: String,
    pub shard_count: u32,
    pub murmur3_partitioner_ignore_msb_bits: u32,

    #[serde(with = "humantime_serde")]
    pub ring_delay_ms: Duration,
    #[serde(with = "humantime_serde")]
    pub write_request_timeout_in_ms: Duration,
    #[serde(with = "humantime_serde")]
    pub read_request_timeout_in_ms: Duration,
    #[serde(with = "humantime_serde")]
    pub truncate_request_timeout_in_ms: Duration,
    #[serde(with = "humantime_serde")]
    pub counter_write_request_timeout_in_ms: Duration,

    pub num_tokens: usize,
    pub initial_token: Option<String>,
    pub auto_bootstrap: bool,
    pub join_ring: bool,
    pub consistent_rangemovement: bool,
    pub load_ring_state: bool,
    pub replace_address: Option<String>,
    /// Legacy single-token replace knobs; `replace_address` supersedes
    /// both but they are still accepted.
    pub replace_token: Option<String>,
    pub replace_node: Option<String>,
    pub override_decommission: bool,

    pub disk_failure_policy: FailurePolicy,
    pub commit_failure_policy: FailurePolicy,

    #[serde(with = "humantime_serde")]
    pub shutdown_announce_in_ms: Duration,
    pub skip_wait_for_gossip_to_settle: bool,

    pub endpoint_snitch: SnitchConfig,
    pub server_encryption_options: EncryptionOptions,
    pub client_encryption_options: EncryptionOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "Test Cluster".to_string(),
            listen_address: "127.0.0.1".to_string(),
            seeds: Vec::new(),
            partitioner: "Murmur3Partitioner".to_string(),
            shard_count: 1,
            murmur3_partitioner_ignore_msb_bits: 0,
            ring_delay_ms: Duration::from_secs(30),
            write_request_timeout_in_ms: Duration::from_secs(2),
            read_request_timeout_in_ms: Duration::from_secs(5),
            truncate_request_timeout_in_ms: Duration::from_secs(60),
            counter_write_request_timeout_in_ms: Duration::from_secs(5),
            num_tokens: 8,
            initial_token: None,
            auto_bootstrap: true,
            join_ring: true,
            consistent_rangemovement: true,
            load_ring_state: true,
            replace_address: None,
            replace_token: None,
            replace_node: None,
            override_decommission: false,
            disk_failure_policy: FailurePolicy::Stop,
            commit_failure_policy: FailurePolicy::Stop,
            shutdown_announce_in_ms: Duration::from_secs(2),
            skip_wait_for_gossip_to_settle: false,
            endpoint_snitch: SnitchConfig::default(),
            server_encryption_options: EncryptionOptions::default(),
            client_encryption_options: EncryptionOptions::default(),
        }
    }
}

impl Config {
    pub fn listen_endpoint(&self) -> Result<Endpoint, models::Error> {
        Endpoint::parse(&self.listen_address)
    }

    pub fn seed_endpoints(&self) -> Vec<Endpoint> {
        self.seeds
            .iter()
            .filter_map(|s| Endpoint::parse(s).ok())
            .collect()
    }

    /// Time writes wait for batchlog replay headroom during drain-like
    /// transitions.
    pub fn batchlog_timeout(&self) -> Duration {
        self.write_request_timeout_in_ms * 2
    }
}

/// What to do when the storage layer reports an unrecoverable disk or
/// commitlog error. `Stop` isolates the node by halting transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Stop,
    Ignore,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SnitchConfig {
    pub datacenter: Option<String>,
    pub rack: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EncryptionOptions {
    pub enabled: bool,
    pub certificate: Option<String>,
    pub keyfile: Option<String>,
    pub dh_level: Option<String>,
}

impl Default for EncryptionOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            certificate: None,
            keyfile: None,
            dh_level: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_document() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.num_tokens, 8);
        assert_eq!(cfg.disk_failure_policy, FailurePolicy::Stop);
        assert!(!cfg.server_encryption_options.enabled);
    }

    #[test]
    fn durations_accept_humantime() {
        let cfg: Config = serde_json::from_str(r#"{"ring_delay_ms": "45s"}"#).unwrap();
        assert_eq!(cfg.ring_delay_ms, Duration::from_secs(45));
    }

    #[test]
    fn failure_policy_wire_names() {
        let cfg: Config =
            serde_json::from_str(r#"{"commit_failure_policy": "ignore"}"#).unwrap();
        assert_eq!(cfg.commit_failure_policy, FailurePolicy::Ignore);
    }
}
