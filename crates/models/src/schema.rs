use crate::SpeculativeRetry;
use std::collections::BTreeMap;

/// A keyspace definition: its replication strategy by name plus options,
/// resolved elsewhere against the ring.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KeyspaceDef {
    pub name: String,
    pub strategy_name: String,
    /// Strategy options: `replication_factor` for the simple strategy, or
    /// datacenter-name → factor pairs for the topology-aware one.
    pub strategy_options: BTreeMap<String, String>,
    pub durable_writes: bool,
}

impl KeyspaceDef {
    pub fn simple(name: &str, replication_factor: usize) -> Self {
        Self {
            name: name.to_string(),
            strategy_name: "SimpleStrategy".to_string(),
            strategy_options: BTreeMap::from([(
                "replication_factor".to_string(),
                replication_factor.to_string(),
            )]),
            durable_writes: true,
        }
    }

    pub fn network_topology(name: &str, dc_factors: &[(&str, usize)]) -> Self {
        Self {
            name: name.to_string(),
            strategy_name: "NetworkTopologyStrategy".to_string(),
            strategy_options: dc_factors
                .iter()
                .map(|(dc, rf)| (dc.to_string(), rf.to_string()))
                .collect(),
            durable_writes: true,
        }
    }
}

/// Per-table read-path tuning.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TableDef {
    pub keyspace: String,
    pub name: String,
    pub id: uuid::Uuid,
    pub speculative_retry: SpeculativeRetry,
    /// Chance a read repairs every replica.
    pub read_repair_chance: f64,
    /// Chance a read repairs the local datacenter's replicas.
    pub dc_local_read_repair_chance: f64,
}

impl TableDef {
    pub fn new(keyspace: &str, name: &str) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            id: uuid::Uuid::new_v4(),
            speculative_retry: SpeculativeRetry::default(),
            read_repair_chance: 0.0,
            dc_local_read_repair_chance: 0.1,
        }
    }

    pub fn with_speculative_retry(mut self, retry: SpeculativeRetry) -> Self {
        self.speculative_retry = retry;
        self
    }

    pub fn with_read_repair_chances(mut self, global: f64, dc_local: f64) -> Self {
        self.read_repair_chance = global;
        self.dc_local_read_repair_chance = dc_local;
        self
    }
}
