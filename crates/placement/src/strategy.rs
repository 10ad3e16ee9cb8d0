use crate::{Error, TokenMetadata, Topology};
use models::{Endpoint, KeyspaceDef};
use partition::Token;
use std::collections::{BTreeMap, HashMap, HashSet};

/// How a keyspace replicates: a flat factor over the whole ring, or a
/// per-datacenter factor with rack diversity.
///
/// Strategies resolve from their configured name through an explicit
/// dispatch table; new strategies register in [`ReplicationStrategy::from_def`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStrategy {
    Simple {
        replication_factor: usize,
    },
    NetworkTopology {
        dc_factors: BTreeMap<String, usize>,
    },
}

impl ReplicationStrategy {
    pub fn from_def(def: &KeyspaceDef) -> Result<Self, Error> {
        let parse = |option: &str, value: &str| -> Result<usize, Error> {
            value.parse::<usize>().map_err(|_| Error::InvalidFactor {
                option: option.to_string(),
                value: value.to_string(),
            })
        };
        let short = def
            .strategy_name
            .rsplit('.')
            .next()
            .unwrap_or(&def.strategy_name);
        match short {
            "SimpleStrategy" => {
                let rf = match def.strategy_options.get("replication_factor") {
                    Some(value) => parse("replication_factor", value)?,
                    None => 1,
                };
                Ok(Self::Simple {
                    replication_factor: rf,
                })
            }
            "NetworkTopologyStrategy" => {
                let mut dc_factors = BTreeMap::new();
                for (dc, value) in &def.strategy_options {
                    if dc == "replication_factor" {
                        continue;
                    }
                    dc_factors.insert(dc.clone(), parse(dc, value)?);
                }
                Ok(Self::NetworkTopology { dc_factors })
            }
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }

    /// Total replica count across the cluster.
    pub fn replication_factor(&self) -> usize {
        match self {
            Self::Simple { replication_factor } => *replication_factor,
            Self::NetworkTopology { dc_factors } => dc_factors.values().sum(),
        }
    }

    /// Replica count within one datacenter.
    pub fn replication_factor_in(&self, dc: &str) -> usize {
        match self {
            Self::Simple { replication_factor } => *replication_factor,
            Self::NetworkTopology { dc_factors } => dc_factors.get(dc).copied().unwrap_or(0),
        }
    }

    pub fn datacenters(&self) -> Option<Vec<&str>> {
        match self {
            Self::Simple { .. } => None,
            Self::NetworkTopology { dc_factors } => {
                Some(dc_factors.keys().map(String::as_str).collect())
            }
        }
    }

    /// Natural endpoints of `token`: distinct owners found walking the ring
    /// from the first token at or past it.
    ///
    /// The topology-aware strategy fills each datacenter's quota
    /// independently, preferring owners on racks not yet represented in
    /// that datacenter.
    pub fn natural_endpoints(
        &self,
        token: &Token,
        ring: &TokenMetadata,
        topology: &dyn Topology,
    ) -> Vec<Endpoint> {
        match self {
            Self::Simple { replication_factor } => {
                let mut out = Vec::new();
                let mut seen = HashSet::new();
                for t in ring.ring_iter(token) {
                    let Some(ep) = ring.owner(t) else { continue };
                    if seen.insert(ep) {
                        out.push(ep);
                        if out.len() >= *replication_factor {
                            break;
                        }
                    }
                }
                out
            }
            Self::NetworkTopology { dc_factors } => {
                let mut out: Vec<Endpoint> = Vec::new();
                let mut per_dc: HashMap<&str, Vec<Endpoint>> = HashMap::new();
                let mut skipped: HashMap<&str, Vec<Endpoint>> = HashMap::new();
                let mut racks_seen: HashMap<&str, HashSet<String>> = HashMap::new();

                let want = |per_dc: &HashMap<&str, Vec<Endpoint>>| {
                    dc_factors
                        .iter()
                        .any(|(dc, rf)| per_dc.get(dc.as_str()).map_or(0, Vec::len) < *rf)
                };

                for t in ring.ring_iter(token) {
                    if !want(&per_dc) {
                        break;
                    }
                    let Some(ep) = ring.owner(t) else { continue };
                    let dc_owned = topology.datacenter(ep);
                    let Some((dc, rf)) = dc_factors.get_key_value(dc_owned.as_str()) else {
                        continue;
                    };
                    let chosen = per_dc.entry(dc.as_str()).or_default();
                    if chosen.len() >= *rf || chosen.contains(&ep) {
                        continue;
                    }
                    let rack = topology.rack(ep);
                    let racks = racks_seen.entry(dc.as_str()).or_default();
                    if racks.contains(&rack) {
                        // Hold rack-duplicates back until distinct racks run out.
                        let held = skipped.entry(dc.as_str()).or_default();
                        if !held.contains(&ep) {
                            held.push(ep);
                        }
                        continue;
                    }
                    racks.insert(rack);
                    chosen.push(ep);
                    out.push(ep);
                }

                // Fill remaining quota from rack-duplicates, ring order.
                for (dc, rf) in dc_factors {
                    let chosen = per_dc.entry(dc.as_str()).or_default();
                    if let Some(held) = skipped.get(dc.as_str()) {
                        for ep in held {
                            if chosen.len() >= *rf {
                                break;
                            }
                            if !chosen.contains(ep) {
                                chosen.push(*ep);
                                out.push(*ep);
                            }
                        }
                    }
                }
                out
            }
        }
    }
}
