use crate::{ReplicationStrategy, Topology};
use models::ConsistencyLevel;

fn quorum_of(rf: usize) -> usize {
    rf / 2 + 1
}

/// The number of replica responses a consistency level demands, given the
/// keyspace's replication and the coordinator's datacenter.
pub fn block_for(
    cl: ConsistencyLevel,
    strategy: &ReplicationStrategy,
    _topology: &dyn Topology,
    local_dc: &str,
) -> usize {
    match cl {
        ConsistencyLevel::Any | ConsistencyLevel::One | ConsistencyLevel::LocalOne => 1,
        ConsistencyLevel::Two => 2,
        ConsistencyLevel::Three => 3,
        ConsistencyLevel::Quorum => quorum_of(strategy.replication_factor()),
        ConsistencyLevel::All => strategy.replication_factor(),
        ConsistencyLevel::LocalQuorum => quorum_of(strategy.replication_factor_in(local_dc)),
        ConsistencyLevel::EachQuorum => match strategy {
            ReplicationStrategy::NetworkTopology { dc_factors } => {
                dc_factors.values().map(|rf| quorum_of(*rf)).sum()
            }
            // Degrades to a plain quorum without datacenter awareness.
            ReplicationStrategy::Simple { replication_factor } => quorum_of(*replication_factor),
        },
    }
}
