//! Replica placement: the ring membership tables, replication strategies
//! resolving tokens to natural endpoints, consistency-level accounting,
//! and pending-range computation for in-flight topology changes.

mod consistency;
mod metadata;
mod pending;
mod strategy;
mod topology;

pub use consistency::block_for;
pub use metadata::TokenMetadata;
pub use pending::{calculate_pending_ranges, PendingRanges};
pub use strategy::ReplicationStrategy;
pub use topology::{SimpleTopology, Topology};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported replication strategy: '{0}'")]
    UnknownStrategy(String),
    #[error("strategy option '{option}' is not a valid factor: '{value}'")]
    InvalidFactor { option: String, value: String },
}
