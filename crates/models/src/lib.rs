//! Shared model types of the coordinator core: node identity, consistency
//! levels, schema definitions, and the wide-column mutation / partition /
//! row data model over which writes replicate and reads reconcile.

mod consistency;
mod endpoint;
mod gossip;
mod mutation;
mod query;
mod schema;

pub use consistency::{ConsistencyLevel, ReadRepairDecision, SpeculativeRetry, WriteType};
pub use gossip::{
    tokens_value, tokens_wire, ApplicationState, EndpointState, GossipDigest, HeartbeatState,
    Status, VersionedValue,
};
pub use endpoint::{Endpoint, HostId};
pub use mutation::{Cell, ClusteringKey, DecoratedKey, Mutation, Partition, Row};
pub use query::{
    repair_mutation, rows_of, QueryResult, ReadCommand, ReconcilablePartition, ReconcilableResult,
    ResultDigest, ResultRow,
};
pub use schema::{KeyspaceDef, TableDef};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("'{0}' is not a valid endpoint address")]
    InvalidEndpoint(String),
    #[error("'{0}' is not a valid consistency level")]
    InvalidConsistency(String),
}
