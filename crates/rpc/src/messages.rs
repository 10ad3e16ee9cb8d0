use models::{
    ConsistencyLevel, Endpoint, EndpointState, GossipDigest, HostId, Mutation, QueryResult,
    ReadCommand, ResultDigest,
};
use partition::TokenRange;

/// Initiator's digest list plus the cluster and partitioner names, which
/// the receiver validates before reconciling.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DigestSyn {
    pub cluster_name: String,
    pub partitioner_name: String,
    pub digests: Vec<GossipDigest>,
}

/// Receiver's reply: digests it wants state for, plus state deltas it
/// already knows the initiator lacks.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct DigestAck {
    pub requested: Vec<GossipDigest>,
    pub states: Vec<(Endpoint, EndpointState)>,
}

/// Final push of the three-way exchange.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct DigestAck2 {
    pub states: Vec<(Endpoint, EndpointState)>,
}

/// Coordinator → replica write. `forward_to` asks the recipient to relay
/// the mutation to datacenter-mates, saving cross-datacenter sends.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MutationRequest {
    pub mutation: Mutation,
    pub response_id: u64,
    /// Shard of the originating coordinator; acknowledgements route back
    /// to it.
    pub shard: u32,
    pub reply_to: Endpoint,
    pub forward_to: Vec<Endpoint>,
}

/// Replica → coordinator acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MutationDone {
    pub response_id: u64,
    pub shard: u32,
    pub from: Endpoint,
}

/// Batch of counter mutations applied synchronously by the leader replica,
/// which then replicates the resulting deltas at `cl`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CounterMutationRequest {
    pub mutations: Vec<Mutation>,
    pub cl: ConsistencyLevel,
}

/// Full data read; the reply optionally carries a digest too.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReadDataRequest {
    pub command: ReadCommand,
    pub digest_requested: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReadDataResponse {
    pub result: QueryResult,
    pub digest: Option<ResultDigest>,
}

/// Digest-only read reply.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReadDigestResponse {
    pub digest: ResultDigest,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TruncateRequest {
    pub keyspace: String,
    pub table: String,
}

/// Range-hash reply used by repair to compare replica content cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionChecksum(pub u64);

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RepairChecksumRequest {
    pub keyspace: String,
    pub table: String,
    pub range: TokenRange,
}

/// Control-plane messages of the bulk streamer. Only the shapes needed by
/// the lifecycle operations are modeled; payload transfer is external.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamPrepare {
    pub plan_id: uuid::Uuid,
    pub description: String,
    /// Ranges the initiator will push, per keyspace.
    pub sending: Vec<(String, Vec<TokenRange>)>,
    /// Ranges the initiator asks the peer to push back.
    pub requesting: Vec<(String, Vec<TokenRange>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamComplete {
    pub plan_id: uuid::Uuid,
    pub success: bool,
}

/// Schema registry plumbing.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchemaVersion(pub uuid::Uuid);

/// Definition push (or reply to a migration request): the full keyspace
/// and table definitions of the sender.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct SchemaUpdate {
    pub keyspaces: Vec<models::KeyspaceDef>,
    pub tables: Vec<models::TableDef>,
}

/// Notification that a peer finished re-replicating data for a node
/// removal coordinated by `coordinator`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicationFinished {
    pub coordinator: Endpoint,
    pub removed_host: HostId,
}
