use crate::{
    CounterMutationRequest, DigestAck, DigestAck2, DigestSyn, MutationDone, MutationRequest,
    PartitionChecksum, ReadDataRequest, ReadDataResponse, ReadDigestResponse, RepairChecksumRequest,
    ReplicationFinished, Result, SchemaVersion, StreamComplete, StreamPrepare, TruncateRequest,
    Verb,
};
use models::{Endpoint, ReadCommand, ReconcilableResult};

/// Auxiliary metadata carried by every call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallMeta {
    /// Broadcast address of the caller.
    pub from: Endpoint,
    /// Shard of the caller; replies and acknowledgements route back to it.
    pub shard: u32,
    /// Budget for the reply size, in bytes.
    pub max_result_size: u64,
    /// Opaque tracing session, propagated when present.
    pub trace: Option<uuid::Uuid>,
}

impl CallMeta {
    pub fn new(from: Endpoint) -> Self {
        Self {
            from,
            shard: 0,
            max_result_size: u64::MAX,
            trace: None,
        }
    }
}

/// Outbound half of the messaging service: one method per verb.
///
/// One-way verbs resolve as soon as the message is handed to the wire;
/// request/reply verbs resolve with the peer's typed reply. Transport
/// failures surface as [`crate::Error::ConnectionClosed`] or
/// [`crate::Error::RpcTimeout`] and are handled by callers like peer death.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    // Gossip plane.
    async fn gossip_syn(&self, to: Endpoint, msg: DigestSyn, meta: CallMeta) -> Result<()>;
    async fn gossip_ack(&self, to: Endpoint, msg: DigestAck, meta: CallMeta) -> Result<()>;
    async fn gossip_ack2(&self, to: Endpoint, msg: DigestAck2, meta: CallMeta) -> Result<()>;
    /// Liveness probe; an empty reply proves the peer's inbound path works.
    async fn gossip_echo(&self, to: Endpoint, meta: CallMeta) -> Result<()>;
    async fn gossip_shutdown(&self, to: Endpoint, meta: CallMeta) -> Result<()>;

    // Write plane.
    async fn mutation(&self, to: Endpoint, req: MutationRequest, meta: CallMeta) -> Result<()>;
    async fn mutation_done(&self, to: Endpoint, req: MutationDone, meta: CallMeta) -> Result<()>;
    async fn counter_mutation(
        &self,
        to: Endpoint,
        req: CounterMutationRequest,
        meta: CallMeta,
    ) -> Result<()>;

    // Read plane.
    async fn read_data(
        &self,
        to: Endpoint,
        req: ReadDataRequest,
        meta: CallMeta,
    ) -> Result<ReadDataResponse>;
    async fn read_digest(
        &self,
        to: Endpoint,
        req: ReadCommand,
        meta: CallMeta,
    ) -> Result<ReadDigestResponse>;
    async fn read_mutation_data(
        &self,
        to: Endpoint,
        req: ReadCommand,
        meta: CallMeta,
    ) -> Result<ReconcilableResult>;

    // Maintenance.
    async fn truncate(&self, to: Endpoint, req: TruncateRequest, meta: CallMeta) -> Result<()>;
    async fn replication_finished(
        &self,
        to: Endpoint,
        req: ReplicationFinished,
        meta: CallMeta,
    ) -> Result<()>;
    async fn repair_checksum_range(
        &self,
        to: Endpoint,
        req: RepairChecksumRequest,
        meta: CallMeta,
    ) -> Result<PartitionChecksum>;

    // Schema plumbing.
    async fn schema_check(&self, to: Endpoint, meta: CallMeta) -> Result<SchemaVersion>;
    async fn definitions_update(
        &self,
        to: Endpoint,
        req: crate::SchemaUpdate,
        meta: CallMeta,
    ) -> Result<()>;
    async fn migration_request(&self, to: Endpoint, meta: CallMeta)
        -> Result<crate::SchemaUpdate>;

    // Streaming control plane.
    async fn stream_prepare(&self, to: Endpoint, req: StreamPrepare, meta: CallMeta) -> Result<()>;
    async fn stream_complete(
        &self,
        to: Endpoint,
        req: StreamComplete,
        meta: CallMeta,
    ) -> Result<()>;
}

/// Inbound half: what a member exposes to its peers. Implementations
/// override the verbs they serve; the rest reject with `Unimplemented`.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn on_gossip_syn(&self, _from: Endpoint, _msg: DigestSyn) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::GossipDigestSyn))
    }
    async fn on_gossip_ack(&self, _from: Endpoint, _msg: DigestAck) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::GossipDigestAck))
    }
    async fn on_gossip_ack2(&self, _from: Endpoint, _msg: DigestAck2) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::GossipDigestAck2))
    }
    async fn on_gossip_echo(&self, _from: Endpoint) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::GossipEcho))
    }
    async fn on_gossip_shutdown(&self, _from: Endpoint) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::GossipShutdown))
    }

    async fn on_mutation(&self, _from: Endpoint, _req: MutationRequest) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::Mutation))
    }
    async fn on_mutation_done(&self, _from: Endpoint, _req: MutationDone) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::MutationDone))
    }
    async fn on_counter_mutation(
        &self,
        _from: Endpoint,
        _req: CounterMutationRequest,
    ) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::CounterMutation))
    }

    async fn on_read_data(
        &self,
        _from: Endpoint,
        _req: ReadDataRequest,
        _meta: CallMeta,
    ) -> Result<ReadDataResponse> {
        Err(crate::Error::Unimplemented(Verb::ReadData))
    }
    async fn on_read_digest(
        &self,
        _from: Endpoint,
        _req: ReadCommand,
        _meta: CallMeta,
    ) -> Result<ReadDigestResponse> {
        Err(crate::Error::Unimplemented(Verb::ReadDigest))
    }
    async fn on_read_mutation_data(
        &self,
        _from: Endpoint,
        _req: ReadCommand,
        _meta: CallMeta,
    ) -> Result<ReconcilableResult> {
        Err(crate::Error::Unimplemented(Verb::ReadMutationData))
    }

    async fn on_truncate(&self, _from: Endpoint, _req: TruncateRequest) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::Truncate))
    }
    async fn on_replication_finished(
        &self,
        _from: Endpoint,
        _req: ReplicationFinished,
    ) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::ReplicationFinished))
    }
    async fn on_repair_checksum_range(
        &self,
        _from: Endpoint,
        _req: RepairChecksumRequest,
    ) -> Result<PartitionChecksum> {
        Err(crate::Error::Unimplemented(Verb::RepairChecksumRange))
    }

    async fn on_schema_check(&self, _from: Endpoint) -> Result<SchemaVersion> {
        Err(crate::Error::Unimplemented(Verb::SchemaCheck))
    }
    async fn on_definitions_update(
        &self,
        _from: Endpoint,
        _req: crate::SchemaUpdate,
    ) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::DefinitionsUpdate))
    }
    async fn on_migration_request(&self, _from: Endpoint) -> Result<crate::SchemaUpdate> {
        Err(crate::Error::Unimplemented(Verb::MigrationRequest))
    }

    async fn on_stream_prepare(&self, _from: Endpoint, _req: StreamPrepare) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::PrepareMessage))
    }
    async fn on_stream_complete(&self, _from: Endpoint, _req: StreamComplete) -> Result<()> {
        Err(crate::Error::Unimplemented(Verb::CompleteMessage))
    }
}
