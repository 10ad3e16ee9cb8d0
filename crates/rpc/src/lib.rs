//! The messaging contract between cluster members: typed verbs with their
//! request and reply schemas, per-call metadata, the error taxonomy exposed
//! through the native protocol, and an in-process loopback transport used
//! by tests.
//!
//! The raw wire (connection management, framing, encryption) lives behind
//! the [`Transport`] trait and is supplied by the embedding process.

mod error;
mod loopback;
mod messages;
mod transport;

pub use error::{Error, ExceptionCode, Result};
pub use loopback::LoopbackTransport;
pub use messages::*;
pub use transport::{CallMeta, MessageSink, Transport};

/// Typed verbs of the inter-node protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Verb {
    GossipDigestSyn,
    GossipDigestAck,
    GossipDigestAck2,
    GossipEcho,
    GossipShutdown,
    Mutation,
    MutationDone,
    CounterMutation,
    ReadData,
    ReadDigest,
    ReadMutationData,
    Truncate,
    ReplicationFinished,
    RepairChecksumRange,
    SchemaCheck,
    GetSchemaVersion,
    DefinitionsUpdate,
    MigrationRequest,
    PrepareMessage,
    PrepareDoneMessage,
    StreamMutation,
    StreamMutationDone,
    CompleteMessage,
}

/// Retry policy applied to the bulk-streaming control verbs.
pub mod streaming {
    use std::time::Duration;

    pub const TIMEOUT: Duration = Duration::from_secs(10 * 60);
    pub const NR_RETRY: usize = 10;
    pub const RETRY_WAIT: Duration = Duration::from_secs(30);
}
