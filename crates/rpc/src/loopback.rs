use crate::{
    CallMeta, CounterMutationRequest, DigestAck, DigestAck2, DigestSyn, Error, MessageSink,
    MutationDone, MutationRequest, PartitionChecksum, ReadDataRequest, ReadDataResponse,
    ReadDigestResponse, RepairChecksumRequest, ReplicationFinished, Result, SchemaVersion,
    StreamComplete, StreamPrepare, Transport, TruncateRequest,
};
use models::{Endpoint, ReadCommand, ReconcilableResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// In-process transport mesh: members bind a [`MessageSink`] under their
/// address and calls are delivered inline. Links can be severed to model
/// partitions and peer death.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    sinks: Mutex<HashMap<Endpoint, Arc<dyn MessageSink>>>,
    // Severed (from, to) links; None in `to` position severs everything
    // toward `from`.
    severed: Mutex<HashSet<(Endpoint, Endpoint)>>,
    isolated: Mutex<HashSet<Endpoint>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, endpoint: Endpoint, sink: Arc<dyn MessageSink>) {
        self.inner.sinks.lock().unwrap().insert(endpoint, sink);
    }

    pub fn unbind(&self, endpoint: Endpoint) {
        self.inner.sinks.lock().unwrap().remove(&endpoint);
    }

    /// Sever the directed link `from → to`.
    pub fn sever(&self, from: Endpoint, to: Endpoint) {
        self.inner.severed.lock().unwrap().insert((from, to));
    }

    pub fn heal(&self, from: Endpoint, to: Endpoint) {
        self.inner.severed.lock().unwrap().remove(&(from, to));
    }

    /// Drop every link touching `endpoint`, simulating node death.
    pub fn isolate(&self, endpoint: Endpoint) {
        self.inner.isolated.lock().unwrap().insert(endpoint);
    }

    pub fn restore(&self, endpoint: Endpoint) {
        self.inner.isolated.lock().unwrap().remove(&endpoint);
    }

    fn sink_for(&self, from: Endpoint, to: Endpoint) -> Result<Arc<dyn MessageSink>> {
        let isolated = self.inner.isolated.lock().unwrap();
        if isolated.contains(&to) || isolated.contains(&from) {
            return Err(Error::ConnectionClosed(to));
        }
        drop(isolated);
        if self.inner.severed.lock().unwrap().contains(&(from, to)) {
            return Err(Error::ConnectionClosed(to));
        }
        self.inner
            .sinks
            .lock()
            .unwrap()
            .get(&to)
            .cloned()
            .ok_or(Error::Unreachable(to))
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn gossip_syn(&self, to: Endpoint, msg: DigestSyn, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?.on_gossip_syn(meta.from, msg).await
    }

    async fn gossip_ack(&self, to: Endpoint, msg: DigestAck, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?.on_gossip_ack(meta.from, msg).await
    }

    async fn gossip_ack2(&self, to: Endpoint, msg: DigestAck2, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_gossip_ack2(meta.from, msg)
            .await
    }

    async fn gossip_echo(&self, to: Endpoint, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?.on_gossip_echo(meta.from).await
    }

    async fn gossip_shutdown(&self, to: Endpoint, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_gossip_shutdown(meta.from)
            .await
    }

    async fn mutation(&self, to: Endpoint, req: MutationRequest, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?.on_mutation(meta.from, req).await
    }

    async fn mutation_done(&self, to: Endpoint, req: MutationDone, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_mutation_done(meta.from, req)
            .await
    }

    async fn counter_mutation(
        &self,
        to: Endpoint,
        req: CounterMutationRequest,
        meta: CallMeta,
    ) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_counter_mutation(meta.from, req)
            .await
    }

    async fn read_data(
        &self,
        to: Endpoint,
        req: ReadDataRequest,
        meta: CallMeta,
    ) -> Result<ReadDataResponse> {
        let from = meta.from;
        self.sink_for(from, to)?.on_read_data(from, req, meta).await
    }

    async fn read_digest(
        &self,
        to: Endpoint,
        req: ReadCommand,
        meta: CallMeta,
    ) -> Result<ReadDigestResponse> {
        let from = meta.from;
        self.sink_for(from, to)?.on_read_digest(from, req, meta).await
    }

    async fn read_mutation_data(
        &self,
        to: Endpoint,
        req: ReadCommand,
        meta: CallMeta,
    ) -> Result<ReconcilableResult> {
        let from = meta.from;
        self.sink_for(from, to)?
            .on_read_mutation_data(from, req, meta)
            .await
    }

    async fn truncate(&self, to: Endpoint, req: TruncateRequest, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?.on_truncate(meta.from, req).await
    }

    async fn replication_finished(
        &self,
        to: Endpoint,
        req: ReplicationFinished,
        meta: CallMeta,
    ) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_replication_finished(meta.from, req)
            .await
    }

    async fn repair_checksum_range(
        &self,
        to: Endpoint,
        req: RepairChecksumRequest,
        meta: CallMeta,
    ) -> Result<PartitionChecksum> {
        self.sink_for(meta.from, to)?
            .on_repair_checksum_range(meta.from, req)
            .await
    }

    async fn schema_check(&self, to: Endpoint, meta: CallMeta) -> Result<SchemaVersion> {
        self.sink_for(meta.from, to)?.on_schema_check(meta.from).await
    }

    async fn definitions_update(
        &self,
        to: Endpoint,
        req: crate::SchemaUpdate,
        meta: CallMeta,
    ) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_definitions_update(meta.from, req)
            .await
    }

    async fn migration_request(
        &self,
        to: Endpoint,
        meta: CallMeta,
    ) -> Result<crate::SchemaUpdate> {
        self.sink_for(meta.from, to)?
            .on_migration_request(meta.from)
            .await
    }

    async fn stream_prepare(&self, to: Endpoint, req: StreamPrepare, meta: CallMeta) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_stream_prepare(meta.from, req)
            .await
    }

    async fn stream_complete(
        &self,
        to: Endpoint,
        req: StreamComplete,
        meta: CallMeta,
    ) -> Result<()> {
        self.sink_for(meta.from, to)?
            .on_stream_complete(meta.from, req)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSink {
        echoes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageSink for EchoSink {
        async fn on_gossip_echo(&self, _from: Endpoint) -> Result<()> {
            self.echoes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    #[tokio::test]
    async fn delivers_to_bound_sinks() {
        let mesh = LoopbackTransport::new();
        let sink = Arc::new(EchoSink {
            echoes: AtomicUsize::new(0),
        });
        mesh.bind(ep("10.0.0.2"), sink.clone());

        mesh.gossip_echo(ep("10.0.0.2"), CallMeta::new(ep("10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(sink.echoes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let mesh = LoopbackTransport::new();
        let err = mesh
            .gossip_echo(ep("10.0.0.9"), CallMeta::new(ep("10.0.0.1")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn isolation_severs_both_directions() {
        let mesh = LoopbackTransport::new();
        let sink = Arc::new(EchoSink {
            echoes: AtomicUsize::new(0),
        });
        mesh.bind(ep("10.0.0.2"), sink.clone());
        mesh.isolate(ep("10.0.0.2"));

        let err = mesh
            .gossip_echo(ep("10.0.0.2"), CallMeta::new(ep("10.0.0.1")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));

        mesh.restore(ep("10.0.0.2"));
        mesh.gossip_echo(ep("10.0.0.2"), CallMeta::new(ep("10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(sink.echoes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhandled_verbs_report_unimplemented() {
        let mesh = LoopbackTransport::new();
        mesh.bind(
            ep("10.0.0.2"),
            Arc::new(EchoSink {
                echoes: AtomicUsize::new(0),
            }),
        );
        let err = mesh
            .schema_check(ep("10.0.0.2"), CallMeta::new(ep("10.0.0.1")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unimplemented(crate::Verb::SchemaCheck)));
    }
}
