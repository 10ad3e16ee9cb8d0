use crate::{BootstrapState, Config, FailurePolicy, PeerInfo, Streamer, SystemTables, TransferPlan};
use coordinator::{HintSink, SchemaRegistry, StorageEngine, StorageProxy};
use gossip::{FailureDetector, GossipConfig, GossipSubscriber, Gossiper, RingView};
use models::{tokens_wire, ApplicationState, Endpoint, EndpointState, HostId, Status, VersionedValue};
use partition::{partitioner_from_name, Partitioner, Token};
use placement::{calculate_pending_ranges, TokenMetadata, Topology};
use rpc::{CallMeta, MessageSink, ReplicationFinished, Transport};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Features this build understands; gossiped and intersected across the
/// cluster before a node may join.
pub const NATIVE_FEATURES: &[&str] = &[
    "RANGE_TOMBSTONES",
    "COUNTERS",
    "DIGEST_MULTIPARTITION_READ",
    "SCHEMA_TABLES_V3",
];

/// Operator-visible lifecycle mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Starting,
    Joining,
    Normal,
    Leaving,
    Decommissioned,
    Moving,
    Draining,
    Drained,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Starting => "STARTING",
            Mode::Joining => "JOINING",
            Mode::Normal => "NORMAL",
            Mode::Leaving => "LEAVING",
            Mode::Decommissioned => "DECOMMISSIONED",
            Mode::Moving => "MOVING",
            Mode::Draining => "DRAINING",
            Mode::Drained => "DRAINED",
        };
        f.write_str(s)
    }
}

struct RemovalWait {
    host_id: HostId,
    expected: BTreeSet<Endpoint>,
}

pub(crate) struct Inner {
    cfg: Config,
    local: Endpoint,
    host_id: HostId,
    partitioner: Arc<dyn Partitioner>,
    topology: Arc<dyn Topology>,
    schema: Arc<SchemaRegistry>,
    system: Arc<dyn SystemTables>,
    streamer: Arc<dyn Streamer>,
    transport: Arc<dyn Transport>,
    gossiper: Gossiper,
    fd: Arc<FailureDetector>,
    proxy: StorageProxy,
    mode: Mutex<Mode>,
    tm: Mutex<TokenMetadata>,
    ring_tx: watch::Sender<Arc<TokenMetadata>>,
    removal: Mutex<Option<RemovalWait>>,
    removal_done: tokio::sync::Notify,
    isolated: AtomicBool,
}

/// The node's lifecycle controller. It owns the components of the
/// coordinator core and is the single writer of ring membership: every
/// topology-changing gossip event lands here, updates the token metadata,
/// recomputes pending ranges, and publishes the new snapshot to every
/// reader atomically.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

struct GossipLiveness(Gossiper);

impl coordinator::Liveness for GossipLiveness {
    fn is_alive(&self, endpoint: Endpoint) -> bool {
        self.0.is_alive(endpoint)
    }
}

struct MembershipView(Weak<Inner>);

impl RingView for MembershipView {
    fn is_member(&self, endpoint: Endpoint) -> bool {
        match self.0.upgrade() {
            Some(inner) => inner.tm.lock().unwrap().is_member(endpoint),
            None => false,
        }
    }
}

impl Cluster {
    pub fn new(
        cfg: Config,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn StorageEngine>,
        system: Arc<dyn SystemTables>,
        streamer: Arc<dyn Streamer>,
        topology: Arc<dyn Topology>,
        hints: Arc<dyn HintSink>,
    ) -> anyhow::Result<Cluster> {
        use anyhow::Context;

        let local = cfg.listen_endpoint().context("bad listen_address")?;
        let partitioner = partitioner_from_name(
            &cfg.partitioner,
            cfg.shard_count,
            cfg.murmur3_partitioner_ignore_msb_bits,
        )
        .context("unsupported partitioner")?;
        let schema = Arc::new(SchemaRegistry::new(partitioner.clone()));
        let host_id = system.host_id();

        let fd = Arc::new(FailureDetector::new(8.0));
        let gossip_cfg = GossipConfig {
            cluster_name: cfg.cluster_name.clone(),
            partitioner_name: cfg.partitioner.clone(),
            seeds: cfg.seed_endpoints().into_iter().collect(),
            ring_delay: cfg.ring_delay_ms,
            phi_threshold: 8.0,
            shadow_round_timeout: cfg.ring_delay_ms * 10,
        };
        let gossiper = Gossiper::new(gossip_cfg, local, transport.clone(), fd.clone());

        let (ring_tx, ring_rx) = watch::channel(Arc::new(TokenMetadata::new()));
        let proxy_cfg = coordinator::ProxyConfig {
            local_dc: topology.datacenter(local),
            write_timeout: cfg.write_request_timeout_in_ms,
            read_timeout: cfg.read_request_timeout_in_ms,
            counter_write_timeout: cfg.counter_write_request_timeout_in_ms,
            truncate_timeout: cfg.truncate_request_timeout_in_ms,
            ..coordinator::ProxyConfig::default()
        };
        let proxy = StorageProxy::new(
            proxy_cfg,
            local,
            0,
            transport.clone(),
            schema.clone(),
            engine,
            topology.clone(),
            hints,
            Arc::new(GossipLiveness(gossiper.clone())),
            ring_rx,
        );

        let inner = Arc::new(Inner {
            cfg,
            local,
            host_id,
            partitioner,
            topology,
            schema,
            system,
            streamer,
            transport,
            gossiper: gossiper.clone(),
            fd,
            proxy,
            mode: Mutex::new(Mode::Starting),
            tm: Mutex::new(TokenMetadata::new()),
            ring_tx,
            removal: Mutex::new(None),
            removal_done: tokio::sync::Notify::new(),
            isolated: AtomicBool::new(false),
        });

        gossiper.register(Arc::new(ClusterSubscriber {
            inner: Arc::downgrade(&inner),
        }));
        gossiper.set_ring_view(Arc::new(MembershipView(Arc::downgrade(&inner))));

        Ok(Cluster { inner })
    }

    /// The node's inbound message surface, to be bound on the transport.
    pub fn message_sink(&self) -> Arc<dyn MessageSink> {
        Arc::new(NodeSink {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.inner.local
    }

    pub fn host_id(&self) -> HostId {
        self.inner.host_id
    }

    pub fn mode(&self) -> Mode {
        *self.inner.mode.lock().unwrap()
    }

    pub fn gossiper(&self) -> &Gossiper {
        &self.inner.gossiper
    }

    pub fn failure_detector(&self) -> &Arc<FailureDetector> {
        &self.inner.fd
    }

    pub fn proxy(&self) -> &StorageProxy {
        &self.inner.proxy
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.inner.schema
    }

    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.inner.partitioner
    }

    /// Latest published ring snapshot.
    pub fn token_metadata(&self) -> Arc<TokenMetadata> {
        self.inner.ring_tx.borrow().clone()
    }

    fn set_mode(&self, mode: Mode) {
        let mut current = self.inner.mode.lock().unwrap();
        let previous = *current;
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "mode change");
            *current = mode;
        }
    }

    // Single writer of ring state: mutate, recompute pending ranges per
    // keyspace, publish the snapshot whole.
    fn with_ring(&self, f: impl FnOnce(&mut TokenMetadata)) {
        let inner = &self.inner;
        let mut tm = inner.tm.lock().unwrap();
        f(&mut tm);
        for keyspace in inner.schema.keyspaces() {
            if let Some(strategy) = inner.schema.strategy(&keyspace) {
                let pending =
                    calculate_pending_ranges(&tm, &strategy, inner.topology.as_ref());
                tm.set_pending_ranges(&keyspace, Arc::new(pending));
            }
        }
        inner.ring_tx.send_replace(Arc::new(tm.clone()));
    }

    /// Recompute pending ranges (e.g. after a replication change) without
    /// touching membership.
    pub fn recompute_pending_ranges(&self) {
        self.with_ring(|_| {});
    }

    fn local_features() -> BTreeSet<String> {
        NATIVE_FEATURES.iter().map(|f| f.to_string()).collect()
    }

    // ---- joining ----

    /// Bring this node into the ring: shadow round, feature check, token
    /// selection, optional bootstrap streaming, then NORMAL.
    pub async fn join_cluster(&self) -> anyhow::Result<()> {
        use anyhow::Context;
        let inner = &self.inner;

        let generation = inner.system.increment_generation();
        let replace_address = match &inner.cfg.replace_address {
            Some(addr) => Some(Endpoint::parse(addr).context("bad replace_address")?),
            None => None,
        };

        // Learn the cluster's view without joining it.
        inner.gossiper.do_shadow_round().await.context("shadow round")?;
        inner
            .gossiper
            .check_knows_remote_features(&Self::local_features())
            .context("this node lacks features the cluster already enabled")?;
        let shadow = inner.gossiper.endpoint_states();
        let ring_populated = shadow.keys().any(|ep| *ep != inner.local);

        let (tokens, replacing) = if let Some(dead) = replace_address {
            let state = shadow
                .get(&dead)
                .context("replace_address is not known to the cluster")?;
            let tokens = state
                .tokens()
                .context("replace target advertises no tokens")?;
            tracing::info!(%dead, count = tokens.len(), "replacing node, assuming its tokens");
            (tokens, true)
        } else {
            let saved = inner.system.load_tokens();
            let tokens = if !saved.is_empty() && inner.cfg.load_ring_state {
                saved
            } else {
                self.choose_tokens()?
            };
            (tokens, false)
        };

        inner.gossiper.reset_endpoint_state_map();
        inner.gossiper.finish_shadow_round();
        inner.gossiper.start(generation, self.startup_states());
        self.set_mode(Mode::Joining);

        if !inner.cfg.skip_wait_for_gossip_to_settle && ring_populated {
            inner.gossiper.wait_for_gossip_to_settle().await;
        }

        let should_bootstrap = inner.cfg.auto_bootstrap
            && ring_populated
            && !replacing
            && inner.system.bootstrap_state() != BootstrapState::Completed;

        if replacing {
            // Take over a dead peer's tokens while hidden from clients.
            self.announce_tokens(&tokens);
            self.announce_status(Status::Hibernate);
            tokio::time::sleep(inner.cfg.ring_delay_ms).await;
            inner.system.set_bootstrap_state(BootstrapState::InProgress);
            inner
                .streamer
                .bootstrap(self.bootstrap_plans(&tokens))
                .await
                .context("replacement streaming")?;
            inner.system.set_bootstrap_state(BootstrapState::Completed);
        } else if should_bootstrap {
            self.announce_tokens(&tokens);
            self.announce_status(Status::Bootstrapping(tokens.clone()));
            self.with_ring(|tm| tm.add_bootstrap_tokens(tokens.clone(), inner.local));
            // Let the ring learn about us before data moves.
            tokio::time::sleep(inner.cfg.ring_delay_ms).await;
            inner.system.set_bootstrap_state(BootstrapState::InProgress);
            inner
                .streamer
                .bootstrap(self.bootstrap_plans(&tokens))
                .await
                .context("bootstrap streaming")?;
            inner.system.set_bootstrap_state(BootstrapState::Completed);
        }

        inner.system.save_tokens(&tokens);
        self.with_ring(|tm| {
            tm.update_host_id(inner.host_id, inner.local);
            tm.update_normal_tokens(tokens.clone(), inner.local);
        });
        self.announce_tokens(&tokens);
        self.announce_status(Status::Normal(tokens));
        self.set_mode(Mode::Normal);
        tracing::info!("node is now in NORMAL state");
        Ok(())
    }

    fn choose_tokens(&self) -> anyhow::Result<Vec<Token>> {
        use anyhow::Context;
        let inner = &self.inner;
        if let Some(initial) = &inner.cfg.initial_token {
            let value = initial
                .trim()
                .parse::<u64>()
                .context("initial_token must be an unsigned 64-bit value")?;
            return Ok(vec![Token::from_u64(value)]);
        }
        let mut tokens = Vec::with_capacity(inner.cfg.num_tokens);
        let mut rng = rand::thread_rng();
        for _ in 0..inner.cfg.num_tokens.max(1) {
            tokens.push(Token::from_u64(rand::Rng::gen(&mut rng)));
        }
        Ok(tokens)
    }

    fn startup_states(&self) -> Vec<(ApplicationState, String)> {
        let inner = &self.inner;
        vec![
            (ApplicationState::HostId, inner.host_id.to_string()),
            (
                ApplicationState::Dc,
                inner.topology.datacenter(inner.local),
            ),
            (ApplicationState::Rack, inner.topology.rack(inner.local)),
            (
                ApplicationState::SupportedFeatures,
                NATIVE_FEATURES.join(","),
            ),
            (ApplicationState::NetVersion, "1".to_string()),
            (
                ApplicationState::RpcAddress,
                inner.local.to_string(),
            ),
            (
                ApplicationState::ShardCount,
                inner.cfg.shard_count.to_string(),
            ),
            (
                ApplicationState::ReleaseVersion,
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        ]
    }

    fn announce_tokens(&self, tokens: &[Token]) {
        self.inner
            .gossiper
            .add_local_application_state(ApplicationState::Tokens, tokens_wire(tokens));
    }

    fn announce_status(&self, status: Status) {
        self.inner
            .gossiper
            .add_local_application_state(ApplicationState::Status, status.to_wire());
    }

    // Ranges this node will own with `tokens`, fetched from their present
    // replicas.
    fn bootstrap_plans(&self, tokens: &[Token]) -> Vec<TransferPlan> {
        let inner = &self.inner;
        let mut plans = Vec::new();
        // Work on a snapshot: liveness checks below reach into gossip.
        let tm = inner.tm.lock().unwrap().clone();
        for keyspace in inner.schema.keyspaces() {
            let Some(strategy) = inner.schema.strategy(&keyspace) else {
                continue;
            };
            let mut settled = tm.clone_only_token_map();
            settled.update_normal_tokens(tokens.to_vec(), inner.local);
            let mut transfers = Vec::new();
            for range in settled.token_ranges() {
                let probe = match &range.end {
                    Some(bound) => bound.value.clone(),
                    None => continue,
                };
                let future =
                    strategy.natural_endpoints(&probe, &settled, inner.topology.as_ref());
                if !future.contains(&inner.local) {
                    continue;
                }
                // Fetch from any current replica of the range.
                if let Some(source) = strategy
                    .natural_endpoints(&probe, &tm, inner.topology.as_ref())
                    .into_iter()
                    .find(|ep| inner.gossiper.is_alive(*ep))
                {
                    transfers.push((range.clone(), source));
                }
            }
            if !transfers.is_empty() {
                plans.push(TransferPlan {
                    keyspace,
                    transfers,
                });
            }
        }
        plans
    }

    // ---- decommission ----

    /// Leave the ring gracefully, pushing owned ranges to their future
    /// replicas first.
    pub async fn decommission(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        anyhow::ensure!(
            self.token_metadata().is_member(inner.local),
            "local node is not a ring member"
        );
        if !inner.cfg.override_decommission {
            for keyspace in inner.schema.keyspaces() {
                let pending = self
                    .token_metadata()
                    .get_pending_ranges(&keyspace, inner.local);
                anyhow::ensure!(
                    pending.is_empty(),
                    "data is currently moving to this node; retry when the ring is stable"
                );
            }
        }

        self.set_mode(Mode::Leaving);
        let tokens = self.token_metadata().tokens_of(inner.local);
        self.with_ring(|tm| tm.add_leaving_endpoint(inner.local));
        self.announce_status(Status::Leaving(tokens.clone()));

        // Let in-flight writes targeting the old topology finish.
        let wait = inner.cfg.ring_delay_ms.max(inner.cfg.batchlog_timeout());
        tokio::time::sleep(wait).await;

        let plans = self.leave_transfer_plans();
        inner.streamer.stream_ranges(plans).await?;
        inner.system.replay_batchlog();
        inner.streamer.stream_hints().await?;

        let expire = Self::expire_millis();
        self.announce_status(Status::Left(tokens, expire));
        tokio::time::sleep(inner.cfg.shutdown_announce_in_ms).await;
        inner.gossiper.stop().await;
        self.set_mode(Mode::Decommissioned);
        tracing::info!("decommissioned");
        Ok(())
    }

    fn expire_millis() -> i64 {
        let expire = SystemTime::now() + gossip::A_VERY_LONG_TIME;
        expire
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    // Everything other endpoints stand to gain once this node leaves is
    // exactly what it must push before going.
    fn leave_transfer_plans(&self) -> Vec<TransferPlan> {
        let inner = &self.inner;
        let tm = inner.tm.lock().unwrap();
        let mut plans = Vec::new();
        for keyspace in inner.schema.keyspaces() {
            let Some(strategy) = inner.schema.strategy(&keyspace) else {
                continue;
            };
            let pending = calculate_pending_ranges(&tm, &strategy, inner.topology.as_ref());
            let mut transfers = Vec::new();
            for gainer in pending.endpoints().collect::<Vec<_>>() {
                for range in pending.ranges_of(gainer) {
                    transfers.push((range, gainer));
                }
            }
            if !transfers.is_empty() {
                plans.push(TransferPlan {
                    keyspace,
                    transfers,
                });
            }
        }
        plans
    }

    // ---- removenode ----

    /// Forcibly remove a dead peer by host id: surviving replicas
    /// re-replicate its ranges and acknowledge with REPLICATION_FINISHED
    /// before its tokens are excised everywhere.
    pub async fn remove_node(&self, host_id: HostId) -> anyhow::Result<()> {
        let inner = &self.inner;
        anyhow::ensure!(
            host_id != inner.host_id,
            "cannot remove the local node; decommission instead"
        );
        let endpoint = self
            .token_metadata()
            .endpoint_for_host_id(host_id)
            .ok_or_else(|| anyhow::anyhow!("no ring member has host id {host_id}"))?;
        anyhow::ensure!(
            !inner.gossiper.is_alive(endpoint),
            "{endpoint} is alive; decommission it instead"
        );

        self.with_ring(|tm| tm.add_leaving_endpoint(endpoint));

        // Whoever gains responsibility for the removed node's ranges must
        // confirm its re-replication.
        let mut expected: BTreeSet<Endpoint> = BTreeSet::new();
        {
            let tm = self.token_metadata();
            for keyspace in inner.schema.keyspaces() {
                for gainer in tm
                    .pending_endpoint_set(&keyspace)
                    .into_iter()
                    .filter(|ep| *ep != endpoint)
                {
                    expected.insert(gainer);
                }
            }
        }
        expected.retain(|ep| inner.gossiper.is_alive(*ep) || *ep == inner.local);

        if expected.remove(&inner.local) {
            inner.streamer.restore_replica_count(endpoint).await?;
        }
        tracing::info!(%endpoint, %host_id, ?expected, "removing node");
        *inner.removal.lock().unwrap() = Some(RemovalWait { host_id, expected });

        inner
            .gossiper
            .advertise_removing(endpoint, host_id, inner.host_id);

        loop {
            let notified = inner.removal_done.notified();
            {
                let removal = inner.removal.lock().unwrap();
                match removal.as_ref() {
                    Some(wait) if wait.expected.is_empty() => break,
                    Some(_) => {}
                    None => break, // forced completion
                }
            }
            notified.await;
        }
        *inner.removal.lock().unwrap() = None;

        inner.gossiper.advertise_token_removed(endpoint, host_id);
        self.excise(endpoint);
        tracing::info!(%endpoint, %host_id, "node removed");
        Ok(())
    }

    /// Abandon waiting for outstanding REPLICATION_FINISHED confirmations.
    pub fn force_remove_completion(&self) {
        if let Some(wait) = self.inner.removal.lock().unwrap().as_mut() {
            tracing::warn!(outstanding = ?wait.expected, "forcing removal completion");
            wait.expected.clear();
        }
        self.inner.removal_done.notify_waiters();
    }

    fn on_replication_finished(&self, from: Endpoint, req: ReplicationFinished) {
        let mut removal = self.inner.removal.lock().unwrap();
        if let Some(wait) = removal.as_mut() {
            if wait.host_id == req.removed_host && wait.expected.remove(&from) {
                tracing::debug!(%from, "replication finished");
                self.inner.removal_done.notify_waiters();
            }
        }
    }

    // ---- move ----

    /// Relocate this node's single token.
    pub async fn move_token(&self, new_token: Token) -> anyhow::Result<()> {
        let inner = &self.inner;
        let tokens = self.token_metadata().tokens_of(inner.local);
        anyhow::ensure!(
            tokens.len() == 1,
            "token move requires a single-token node"
        );

        self.set_mode(Mode::Moving);
        self.announce_status(Status::Moving(new_token.clone()));
        self.with_ring(|tm| tm.add_moving_endpoint(new_token.clone(), inner.local));
        tokio::time::sleep(inner.cfg.ring_delay_ms).await;

        // Push what others gain; fetch what this node gains.
        let push = self.leave_transfer_plans_excluding(inner.local);
        inner.streamer.stream_ranges(push).await?;
        let fetch = self.bootstrap_plans(&[new_token.clone()]);
        inner.streamer.bootstrap(fetch).await?;

        self.with_ring(|tm| tm.update_normal_tokens([new_token.clone()], inner.local));
        inner.system.save_tokens(std::slice::from_ref(&new_token));
        self.announce_tokens(std::slice::from_ref(&new_token));
        self.announce_status(Status::Normal(vec![new_token]));
        self.set_mode(Mode::Normal);
        Ok(())
    }

    fn leave_transfer_plans_excluding(&self, skip: Endpoint) -> Vec<TransferPlan> {
        self.leave_transfer_plans()
            .into_iter()
            .map(|mut plan| {
                plan.transfers.retain(|(_, ep)| *ep != skip);
                plan
            })
            .filter(|plan| !plan.transfers.is_empty())
            .collect()
    }

    // ---- rebuild / drain / failure policy ----

    /// Re-stream local data from another datacenter; membership is
    /// untouched.
    pub async fn rebuild(&self, source_dc: Option<String>) -> anyhow::Result<()> {
        self.inner.streamer.rebuild(source_dc).await?;
        Ok(())
    }

    pub async fn drain(&self) -> anyhow::Result<()> {
        self.set_mode(Mode::Draining);
        self.inner.gossiper.stop().await;
        self.set_mode(Mode::Drained);
        Ok(())
    }

    /// React to an unrecoverable storage error per the configured policy.
    /// `Stop` isolates the node: gossip shuts down and the embedder is
    /// expected to halt transports.
    pub fn on_storage_failure(&self, policy: FailurePolicy, error: &dyn std::fmt::Display) {
        match policy {
            FailurePolicy::Ignore => {
                tracing::error!(%error, "storage failure ignored by policy");
            }
            FailurePolicy::Stop => {
                tracing::error!(%error, "storage failure; isolating node");
                self.inner.isolated.store(true, Ordering::SeqCst);
                let gossiper = self.inner.gossiper.clone();
                tokio::spawn(async move { gossiper.stop().await });
            }
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.inner.isolated.load(Ordering::SeqCst)
    }

    fn excise(&self, endpoint: Endpoint) {
        self.with_ring(|tm| tm.remove_endpoint(endpoint));
        self.inner.system.remove_peer(endpoint);
        self.inner.gossiper.remove_endpoint(endpoint);
    }

    // ---- gossip-driven membership ----

    fn apply_endpoint_state(&self, endpoint: Endpoint, state: &EndpointState) {
        if let Some(status) = state.status() {
            self.handle_status(endpoint, status, state);
        }
        self.update_peer_row(endpoint, state);
    }

    fn handle_status(&self, endpoint: Endpoint, status: Status, state: &EndpointState) {
        tracing::debug!(%endpoint, ?status, "status change");
        match status {
            Status::Bootstrapping(tokens) => {
                self.with_ring(|tm| tm.add_bootstrap_tokens(tokens, endpoint));
            }
            Status::Normal(tokens) => self.handle_state_normal(endpoint, tokens, state),
            Status::Leaving(_) => {
                self.with_ring(|tm| tm.add_leaving_endpoint(endpoint));
            }
            Status::Left(_, expire_millis) => {
                let expire = UNIX_EPOCH + Duration::from_millis(expire_millis.max(0) as u64);
                self.inner
                    .gossiper
                    .add_expire_time_for_endpoint(endpoint, expire);
                if endpoint != self.inner.local {
                    self.excise(endpoint);
                }
            }
            Status::Moving(token) => {
                self.with_ring(|tm| tm.add_moving_endpoint(token, endpoint));
            }
            Status::Removing(host_id) => self.handle_state_removing(endpoint, host_id, state),
            Status::Removed(_, expire_millis) => {
                let expire = UNIX_EPOCH + Duration::from_millis(expire_millis.max(0) as u64);
                self.inner
                    .gossiper
                    .add_expire_time_for_endpoint(endpoint, expire);
                if endpoint != self.inner.local {
                    self.excise(endpoint);
                }
            }
            Status::Hibernate => {
                tracing::info!(%endpoint, "peer is hibernating (replacement in progress)");
            }
            Status::Shutdown => {}
        }
    }

    fn handle_state_normal(&self, endpoint: Endpoint, tokens: Vec<Token>, state: &EndpointState) {
        let inner = &self.inner;
        if let Some(host_id) = state.host_id() {
            let existing = self.token_metadata().endpoint_for_host_id(host_id);
            if let Some(existing) = existing.filter(|existing| *existing != endpoint) {
                // Two addresses claim one host id; the younger startup
                // generation wins and the loser is dropped.
                match inner.gossiper.compare_endpoint_startup(endpoint, existing) {
                    Some(std::cmp::Ordering::Less) => {
                        tracing::warn!(
                            %endpoint,
                            %existing,
                            %host_id,
                            "ignoring state from older instance of host id"
                        );
                        return;
                    }
                    _ => {
                        tracing::warn!(
                            %endpoint,
                            %existing,
                            %host_id,
                            "host id collision; evicting the older address"
                        );
                        self.with_ring(|tm| tm.remove_endpoint(existing));
                        inner.gossiper.remove_endpoint(existing);
                    }
                }
            }
            self.with_ring(|tm| {
                tm.update_host_id(host_id, endpoint);
                tm.update_normal_tokens(tokens.clone(), endpoint);
            });
        } else {
            self.with_ring(|tm| tm.update_normal_tokens(tokens.clone(), endpoint));
        }
    }

    fn handle_state_removing(&self, endpoint: Endpoint, host_id: HostId, state: &EndpointState) {
        let inner = &self.inner;
        if endpoint == inner.local {
            tracing::warn!("this node is being removed from the ring by an operator");
            return;
        }
        self.with_ring(|tm| tm.add_leaving_endpoint(endpoint));

        let coordinator_host = state
            .get(ApplicationState::RemovalCoordinator)
            .and_then(|v| HostId::parse(&v.value));
        let Some(coordinator_host) = coordinator_host else {
            tracing::warn!(%endpoint, "REMOVING status without a removal coordinator");
            return;
        };
        let Some(coordinator) = self.token_metadata().endpoint_for_host_id(coordinator_host)
        else {
            tracing::warn!(%coordinator_host, "removal coordinator unknown");
            return;
        };

        // Re-replicate lost ranges, then confirm to the coordinator.
        let this = self.clone();
        tokio::spawn(async move {
            let inner = &this.inner;
            if let Err(error) = inner.streamer.restore_replica_count(endpoint).await {
                tracing::error!(%error, "replica restoration failed");
                return;
            }
            let req = ReplicationFinished {
                coordinator,
                removed_host: host_id,
            };
            let meta = CallMeta::new(inner.local);
            if let Err(error) = inner
                .transport
                .replication_finished(coordinator, req, meta)
                .await
            {
                tracing::warn!(%coordinator, %error, "replication-finished ack failed");
            }
        });
    }

    fn update_peer_row(&self, endpoint: Endpoint, state: &EndpointState) {
        if endpoint == self.inner.local {
            return;
        }
        let info = PeerInfo {
            host_id: state.host_id(),
            data_center: state.get(ApplicationState::Dc).map(|v| v.value.clone()),
            rack: state.get(ApplicationState::Rack).map(|v| v.value.clone()),
            rpc_address: state
                .get(ApplicationState::RpcAddress)
                .map(|v| v.value.clone()),
            release_version: state
                .get(ApplicationState::ReleaseVersion)
                .map(|v| v.value.clone()),
            schema_version: state
                .get(ApplicationState::Schema)
                .and_then(|v| uuid::Uuid::parse_str(&v.value).ok()),
            supported_features: state
                .get(ApplicationState::SupportedFeatures)
                .map(|v| v.value.clone()),
            tokens: state.tokens().unwrap_or_default(),
        };
        self.inner.system.update_peer(endpoint, info);
    }
}

struct ClusterSubscriber {
    inner: Weak<Inner>,
}

impl ClusterSubscriber {
    fn cluster(&self) -> Option<Cluster> {
        self.inner.upgrade().map(|inner| Cluster { inner })
    }
}

impl GossipSubscriber for ClusterSubscriber {
    fn on_join(&self, endpoint: Endpoint, state: &EndpointState) {
        if let Some(cluster) = self.cluster() {
            cluster.apply_endpoint_state(endpoint, state);
        }
    }

    fn on_change(&self, endpoint: Endpoint, key: ApplicationState, value: &VersionedValue) {
        let Some(cluster) = self.cluster() else { return };
        match key {
            ApplicationState::Status => {
                if let Some(status) = Status::from_wire(&value.value) {
                    let state = cluster
                        .inner
                        .gossiper
                        .endpoint_state(endpoint)
                        .unwrap_or_else(|| EndpointState::new(0));
                    cluster.handle_status(endpoint, status, &state);
                }
            }
            _ => {
                if let Some(state) = cluster.inner.gossiper.endpoint_state(endpoint) {
                    cluster.update_peer_row(endpoint, &state);
                }
            }
        }
    }

    fn on_alive(&self, endpoint: Endpoint, _state: &EndpointState) {
        metrics::counter!("cluster_endpoint_up").increment(1);
        tracing::debug!(%endpoint, "peer up");
    }

    fn on_dead(&self, endpoint: Endpoint, _state: &EndpointState) {
        metrics::counter!("cluster_endpoint_down").increment(1);
        tracing::debug!(%endpoint, "peer down");
    }

    fn on_restart(&self, endpoint: Endpoint, _state: &EndpointState) {
        tracing::debug!(%endpoint, "peer restarted");
    }

    fn on_remove(&self, endpoint: Endpoint) {
        tracing::debug!(%endpoint, "peer removed from gossip");
    }
}

// Inbound verbs: gossip to the gossiper, data verbs to the proxy, and the
// removal acknowledgement to the controller.
struct NodeSink {
    inner: Weak<Inner>,
}

impl NodeSink {
    fn upgrade(&self) -> rpc::Result<Arc<Inner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| rpc::Error::ServerError("node is shutting down".to_string()))
    }
}

#[async_trait::async_trait]
impl MessageSink for NodeSink {
    async fn on_gossip_syn(&self, from: Endpoint, msg: rpc::DigestSyn) -> rpc::Result<()> {
        self.upgrade()?.gossiper.on_gossip_syn(from, msg).await
    }

    async fn on_gossip_ack(&self, from: Endpoint, msg: rpc::DigestAck) -> rpc::Result<()> {
        self.upgrade()?.gossiper.on_gossip_ack(from, msg).await
    }

    async fn on_gossip_ack2(&self, from: Endpoint, msg: rpc::DigestAck2) -> rpc::Result<()> {
        self.upgrade()?.gossiper.on_gossip_ack2(from, msg).await
    }

    async fn on_gossip_echo(&self, from: Endpoint) -> rpc::Result<()> {
        self.upgrade()?.gossiper.on_gossip_echo(from).await
    }

    async fn on_gossip_shutdown(&self, from: Endpoint) -> rpc::Result<()> {
        self.upgrade()?.gossiper.on_gossip_shutdown(from).await
    }

    async fn on_mutation(&self, from: Endpoint, req: rpc::MutationRequest) -> rpc::Result<()> {
        self.upgrade()?.proxy.on_mutation(from, req).await
    }

    async fn on_mutation_done(&self, from: Endpoint, req: rpc::MutationDone) -> rpc::Result<()> {
        self.upgrade()?.proxy.on_mutation_done(from, req).await
    }

    async fn on_counter_mutation(
        &self,
        from: Endpoint,
        req: rpc::CounterMutationRequest,
    ) -> rpc::Result<()> {
        self.upgrade()?.proxy.on_counter_mutation(from, req).await
    }

    async fn on_read_data(
        &self,
        from: Endpoint,
        req: rpc::ReadDataRequest,
        meta: CallMeta,
    ) -> rpc::Result<rpc::ReadDataResponse> {
        self.upgrade()?.proxy.on_read_data(from, req, meta).await
    }

    async fn on_read_digest(
        &self,
        from: Endpoint,
        req: models::ReadCommand,
        meta: CallMeta,
    ) -> rpc::Result<rpc::ReadDigestResponse> {
        self.upgrade()?.proxy.on_read_digest(from, req, meta).await
    }

    async fn on_read_mutation_data(
        &self,
        from: Endpoint,
        req: models::ReadCommand,
        meta: CallMeta,
    ) -> rpc::Result<models::ReconcilableResult> {
        self.upgrade()?
            .proxy
            .on_read_mutation_data(from, req, meta)
            .await
    }

    async fn on_truncate(&self, from: Endpoint, req: rpc::TruncateRequest) -> rpc::Result<()> {
        self.upgrade()?.proxy.on_truncate(from, req).await
    }

    async fn on_replication_finished(
        &self,
        from: Endpoint,
        req: ReplicationFinished,
    ) -> rpc::Result<()> {
        let inner = self.upgrade()?;
        Cluster { inner }.on_replication_finished(from, req);
        Ok(())
    }

    async fn on_repair_checksum_range(
        &self,
        from: Endpoint,
        req: rpc::RepairChecksumRequest,
    ) -> rpc::Result<rpc::PartitionChecksum> {
        self.upgrade()?
            .proxy
            .on_repair_checksum_range(from, req)
            .await
    }

    async fn on_schema_check(&self, from: Endpoint) -> rpc::Result<rpc::SchemaVersion> {
        self.upgrade()?.proxy.on_schema_check(from).await
    }

    async fn on_definitions_update(
        &self,
        from: Endpoint,
        req: rpc::SchemaUpdate,
    ) -> rpc::Result<()> {
        let inner = self.upgrade()?;
        inner.proxy.on_definitions_update(from, req).await?;
        // Replication may have changed; pending ranges follow the schema.
        Cluster { inner }.recompute_pending_ranges();
        Ok(())
    }

    async fn on_migration_request(&self, from: Endpoint) -> rpc::Result<rpc::SchemaUpdate> {
        self.upgrade()?.proxy.on_migration_request(from).await
    }

    async fn on_stream_prepare(&self, from: Endpoint, req: rpc::StreamPrepare) -> rpc::Result<()> {
        tracing::debug!(%from, plan = %req.plan_id, "stream prepare accepted");
        Ok(())
    }

    async fn on_stream_complete(
        &self,
        from: Endpoint,
        req: rpc::StreamComplete,
    ) -> rpc::Result<()> {
        tracing::debug!(%from, plan = %req.plan_id, success = req.success, "stream complete");
        Ok(())
    }
}
