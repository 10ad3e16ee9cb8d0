use crate::{FailureDetector, FailureListener};
use models::{
    ApplicationState, Endpoint, EndpointState, GossipDigest, HostId, Status, VersionedValue,
};
use rand::seq::SliceRandom;
use rand::Rng;
use rpc::{CallMeta, DigestAck, DigestAck2, DigestSyn, Transport};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

/// Cadence of the gossip round.
pub const INTERVAL: Duration = Duration::from_secs(1);

/// How long a departed peer's state lingers before eviction.
pub const A_VERY_LONG_TIME: Duration = Duration::from_secs(3 * 24 * 3600);

/// Largest believable generation jump. A larger jump is assumed to be a
/// peer broadcasting corrupted memory and is ignored with a warning.
pub const MAX_GENERATION_DIFFERENCE: i64 = 86400 * 365;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub cluster_name: String,
    pub partitioner_name: String,
    pub seeds: BTreeSet<Endpoint>,
    pub ring_delay: Duration,
    pub phi_threshold: f64,
    pub shadow_round_timeout: Duration,
}

impl GossipConfig {
    pub fn new(cluster_name: &str, partitioner_name: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            partitioner_name: partitioner_name.to_string(),
            seeds: BTreeSet::new(),
            ring_delay: Duration::from_secs(30),
            phi_threshold: 8.0,
            shadow_round_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = Endpoint>) -> Self {
        self.seeds = seeds.into_iter().collect();
        self
    }

    /// Peers removed from gossip are ignored for this long, so a removal
    /// propagates everywhere before the address may reappear.
    pub fn quarantine_delay(&self) -> Duration {
        self.ring_delay * 2
    }

    /// Gossip-only members silent longer than this are dropped.
    pub fn fat_client_timeout(&self) -> Duration {
        self.quarantine_delay() / 2
    }
}

/// Callbacks fired as the cluster view changes. Within one applied update,
/// every state merge for an endpoint lands before `on_change` fires, so
/// subscribers always observe consistent state.
#[allow(unused_variables)]
pub trait GossipSubscriber: Send + Sync {
    fn on_join(&self, endpoint: Endpoint, state: &EndpointState) {}
    fn on_change(&self, endpoint: Endpoint, key: ApplicationState, value: &VersionedValue) {}
    fn on_alive(&self, endpoint: Endpoint, state: &EndpointState) {}
    fn on_dead(&self, endpoint: Endpoint, state: &EndpointState) {}
    fn on_restart(&self, endpoint: Endpoint, state: &EndpointState) {}
    fn on_remove(&self, endpoint: Endpoint) {}
}

/// Ring membership callback consulted by status checks: gossip-only
/// members (fat clients) and expired dead peers are evicted only when the
/// ring no longer references them.
pub trait RingView: Send + Sync {
    fn is_member(&self, endpoint: Endpoint) -> bool;
}

struct State {
    endpoints: BTreeMap<Endpoint, EndpointState>,
    live: BTreeSet<Endpoint>,
    /// Newly-alive peers get gossiped to first, to speed convergence.
    live_just_added: VecDeque<Endpoint>,
    unreachable: BTreeMap<Endpoint, Instant>,
    /// Quarantine of just-removed peers; their gossip is ignored.
    just_removed: BTreeMap<Endpoint, Instant>,
    expire_times: BTreeMap<Endpoint, SystemTime>,
    seeds: BTreeSet<Endpoint>,
    /// Shared monotonic source for heartbeat and application-state
    /// versions.
    version: i64,
    gossiped_to_seed: bool,
    last_published: Arc<BTreeMap<Endpoint, EndpointState>>,
}

pub struct Inner {
    cfg: GossipConfig,
    local: Endpoint,
    transport: Arc<dyn Transport>,
    fd: Arc<FailureDetector>,
    state: Mutex<State>,
    subscribers: Mutex<Vec<Arc<dyn GossipSubscriber>>>,
    ring: Mutex<Option<Arc<dyn RingView>>>,
    snapshot_tx: watch::Sender<Arc<BTreeMap<Endpoint, EndpointState>>>,
    features_tx: watch::Sender<BTreeSet<String>>,
    enabled: AtomicBool,
    in_shadow_round: AtomicBool,
}

/// The membership and failure-dissemination loop.
///
/// Every second the gossiper bumps its own heartbeat, exchanges digests
/// with a random live peer (and probabilistically with unreachable peers
/// and seeds), interprets the failure detector for everyone it knows, and
/// publishes a fresh snapshot of the endpoint map when it changed.
#[derive(Clone)]
pub struct Gossiper {
    inner: Arc<Inner>,
}

impl FailureListener for Inner {
    fn convict(&self, endpoint: Endpoint, phi: f64) {
        let status = {
            let state = self.state.lock().unwrap();
            let Some(eps) = state.endpoints.get(&endpoint) else {
                return;
            };
            if !eps.is_alive {
                return;
            }
            eps.status()
        };
        tracing::debug!(%endpoint, phi, "convicted by failure detector");
        if matches!(status, Some(Status::Shutdown)) {
            self.mark_as_shutdown(endpoint);
        } else if !status.as_ref().is_some_and(Status::is_dead_state) {
            self.mark_dead(endpoint);
        }
    }
}

impl Gossiper {
    pub fn new(
        cfg: GossipConfig,
        local: Endpoint,
        transport: Arc<dyn Transport>,
        fd: Arc<FailureDetector>,
    ) -> Self {
        let mut seeds = cfg.seeds.clone();
        seeds.remove(&local);
        let (snapshot_tx, _) = watch::channel(Arc::new(BTreeMap::new()));
        let (features_tx, _) = watch::channel(BTreeSet::new());
        let inner = Arc::new(Inner {
            cfg,
            local,
            transport,
            fd: fd.clone(),
            state: Mutex::new(State {
                endpoints: BTreeMap::new(),
                live: BTreeSet::new(),
                live_just_added: VecDeque::new(),
                unreachable: BTreeMap::new(),
                just_removed: BTreeMap::new(),
                expire_times: BTreeMap::new(),
                seeds,
                version: 0,
                gossiped_to_seed: false,
                last_published: Arc::new(BTreeMap::new()),
            }),
            subscribers: Mutex::new(Vec::new()),
            ring: Mutex::new(None),
            snapshot_tx,
            features_tx,
            enabled: AtomicBool::new(false),
            in_shadow_round: AtomicBool::new(false),
        });
        let as_listener: Arc<dyn FailureListener> = inner.clone();
        fd.register(Arc::downgrade(&as_listener));
        Self { inner }
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.inner.local
    }

    pub fn cluster_name(&self) -> &str {
        &self.inner.cfg.cluster_name
    }

    pub fn register(&self, subscriber: Arc<dyn GossipSubscriber>) {
        self.inner.subscribers.lock().unwrap().push(subscriber);
    }

    pub fn set_ring_view(&self, ring: Arc<dyn RingView>) {
        *self.inner.ring.lock().unwrap() = Some(ring);
    }

    /// Initialize the local heartbeat at `generation` and preload local
    /// application states, then enable the round task.
    pub fn start(&self, generation: i64, preload: Vec<(ApplicationState, String)>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let local = self.inner.local;
            state
                .endpoints
                .entry(local)
                .or_insert_with(|| EndpointState::new(generation));
            for (key, value) in preload {
                state.version += 1;
                let version = state.version;
                state
                    .endpoints
                    .get_mut(&local)
                    .unwrap()
                    .set(key, VersionedValue::new(value, version));
            }
        }
        self.inner.enabled.store(true, Ordering::SeqCst);
        tracing::info!(generation, "gossip started");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Spawn the periodic round driver. Tests drive [`Gossiper::tick`]
    /// directly instead.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while this.is_enabled() {
                ticker.tick().await;
                this.tick().await;
            }
        })
    }

    /// Announce shutdown to live members and disable the loop. A node
    /// already in a silent-shutdown state (left, removed, bootstrapping)
    /// keeps that status and goes quietly.
    pub async fn stop(&self) {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        let (live, silent) = {
            let state = self.inner.state.lock().unwrap();
            let live: Vec<Endpoint> = state.live.iter().copied().collect();
            let silent = state
                .endpoints
                .get(&self.inner.local)
                .and_then(EndpointState::status)
                .as_ref()
                .is_some_and(Status::is_silent_shutdown_state);
            (live, silent)
        };
        if !silent {
            self.add_local_application_state(
                ApplicationState::Status,
                Status::Shutdown.to_wire(),
            );
            for peer in live {
                let meta = CallMeta::new(self.inner.local);
                if let Err(error) = self.inner.transport.gossip_shutdown(peer, meta).await {
                    tracing::debug!(%peer, %error, "shutdown announcement failed");
                }
            }
        }
        tracing::info!("gossip stopped");
    }

    /// One gossip round.
    pub async fn tick(&self) {
        if !self.is_enabled() {
            return;
        }
        let (syn, live_target, unreachable_target) = {
            let mut state = self.inner.state.lock().unwrap();
            let local = self.inner.local;
            state.version += 1;
            let version = state.version;
            let Some(local_state) = state.endpoints.get_mut(&local) else {
                return;
            };
            local_state.heartbeat.version = version;

            let mut digests: Vec<GossipDigest> = state
                .endpoints
                .iter()
                .map(|(ep, eps)| GossipDigest {
                    endpoint: *ep,
                    generation: eps.generation(),
                    max_version: eps.max_version(),
                })
                .collect();
            digests.shuffle(&mut rand::thread_rng());
            let syn = DigestSyn {
                cluster_name: self.inner.cfg.cluster_name.clone(),
                partitioner_name: self.inner.cfg.partitioner_name.clone(),
                digests,
            };

            state.gossiped_to_seed = false;
            let live_target = self.pick_live_target(&mut state);
            let unreachable_target = self.pick_unreachable_target(&state);
            (syn, live_target, unreachable_target)
        };

        if let Some(peer) = live_target {
            self.send_syn(peer, syn.clone()).await;
        }
        if let Some(peer) = unreachable_target {
            self.send_syn(peer, syn.clone()).await;
        }
        // Gossip to a seed when this round has not reached one, or when we
        // know fewer live peers than there are seeds: without it, islands
        // of nodes can gossip happily among themselves forever.
        let seed = {
            let state = self.inner.state.lock().unwrap();
            let reached = state.gossiped_to_seed;
            let wants_seed = !reached || state.live.len() < state.seeds.len();
            if wants_seed {
                let seeds: Vec<Endpoint> = state.seeds.iter().copied().collect();
                seeds.choose(&mut rand::thread_rng()).copied()
            } else {
                None
            }
        };
        if let Some(peer) = seed {
            self.send_syn(peer, syn).await;
        }

        self.do_status_check().await;
        self.publish_if_changed();

        let (live, unreachable) = {
            let state = self.inner.state.lock().unwrap();
            (state.live.len() as f64, state.unreachable.len() as f64)
        };
        metrics::gauge!("gossip_live_members").set(live);
        metrics::gauge!("gossip_unreachable_members").set(unreachable);
    }

    fn pick_live_target(&self, state: &mut State) -> Option<Endpoint> {
        if let Some(ep) = state.live_just_added.pop_front() {
            tracing::debug!(%ep, "gossiping first to newly added member");
            return Some(ep);
        }
        let live: Vec<Endpoint> = state.live.iter().copied().collect();
        live.choose(&mut rand::thread_rng()).copied()
    }

    fn pick_unreachable_target(&self, state: &State) -> Option<Endpoint> {
        if state.unreachable.is_empty() {
            return None;
        }
        let prob = state.unreachable.len() as f64 / (state.live.len() as f64 + 1.0);
        if rand::thread_rng().gen::<f64>() >= prob {
            return None;
        }
        let candidates: Vec<Endpoint> = state
            .unreachable
            .keys()
            .filter(|ep| {
                !matches!(
                    state.endpoints.get(*ep).and_then(EndpointState::status),
                    Some(Status::Left(..))
                )
            })
            .copied()
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    async fn send_syn(&self, to: Endpoint, syn: DigestSyn) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.seeds.contains(&to) {
                state.gossiped_to_seed = true;
            }
        }
        let meta = CallMeta::new(self.inner.local);
        if let Err(error) = self.inner.transport.gossip_syn(to, syn, meta).await {
            tracing::trace!(%to, %error, "gossip syn failed");
        }
    }

    // ---- SYN / ACK / ACK2 ----

    pub(crate) async fn handle_syn(&self, from: Endpoint, syn: DigestSyn) -> rpc::Result<()> {
        if syn.cluster_name != self.inner.cfg.cluster_name {
            tracing::warn!(
                %from,
                theirs = %syn.cluster_name,
                ours = %self.inner.cfg.cluster_name,
                "cluster name mismatch, ignoring syn"
            );
            return Ok(());
        }
        if !syn.partitioner_name.is_empty()
            && syn.partitioner_name != self.inner.cfg.partitioner_name
        {
            tracing::warn!(
                %from,
                theirs = %syn.partitioner_name,
                ours = %self.inner.cfg.partitioner_name,
                "partitioner mismatch, ignoring syn"
            );
            return Ok(());
        }

        let ack = {
            let state = self.inner.state.lock().unwrap();
            if syn.digests.is_empty() {
                // A completely empty syn is a shadow-round request: answer
                // with everything we know.
                tracing::debug!(%from, "shadow request received, sending all state");
                DigestAck {
                    requested: Vec::new(),
                    states: state
                        .endpoints
                        .iter()
                        .map(|(ep, eps)| (*ep, eps.clone()))
                        .collect(),
                }
            } else {
                let mut requested = Vec::new();
                let mut states = Vec::new();
                for digest in &syn.digests {
                    self.examine_digest(&state, digest, &mut requested, &mut states);
                }
                DigestAck { requested, states }
            }
        };
        let meta = CallMeta::new(self.inner.local);
        self.inner.transport.gossip_ack(from, ack, meta).await
    }

    fn examine_digest(
        &self,
        state: &State,
        digest: &GossipDigest,
        requested: &mut Vec<GossipDigest>,
        states: &mut Vec<(Endpoint, EndpointState)>,
    ) {
        let ep = digest.endpoint;
        let Some(local) = state.endpoints.get(&ep) else {
            // Nothing known locally: ask for everything.
            requested.push(GossipDigest {
                endpoint: ep,
                generation: digest.generation,
                max_version: 0,
            });
            return;
        };
        let local_generation = local.generation();
        let local_max = local.max_version();
        if digest.generation == local_generation && digest.max_version == local_max {
            return;
        }
        if digest.generation > local_generation {
            requested.push(GossipDigest {
                endpoint: ep,
                generation: digest.generation,
                max_version: 0,
            });
        } else if digest.generation < local_generation {
            // Their view of this endpoint predates ours entirely.
            if let Some(delta) = local.state_newer_than(0) {
                states.push((ep, delta));
            }
        } else if digest.max_version > local_max {
            requested.push(GossipDigest {
                endpoint: ep,
                generation: digest.generation,
                max_version: local_max,
            });
        } else if digest.max_version < local_max {
            if let Some(delta) = local.state_newer_than(digest.max_version) {
                states.push((ep, delta));
            }
        }
    }

    pub(crate) async fn handle_ack(&self, from: Endpoint, ack: DigestAck) -> rpc::Result<()> {
        if self.inner.in_shadow_round.load(Ordering::SeqCst) {
            // Shadow round: absorb without liveness or notifications.
            let mut state = self.inner.state.lock().unwrap();
            for (ep, mut eps) in ack.states {
                eps.is_alive = false;
                state.endpoints.insert(ep, eps);
            }
            return Ok(());
        }

        self.notify_failure_detector(&ack.states);
        self.apply_state_locally(ack.states).await;

        let ack2 = {
            let state = self.inner.state.lock().unwrap();
            let states = ack
                .requested
                .iter()
                .filter_map(|digest| {
                    state
                        .endpoints
                        .get(&digest.endpoint)
                        .and_then(|eps| eps.state_newer_than(digest.max_version))
                        .map(|delta| (digest.endpoint, delta))
                })
                .collect();
            DigestAck2 { states }
        };
        let meta = CallMeta::new(self.inner.local);
        self.inner.transport.gossip_ack2(from, ack2, meta).await
    }

    pub(crate) async fn handle_ack2(&self, _from: Endpoint, ack2: DigestAck2) -> rpc::Result<()> {
        self.notify_failure_detector(&ack2.states);
        self.apply_state_locally(ack2.states).await;
        Ok(())
    }

    pub(crate) fn handle_shutdown(&self, from: Endpoint) {
        tracing::info!(%from, "peer announced shutdown");
        self.inner.mark_as_shutdown(from);
    }

    fn notify_failure_detector(&self, states: &[(Endpoint, EndpointState)]) {
        let mut reports = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            for (ep, remote) in states {
                let Some(local) = state.endpoints.get_mut(ep) else {
                    continue;
                };
                let local_generation = local.generation();
                let remote_generation = remote.generation();
                if remote_generation > local_generation {
                    local.update_timestamp = Instant::now();
                    if local.is_alive {
                        reports.push(*ep);
                    }
                } else if remote_generation == local_generation
                    && remote.heartbeat.version > local.max_version()
                {
                    local.update_timestamp = Instant::now();
                    reports.push(*ep);
                }
            }
        }
        for ep in reports {
            self.inner.fd.report(ep);
        }
    }

    /// Apply remotely-received endpoint states under the generation and
    /// version rules.
    pub async fn apply_state_locally(&self, states: Vec<(Endpoint, EndpointState)>) {
        for (ep, remote) in states {
            if ep == self.inner.local && !self.inner.in_shadow_round.load(Ordering::SeqCst) {
                continue;
            }
            enum Action {
                Skip,
                Major,
                Merge,
                MaybeRevive,
            }
            let action = {
                let state = self.inner.state.lock().unwrap();
                if state.just_removed.contains_key(&ep) {
                    tracing::trace!(%ep, "ignoring gossip for quarantined endpoint");
                    Action::Skip
                } else {
                    match state.endpoints.get(&ep) {
                        None => Action::Major,
                        Some(local) => {
                            let local_generation = local.generation();
                            let remote_generation = remote.generation();
                            if local_generation != 0
                                && remote_generation > local_generation + MAX_GENERATION_DIFFERENCE
                            {
                                tracing::warn!(
                                    %ep,
                                    local_generation,
                                    remote_generation,
                                    "received an invalid gossip generation for peer"
                                );
                                Action::Skip
                            } else if remote_generation > local_generation {
                                Action::Major
                            } else if remote_generation == local_generation {
                                if remote.max_version() > local.max_version() {
                                    Action::Merge
                                } else {
                                    Action::MaybeRevive
                                }
                            } else {
                                Action::Skip
                            }
                        }
                    }
                }
            };
            match action {
                Action::Skip => {}
                Action::Major => self.handle_major_state_change(ep, remote).await,
                Action::Merge => {
                    self.apply_new_states(ep, &remote);
                    self.revive_if_needed(ep).await;
                }
                Action::MaybeRevive => self.revive_if_needed(ep).await,
            }
        }
    }

    async fn handle_major_state_change(&self, ep: Endpoint, remote: EndpointState) {
        let is_dead = remote.status().as_ref().is_some_and(Status::is_dead_state);
        let is_shutdown = matches!(remote.status(), Some(Status::Shutdown));
        let (had_local, inserted) = {
            let mut state = self.inner.state.lock().unwrap();
            let had_local = state.endpoints.contains_key(&ep);
            if had_local {
                // Restart: the old cadence predicts nothing now.
                self.inner.fd.remove(ep);
            }
            let mut eps = remote;
            eps.is_alive = false;
            eps.update_timestamp = Instant::now();
            state.endpoints.insert(ep, eps.clone());
            (had_local, eps)
        };

        if self.inner.in_shadow_round.load(Ordering::SeqCst) {
            return;
        }
        if had_local {
            tracing::debug!(%ep, "node has restarted");
            self.inner
                .for_each_subscriber(|s| s.on_restart(ep, &inserted));
        } else {
            tracing::debug!(%ep, "node is now part of the cluster");
        }
        self.inner.fd.report(ep);

        if !is_dead {
            self.mark_alive(ep).await;
        } else {
            tracing::debug!(%ep, "not marking alive due to dead state");
            self.inner.mark_dead(ep);
        }
        self.inner.for_each_subscriber(|s| s.on_join(ep, &inserted));
        if is_shutdown {
            self.inner.mark_as_shutdown(ep);
        }
    }

    // Same-generation merge of newer application states; fires on_change
    // per merged entry only after every entry landed.
    fn apply_new_states(&self, ep: Endpoint, remote: &EndpointState) {
        let merged: Vec<(ApplicationState, VersionedValue)> = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(local) = state.endpoints.get_mut(&ep) else {
                return;
            };
            local.heartbeat = remote.heartbeat;
            local.update_timestamp = Instant::now();
            let mut merged = Vec::new();
            for (key, value) in &remote.application_states {
                let newer = local
                    .get(*key)
                    .map_or(true, |existing| value.version > existing.version);
                if newer {
                    local.set(*key, value.clone());
                    merged.push((*key, value.clone()));
                }
            }
            merged
        };
        for (key, value) in &merged {
            self.inner
                .for_each_subscriber(|s| s.on_change(ep, *key, value));
        }
    }

    async fn revive_if_needed(&self, ep: Endpoint) {
        let needs_revive = {
            let state = self.inner.state.lock().unwrap();
            state.endpoints.get(&ep).is_some_and(|local| {
                !local.is_alive && !local.status().as_ref().is_some_and(Status::is_dead_state)
            })
        };
        if needs_revive {
            self.mark_alive(ep).await;
        }
    }

    /// Flip `ep` from dead to alive, but only after a successful ECHO
    /// round-trip: a digest exchange alone must not revive a peer.
    async fn mark_alive(&self, ep: Endpoint) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(eps) = state.endpoints.get_mut(&ep) {
                eps.is_alive = false;
            }
        }
        let meta = CallMeta::new(self.inner.local);
        match self.inner.transport.gossip_echo(ep, meta).await {
            Ok(()) => self.inner.real_mark_alive(ep),
            Err(error) => {
                tracing::warn!(%ep, %error, "echo probe failed, peer stays down");
            }
        }
    }

    // ---- status checks ----

    async fn do_status_check(&self) {
        let now = Instant::now();
        let endpoints: Vec<Endpoint> = {
            let state = self.inner.state.lock().unwrap();
            state.endpoints.keys().copied().collect()
        };
        for ep in &endpoints {
            if *ep != self.inner.local {
                self.inner.fd.interpret(*ep);
            }
        }

        let ring = self.inner.ring.lock().unwrap().clone();
        let fat_client_timeout = self.inner.cfg.fat_client_timeout();
        let quarantine = self.inner.cfg.quarantine_delay();
        let wall_now = SystemTime::now();

        // Snapshot what the verdicts need, then consult the ring view with
        // no gossip lock held: the view reaches into ring state owned
        // elsewhere.
        struct Probe {
            ep: Endpoint,
            alive: bool,
            dead_state: bool,
            quarantined: bool,
            silent_for: Duration,
            expire: Option<SystemTime>,
        }
        let probes: Vec<Probe> = {
            let state = self.inner.state.lock().unwrap();
            state
                .endpoints
                .iter()
                .filter(|(ep, _)| **ep != self.inner.local)
                .map(|(ep, eps)| Probe {
                    ep: *ep,
                    alive: eps.is_alive,
                    dead_state: eps.status().as_ref().is_some_and(Status::is_dead_state),
                    quarantined: state.just_removed.contains_key(ep),
                    silent_for: now.saturating_duration_since(eps.update_timestamp),
                    expire: state.expire_times.get(ep).copied(),
                })
                .collect()
        };

        let mut to_remove: Vec<Endpoint> = Vec::new();
        let mut to_evict: Vec<Endpoint> = Vec::new();
        for probe in probes {
            let is_member = ring.as_ref().map_or(true, |r| r.is_member(probe.ep));

            // Fat client: participates in gossip but owns no ring tokens.
            // Drop it once it goes quiet.
            if !probe.dead_state
                && !is_member
                && !probe.quarantined
                && probe.silent_for > fat_client_timeout
            {
                tracing::info!(ep = %probe.ep, "fat client has been silent, removing from gossip");
                to_remove.push(probe.ep);
                to_evict.push(probe.ep);
                continue;
            }

            // Dead peers whose expiry passed and who are off the ring.
            if !probe.alive && !is_member {
                let expire = probe.expire.unwrap_or(wall_now + A_VERY_LONG_TIME);
                if wall_now > expire {
                    tracing::debug!(ep = %probe.ep, "expire time passed, evicting endpoint");
                    to_evict.push(probe.ep);
                }
            }
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            state
                .just_removed
                .retain(|_, since| now.saturating_duration_since(*since) <= quarantine);
        }
        for ep in to_remove {
            self.remove_endpoint(ep);
        }
        for ep in to_evict {
            self.inner.evict_from_membership(ep);
        }
    }

    /// Remove `ep` from gossip (keeping its state) and quarantine it.
    pub fn remove_endpoint(&self, ep: Endpoint) {
        self.inner.for_each_subscriber(|s| s.on_remove(ep));
        let mut state = self.inner.state.lock().unwrap();
        state.seeds.remove(&ep);
        state.live.remove(&ep);
        state.live_just_added.retain(|e| *e != ep);
        state.unreachable.remove(&ep);
        state.just_removed.insert(ep, Instant::now());
        tracing::debug!(%ep, "removed endpoint from gossip");
    }

    fn publish_if_changed(&self) {
        let (snapshot, changed) = {
            let mut state = self.inner.state.lock().unwrap();
            let changed = *state.last_published != state.endpoints;
            if changed {
                state.last_published = Arc::new(state.endpoints.clone());
            }
            (state.last_published.clone(), changed)
        };
        if changed {
            self.inner.snapshot_tx.send_replace(snapshot);
            let features = self.common_features();
            self.inner.features_tx.send_if_modified(|current| {
                if *current != features {
                    *current = features;
                    true
                } else {
                    false
                }
            });
        }
    }

    // ---- local state management ----

    /// Set a local application state at the next version and gossip it out
    /// on the following rounds.
    pub fn add_local_application_state(&self, key: ApplicationState, value: String) {
        let value = {
            let mut state = self.inner.state.lock().unwrap();
            state.version += 1;
            let version = state.version;
            let local = self.inner.local;
            let value = VersionedValue::new(value, version);
            if let Some(eps) = state.endpoints.get_mut(&local) {
                eps.set(key, value.clone());
            }
            value
        };
        let local = self.inner.local;
        self.inner
            .for_each_subscriber(|s| s.on_change(local, key, &value));
    }

    /// Seed the map with a peer known from persisted state; it starts at
    /// generation 0 and dead, awaiting its first real gossip.
    pub fn add_saved_endpoint(&self, ep: Endpoint) {
        let mut state = self.inner.state.lock().unwrap();
        let eps = state.endpoints.entry(ep).or_insert_with(|| {
            let mut eps = EndpointState::new(0);
            eps.is_alive = false;
            eps
        });
        eps.update_timestamp = Instant::now();
        state.unreachable.entry(ep).or_insert_with(Instant::now);
    }

    pub fn endpoint_state(&self, ep: Endpoint) -> Option<EndpointState> {
        self.inner.state.lock().unwrap().endpoints.get(&ep).cloned()
    }

    pub fn endpoint_states(&self) -> BTreeMap<Endpoint, EndpointState> {
        self.inner.state.lock().unwrap().endpoints.clone()
    }

    pub fn live_members(&self) -> BTreeSet<Endpoint> {
        let mut live = self.inner.state.lock().unwrap().live.clone();
        live.insert(self.inner.local);
        live
    }

    pub fn unreachable_members(&self) -> BTreeSet<Endpoint> {
        self.inner
            .state
            .lock()
            .unwrap()
            .unreachable
            .keys()
            .copied()
            .collect()
    }

    pub fn is_alive(&self, ep: Endpoint) -> bool {
        if ep == self.inner.local {
            return true;
        }
        self.inner
            .state
            .lock()
            .unwrap()
            .endpoints
            .get(&ep)
            .is_some_and(|eps| eps.is_alive)
    }

    pub fn get_host_id(&self, ep: Endpoint) -> Option<HostId> {
        self.endpoint_state(ep)?.host_id()
    }

    /// Which endpoint started up earlier, by startup generation.
    pub fn compare_endpoint_startup(&self, a: Endpoint, b: Endpoint) -> Option<std::cmp::Ordering> {
        let state = self.inner.state.lock().unwrap();
        let ga = state.endpoints.get(&a)?.generation();
        let gb = state.endpoints.get(&b)?.generation();
        Some(ga.cmp(&gb))
    }

    pub fn get_endpoint_downtime(&self, ep: Endpoint) -> Option<Duration> {
        let state = self.inner.state.lock().unwrap();
        state
            .unreachable
            .get(&ep)
            .map(|since| since.elapsed())
    }

    pub fn add_expire_time_for_endpoint(&self, ep: Endpoint, expire: SystemTime) {
        self.inner
            .state
            .lock()
            .unwrap()
            .expire_times
            .insert(ep, expire);
    }

    pub fn compute_expire_time() -> SystemTime {
        SystemTime::now() + A_VERY_LONG_TIME
    }

    /// Bump the local generation past anything the cluster has seen for
    /// this node. Used when rejoining after a long partition, so peers
    /// treat the next exchange as a restart.
    pub fn force_newer_generation(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let local = self.inner.local;
        if let Some(eps) = state.endpoints.get_mut(&local) {
            eps.heartbeat.generation += 1;
            tracing::warn!(
                generation = eps.heartbeat.generation,
                "forced a newer local generation"
            );
        }
    }

    /// Watch the replicated endpoint-state snapshot; other shards read
    /// this instead of the live map.
    pub fn watch_states(&self) -> watch::Receiver<Arc<BTreeMap<Endpoint, EndpointState>>> {
        self.inner.snapshot_tx.subscribe()
    }

    // ---- removal advertisement (removenode) ----

    /// Begin removing a dead peer by spoofing its state: bump its
    /// generation and advertise REMOVING so every node excises it.
    pub fn advertise_removing(&self, ep: Endpoint, host_id: HostId, coordinator: HostId) {
        let mut state = self.inner.state.lock().unwrap();
        state.version += 2;
        let version = state.version;
        let Some(eps) = state.endpoints.get_mut(&ep) else {
            return;
        };
        eps.heartbeat.generation += 1;
        eps.heartbeat.version = version;
        eps.set(
            ApplicationState::Status,
            VersionedValue::new(Status::Removing(host_id).to_wire(), version),
        );
        eps.set(
            ApplicationState::RemovalCoordinator,
            VersionedValue::new(coordinator.to_string(), version - 1),
        );
        tracing::info!(%ep, %host_id, "advertising removal");
    }

    /// Finish a removal: advertise REMOVED with an expiry.
    pub fn advertise_token_removed(&self, ep: Endpoint, host_id: HostId) {
        let expire = Self::compute_expire_time();
        let expire_millis = expire
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.version += 1;
            let version = state.version;
            let Some(eps) = state.endpoints.get_mut(&ep) else {
                return;
            };
            eps.heartbeat.version = version;
            eps.set(
                ApplicationState::Status,
                VersionedValue::new(Status::Removed(host_id, expire_millis).to_wire(), version),
            );
            state.expire_times.insert(ep, expire);
        }
        tracing::info!(%ep, %host_id, "advertising token removal");
    }

    /// Force a peer out of the ring without coordination: advertise LEFT
    /// on its behalf with the standard expiry.
    pub fn assassinate_endpoint(&self, ep: Endpoint) {
        let expire = Self::compute_expire_time();
        let expire_millis = expire
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let mut state = self.inner.state.lock().unwrap();
        state.version += 1;
        let version = state.version;
        let tokens = state
            .endpoints
            .get(&ep)
            .and_then(EndpointState::tokens)
            .unwrap_or_default();
        let Some(eps) = state.endpoints.get_mut(&ep) else {
            return;
        };
        eps.heartbeat.generation += 1;
        eps.heartbeat.version = version;
        eps.set(
            ApplicationState::Status,
            VersionedValue::new(Status::Left(tokens, expire_millis).to_wire(), version),
        );
        state.expire_times.insert(ep, expire);
        tracing::warn!(%ep, "assassinated endpoint");
    }

    // ---- shadow round ----

    /// Learn the cluster's view before joining: send empty SYNs to seeds
    /// once a second until any peer supplies state.
    pub async fn do_shadow_round(&self) -> rpc::Result<()> {
        self.inner.in_shadow_round.store(true, Ordering::SeqCst);
        let seeds: Vec<Endpoint> = {
            let state = self.inner.state.lock().unwrap();
            state.seeds.iter().copied().collect()
        };
        if seeds.is_empty() {
            self.inner.in_shadow_round.store(false, Ordering::SeqCst);
            return Ok(());
        }
        let syn = DigestSyn {
            cluster_name: self.inner.cfg.cluster_name.clone(),
            partitioner_name: self.inner.cfg.partitioner_name.clone(),
            digests: Vec::new(),
        };
        let deadline = tokio::time::Instant::now() + self.inner.cfg.shadow_round_timeout;
        loop {
            for seed in &seeds {
                let meta = CallMeta::new(self.inner.local);
                if let Err(error) = self
                    .inner
                    .transport
                    .gossip_syn(*seed, syn.clone(), meta)
                    .await
                {
                    tracing::trace!(seed = %seed, %error, "shadow syn failed");
                }
            }
            {
                let state = self.inner.state.lock().unwrap();
                if !state.endpoints.is_empty() {
                    tracing::info!("shadow round complete");
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.inner.in_shadow_round.store(false, Ordering::SeqCst);
                return Err(rpc::Error::ConfigError(
                    "no seed answered the shadow round".to_string(),
                ));
            }
            tokio::time::sleep(INTERVAL).await;
        }
    }

    pub fn finish_shadow_round(&self) {
        self.inner.in_shadow_round.store(false, Ordering::SeqCst);
    }

    pub fn is_in_shadow_round(&self) -> bool {
        self.inner.in_shadow_round.load(Ordering::SeqCst)
    }

    /// Drop every endpoint state. Only sound right after a shadow round,
    /// before gossip starts for real.
    pub fn reset_endpoint_state_map(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.endpoints.clear();
        state.live.clear();
        state.live_just_added.clear();
        state.unreachable.clear();
    }

    /// Wait until gossip stops changing: three consecutive quiet polls.
    pub async fn wait_for_gossip_to_settle(&self) {
        const REQUIRED_QUIET_POLLS: usize = 3;
        let mut quiet = 0;
        let mut last: Option<(usize, i64)> = None;
        while quiet < REQUIRED_QUIET_POLLS {
            tokio::time::sleep(INTERVAL).await;
            let current = {
                let state = self.inner.state.lock().unwrap();
                let total_version: i64 = state.endpoints.values().map(EndpointState::max_version).sum();
                (state.endpoints.len(), total_version)
            };
            if last == Some(current) {
                quiet += 1;
            } else {
                quiet = 0;
                last = Some(current);
            }
        }
        tracing::info!("gossip settled");
    }

    // ---- features ----

    /// Features supported by every node this one knows about.
    pub fn common_features(&self) -> BTreeSet<String> {
        let state = self.inner.state.lock().unwrap();
        let mut sets = state
            .endpoints
            .values()
            .map(EndpointState::supported_features);
        let Some(first) = sets.next() else {
            return BTreeSet::new();
        };
        sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect())
    }

    /// Error when the cluster already enabled features this node lacks.
    pub fn check_knows_remote_features(&self, local: &BTreeSet<String>) -> rpc::Result<()> {
        let missing: Vec<String> = self
            .common_features()
            .difference(local)
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(rpc::Error::FeatureIncompatible(missing))
        }
    }

    /// Suspend until the cluster-common feature set covers `features`.
    pub async fn wait_for_feature_on_all_nodes(&self, features: &[&str]) {
        let mut rx = self.inner.features_tx.subscribe();
        loop {
            {
                let common = rx.borrow_and_update();
                if features.iter().all(|f| common.contains(*f)) {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Inner {
    fn for_each_subscriber(&self, f: impl Fn(&Arc<dyn GossipSubscriber>)) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in &subscribers {
            f(subscriber);
        }
    }

    fn real_mark_alive(&self, ep: Endpoint) {
        let eps = {
            let mut state = self.state.lock().unwrap();
            let Some(eps) = state.endpoints.get_mut(&ep) else {
                return;
            };
            eps.is_alive = true;
            eps.update_timestamp = Instant::now();
            let eps = eps.clone();
            state.live.insert(ep);
            if !state.live_just_added.contains(&ep) {
                state.live_just_added.push_back(ep);
            }
            state.unreachable.remove(&ep);
            state.expire_times.remove(&ep);
            eps
        };
        tracing::info!(%ep, "endpoint is now UP");
        self.for_each_subscriber(|s| s.on_alive(ep, &eps));
    }

    fn mark_dead(&self, ep: Endpoint) {
        let eps = {
            let mut state = self.state.lock().unwrap();
            let Some(eps) = state.endpoints.get_mut(&ep) else {
                return;
            };
            eps.is_alive = false;
            let eps = eps.clone();
            state.live.remove(&ep);
            state.live_just_added.retain(|e| *e != ep);
            state.unreachable.insert(ep, Instant::now());
            eps
        };
        tracing::info!(%ep, "endpoint is now DOWN");
        self.for_each_subscriber(|s| s.on_dead(ep, &eps));
    }

    fn mark_as_shutdown(&self, ep: Endpoint) {
        let known = self.state.lock().unwrap().endpoints.contains_key(&ep);
        if known {
            self.mark_dead(ep);
        }
    }

    fn evict_from_membership(&self, ep: Endpoint) {
        {
            let mut state = self.state.lock().unwrap();
            state.endpoints.remove(&ep);
            state.unreachable.remove(&ep);
            state.live.remove(&ep);
            state.live_just_added.retain(|e| *e != ep);
            state.just_removed.insert(ep, Instant::now());
            state.expire_times.remove(&ep);
        }
        self.fd.remove(ep);
        tracing::debug!(%ep, "evicted from membership");
    }
}

// Wire the gossip verbs into the node's message sink.
#[async_trait::async_trait]
impl rpc::MessageSink for Gossiper {
    async fn on_gossip_syn(&self, from: Endpoint, msg: DigestSyn) -> rpc::Result<()> {
        self.handle_syn(from, msg).await
    }

    async fn on_gossip_ack(&self, from: Endpoint, msg: DigestAck) -> rpc::Result<()> {
        self.handle_ack(from, msg).await
    }

    async fn on_gossip_ack2(&self, from: Endpoint, msg: DigestAck2) -> rpc::Result<()> {
        self.handle_ack2(from, msg).await
    }

    async fn on_gossip_echo(&self, _from: Endpoint) -> rpc::Result<()> {
        Ok(())
    }

    async fn on_gossip_shutdown(&self, from: Endpoint) -> rpc::Result<()> {
        self.handle_shutdown(from);
        Ok(())
    }
}
