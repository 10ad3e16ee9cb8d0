use models::{Endpoint, HostId};
use partition::{Token, TokenRange};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One row of the peers table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerInfo {
    pub host_id: Option<HostId>,
    pub data_center: Option<String>,
    pub rack: Option<String>,
    pub rpc_address: Option<String>,
    pub release_version: Option<String>,
    pub schema_version: Option<uuid::Uuid>,
    pub supported_features: Option<String>,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NeedsBootstrap,
    InProgress,
    Completed,
}

/// Durable node-local state, owned by the external storage engine: the
/// local row (generation, host id, tokens) and one row per known peer.
pub trait SystemTables: Send + Sync + 'static {
    /// Bump and persist the startup generation, returning the new value.
    fn increment_generation(&self) -> i64;
    fn host_id(&self) -> HostId;
    fn load_tokens(&self) -> Vec<Token>;
    fn save_tokens(&self, tokens: &[Token]);
    fn bootstrap_state(&self) -> BootstrapState;
    fn set_bootstrap_state(&self, state: BootstrapState);
    fn update_peer(&self, endpoint: Endpoint, info: PeerInfo);
    fn remove_peer(&self, endpoint: Endpoint);
    fn peers(&self) -> BTreeMap<Endpoint, PeerInfo>;
    fn replay_batchlog(&self);
}

/// In-memory system tables for tests and embedded use.
pub struct MemSystemTables {
    state: Mutex<MemSystemState>,
}

struct MemSystemState {
    generation: i64,
    host_id: HostId,
    tokens: Vec<Token>,
    bootstrap: BootstrapState,
    peers: BTreeMap<Endpoint, PeerInfo>,
}

impl MemSystemTables {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemSystemState {
                generation: 0,
                host_id: HostId::random(),
                tokens: Vec::new(),
                bootstrap: BootstrapState::NeedsBootstrap,
                peers: BTreeMap::new(),
            }),
        }
    }
}

impl Default for MemSystemTables {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTables for MemSystemTables {
    fn increment_generation(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        state.generation = wall.max(state.generation + 1);
        state.generation
    }

    fn host_id(&self) -> HostId {
        self.state.lock().unwrap().host_id
    }

    fn load_tokens(&self) -> Vec<Token> {
        self.state.lock().unwrap().tokens.clone()
    }

    fn save_tokens(&self, tokens: &[Token]) {
        self.state.lock().unwrap().tokens = tokens.to_vec();
    }

    fn bootstrap_state(&self) -> BootstrapState {
        self.state.lock().unwrap().bootstrap
    }

    fn set_bootstrap_state(&self, state: BootstrapState) {
        self.state.lock().unwrap().bootstrap = state;
    }

    fn update_peer(&self, endpoint: Endpoint, info: PeerInfo) {
        self.state.lock().unwrap().peers.insert(endpoint, info);
    }

    fn remove_peer(&self, endpoint: Endpoint) {
        self.state.lock().unwrap().peers.remove(&endpoint);
    }

    fn peers(&self) -> BTreeMap<Endpoint, PeerInfo> {
        self.state.lock().unwrap().peers.clone()
    }

    fn replay_batchlog(&self) {}
}

/// A planned transfer of ranges to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    pub keyspace: String,
    pub transfers: Vec<(TokenRange, Endpoint)>,
}

/// Bulk data mover, an external collaborator: only its control-plane
/// trigger points appear in the lifecycle operations here.
#[async_trait::async_trait]
pub trait Streamer: Send + Sync + 'static {
    /// Pull the ranges this joining node will own from their current
    /// replicas.
    async fn bootstrap(&self, plans: Vec<TransferPlan>) -> rpc::Result<()>;

    /// Push ranges to their future owners (decommission, move).
    async fn stream_ranges(&self, plans: Vec<TransferPlan>) -> rpc::Result<()>;

    /// Re-replicate data lost with `removed`; invoked on surviving
    /// replicas during removenode.
    async fn restore_replica_count(&self, removed: Endpoint) -> rpc::Result<()>;

    /// Stream everything local from another datacenter without touching
    /// membership.
    async fn rebuild(&self, source_dc: Option<String>) -> rpc::Result<()>;

    async fn stream_hints(&self) -> rpc::Result<()>;
}

/// Streamer that records invocations and completes immediately.
#[derive(Default)]
pub struct NoopStreamer {
    pub bootstraps: Mutex<usize>,
    pub streamed: Mutex<Vec<TransferPlan>>,
    pub restored: Mutex<BTreeSet<Endpoint>>,
}

#[async_trait::async_trait]
impl Streamer for NoopStreamer {
    async fn bootstrap(&self, _plans: Vec<TransferPlan>) -> rpc::Result<()> {
        *self.bootstraps.lock().unwrap() += 1;
        Ok(())
    }

    async fn stream_ranges(&self, plans: Vec<TransferPlan>) -> rpc::Result<()> {
        self.streamed.lock().unwrap().extend(plans);
        Ok(())
    }

    async fn restore_replica_count(&self, removed: Endpoint) -> rpc::Result<()> {
        self.restored.lock().unwrap().insert(removed);
        Ok(())
    }

    async fn rebuild(&self, _source_dc: Option<String>) -> rpc::Result<()> {
        Ok(())
    }

    async fn stream_hints(&self) -> rpc::Result<()> {
        Ok(())
    }
}
