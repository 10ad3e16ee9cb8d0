use crate::{Endpoint, HostId};
use partition::Token;
use std::collections::BTreeMap;
use std::time::Instant;

/// Versioned key-value pairs disseminated per endpoint. Declaration order
/// is the wire tag order and must not change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ApplicationState {
    Status,
    Tokens,
    HostId,
    Dc,
    Rack,
    Schema,
    RpcAddress,
    SupportedFeatures,
    InternalIp,
    NetVersion,
    RemovalCoordinator,
    ReleaseVersion,
    Load,
    ShardCount,
}

/// A state value with the version it was generated at. Versions are
/// monotonic within a generation and drawn from the same counter as the
/// heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionedValue {
    pub value: String,
    pub version: i64,
}

impl VersionedValue {
    pub fn new(value: impl Into<String>, version: i64) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Status values carried in the [`ApplicationState::Status`] slot. The wire
/// form is comma-separated: the status name, then its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Bootstrapping(Vec<Token>),
    Normal(Vec<Token>),
    Leaving(Vec<Token>),
    /// Tokens plus the expiry past which the departed peer's state may be
    /// evicted, in milliseconds since the epoch.
    Left(Vec<Token>, i64),
    Moving(Token),
    /// A peer is being forcibly removed; carries its host id.
    Removing(HostId),
    Removed(HostId, i64),
    Hibernate,
    Shutdown,
}

const STATUS_BOOTSTRAPPING: &str = "BOOT";
const STATUS_NORMAL: &str = "NORMAL";
const STATUS_LEAVING: &str = "LEAVING";
const STATUS_LEFT: &str = "LEFT";
const STATUS_MOVING: &str = "MOVING";
const STATUS_REMOVING: &str = "removing";
const STATUS_REMOVED: &str = "removed";
const STATUS_HIBERNATE: &str = "hibernate";
const STATUS_SHUTDOWN: &str = "shutdown";

fn join_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| hex(&t.to_bytes()))
        .collect::<Vec<_>>()
        .join(";")
}

fn split_tokens(s: &str) -> Option<Vec<Token>> {
    s.split(';')
        .filter(|p| !p.is_empty())
        .map(|p| Token::from_bytes(&unhex(p)?))
        .collect()
}

fn hex(b: &[u8]) -> String {
    b.iter().map(|x| format!("{x:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

impl Status {
    pub fn to_wire(&self) -> String {
        match self {
            Status::Bootstrapping(tokens) => {
                format!("{STATUS_BOOTSTRAPPING},{}", join_tokens(tokens))
            }
            Status::Normal(tokens) => format!("{STATUS_NORMAL},{}", join_tokens(tokens)),
            Status::Leaving(tokens) => format!("{STATUS_LEAVING},{}", join_tokens(tokens)),
            Status::Left(tokens, expire) => {
                format!("{STATUS_LEFT},{},{expire}", join_tokens(tokens))
            }
            Status::Moving(token) => format!("{STATUS_MOVING},{}", hex(&token.to_bytes())),
            Status::Removing(host_id) => format!("{STATUS_REMOVING},{host_id}"),
            Status::Removed(host_id, expire) => format!("{STATUS_REMOVED},{host_id},{expire}"),
            Status::Hibernate => format!("{STATUS_HIBERNATE},true"),
            Status::Shutdown => format!("{STATUS_SHUTDOWN},true"),
        }
    }

    pub fn from_wire(s: &str) -> Option<Status> {
        let mut parts = s.splitn(3, ',');
        let name = parts.next()?;
        let arg1 = parts.next();
        let arg2 = parts.next();
        match name {
            STATUS_BOOTSTRAPPING => Some(Status::Bootstrapping(split_tokens(arg1?)?)),
            STATUS_NORMAL => Some(Status::Normal(split_tokens(arg1?)?)),
            STATUS_LEAVING => Some(Status::Leaving(split_tokens(arg1?)?)),
            STATUS_LEFT => Some(Status::Left(
                split_tokens(arg1?)?,
                arg2?.parse::<i64>().ok()?,
            )),
            STATUS_MOVING => {
                let mut tokens = split_tokens(arg1?)?;
                (tokens.len() == 1).then(|| Status::Moving(tokens.remove(0)))
            }
            STATUS_REMOVING => Some(Status::Removing(HostId::parse(arg1?)?)),
            STATUS_REMOVED => Some(Status::Removed(
                HostId::parse(arg1?)?,
                arg2?.parse::<i64>().ok()?,
            )),
            STATUS_HIBERNATE => Some(Status::Hibernate),
            STATUS_SHUTDOWN => Some(Status::Shutdown),
            _ => None,
        }
    }

    /// States in which the peer is gone from the ring and must not be
    /// marked alive.
    pub fn is_dead_state(&self) -> bool {
        matches!(
            self,
            Status::Removing(_) | Status::Removed(..) | Status::Left(..) | Status::Hibernate
        )
    }

    /// Dead states plus bootstrap: peers from which silence is expected
    /// and shutdown needs no announcement.
    pub fn is_silent_shutdown_state(&self) -> bool {
        self.is_dead_state() || matches!(self, Status::Bootstrapping(_))
    }
}

/// Generation (restart counter) and heartbeat version of one endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct HeartbeatState {
    pub generation: i64,
    pub version: i64,
}

impl HeartbeatState {
    pub fn new(generation: i64) -> Self {
        Self {
            generation,
            version: 0,
        }
    }

    pub fn bump(&mut self) -> i64 {
        self.version += 1;
        self.version
    }
}

/// Everything one node believes about one endpoint. Liveness and the local
/// update timestamp are never exchanged on the wire.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EndpointState {
    pub heartbeat: HeartbeatState,
    pub application_states: BTreeMap<ApplicationState, VersionedValue>,
    #[serde(skip, default = "default_alive")]
    pub is_alive: bool,
    #[serde(skip, default = "Instant::now")]
    pub update_timestamp: Instant,
}

fn default_alive() -> bool {
    true
}

impl PartialEq for EndpointState {
    fn eq(&self, other: &Self) -> bool {
        // Wire-visible content only.
        self.heartbeat == other.heartbeat && self.application_states == other.application_states
    }
}

impl EndpointState {
    pub fn new(generation: i64) -> Self {
        Self {
            heartbeat: HeartbeatState::new(generation),
            application_states: BTreeMap::new(),
            is_alive: true,
            update_timestamp: Instant::now(),
        }
    }

    pub fn generation(&self) -> i64 {
        self.heartbeat.generation
    }

    /// Greatest version across the heartbeat and every application state.
    pub fn max_version(&self) -> i64 {
        self.application_states
            .values()
            .map(|v| v.version)
            .chain([self.heartbeat.version])
            .max()
            .unwrap_or(0)
    }

    pub fn get(&self, state: ApplicationState) -> Option<&VersionedValue> {
        self.application_states.get(&state)
    }

    pub fn set(&mut self, state: ApplicationState, value: VersionedValue) {
        self.application_states.insert(state, value);
        self.update_timestamp = Instant::now();
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_wire(&self.get(ApplicationState::Status)?.value)
    }

    pub fn tokens(&self) -> Option<Vec<Token>> {
        split_tokens(&self.get(ApplicationState::Tokens)?.value)
    }

    pub fn host_id(&self) -> Option<HostId> {
        HostId::parse(&self.get(ApplicationState::HostId)?.value)
    }

    pub fn supported_features(&self) -> std::collections::BTreeSet<String> {
        self.get(ApplicationState::SupportedFeatures)
            .map(|v| {
                v.value
                    .split(',')
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The sub-state holding everything with version strictly greater than
    /// `version`, or `None` when nothing is newer.
    pub fn state_newer_than(&self, version: i64) -> Option<EndpointState> {
        let mut out: Option<EndpointState> = None;
        if self.heartbeat.version > version {
            out = Some(EndpointState {
                heartbeat: self.heartbeat,
                application_states: BTreeMap::new(),
                is_alive: true,
                update_timestamp: Instant::now(),
            });
        }
        for (state, value) in &self.application_states {
            if value.version > version {
                out.get_or_insert_with(|| EndpointState {
                    heartbeat: self.heartbeat,
                    application_states: BTreeMap::new(),
                    is_alive: true,
                    update_timestamp: Instant::now(),
                })
                .application_states
                .insert(*state, value.clone());
            }
        }
        out
    }
}

/// Wire form of the TOKENS application state: hex tokens joined by `;`.
pub fn tokens_wire(tokens: &[Token]) -> String {
    join_tokens(tokens)
}

/// Wire helper for the TOKENS application state.
pub fn tokens_value(tokens: &[Token], version: i64) -> VersionedValue {
    VersionedValue::new(join_tokens(tokens), version)
}

/// Digest of one endpoint's state, exchanged to decide who sends what.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GossipDigest {
    pub endpoint: Endpoint,
    pub generation: i64,
    pub max_version: i64,
}

#[cfg(test)]
mod test {
    use super::*;
    use partition::Token;

    fn tokens() -> Vec<Token> {
        vec![Token::from_u64(1), Token::from_u64(0xdead_beef)]
    }

    #[test]
    fn status_wire_round_trip() {
        let host = HostId::random();
        for status in [
            Status::Bootstrapping(tokens()),
            Status::Normal(tokens()),
            Status::Leaving(tokens()),
            Status::Left(tokens(), 1_700_000_123_456),
            Status::Moving(Token::from_u64(7)),
            Status::Removing(host),
            Status::Removed(host, 99),
            Status::Hibernate,
            Status::Shutdown,
        ] {
            assert_eq!(Status::from_wire(&status.to_wire()), Some(status));
        }
    }

    #[test]
    fn status_wire_grammar() {
        let tokens = vec![Token::from_u64(1), Token::from_u64(0xff)];
        let host = HostId::parse("5e08b2cd-bd6f-4f95-b1a9-4f5f85a3b1c7").unwrap();
        let rendered = [
            Status::Bootstrapping(tokens.clone()),
            Status::Normal(tokens.clone()),
            Status::Leaving(tokens.clone()),
            Status::Left(tokens.clone(), 1_700_000_000_000),
            Status::Moving(Token::from_u64(7)),
            Status::Removing(host),
            Status::Removed(host, 1_700_000_000_000),
            Status::Hibernate,
            Status::Shutdown,
        ]
        .iter()
        .map(Status::to_wire)
        .collect::<Vec<_>>()
        .join("\n");
        insta::assert_snapshot!(rendered, @r###"
        BOOT,010000000000000001;0100000000000000ff
        NORMAL,010000000000000001;0100000000000000ff
        LEAVING,010000000000000001;0100000000000000ff
        LEFT,010000000000000001;0100000000000000ff,1700000000000
        MOVING,010000000000000007
        removing,5e08b2cd-bd6f-4f95-b1a9-4f5f85a3b1c7
        removed,5e08b2cd-bd6f-4f95-b1a9-4f5f85a3b1c7,1700000000000
        hibernate,true
        shutdown,true
        "###);
    }

    #[test]
    fn dead_state_classification() {
        assert!(Status::Left(tokens(), 0).is_dead_state());
        assert!(Status::Hibernate.is_dead_state());
        assert!(!Status::Normal(tokens()).is_dead_state());
        assert!(!Status::Bootstrapping(tokens()).is_dead_state());
        assert!(Status::Bootstrapping(tokens()).is_silent_shutdown_state());
    }

    #[test]
    fn max_version_covers_heartbeat_and_states() {
        let mut state = EndpointState::new(3);
        state.heartbeat.version = 5;
        state.set(ApplicationState::Dc, VersionedValue::new("dc1", 9));
        assert_eq!(state.max_version(), 9);
        state.heartbeat.version = 12;
        assert_eq!(state.max_version(), 12);
    }

    #[test]
    fn state_newer_than_filters_by_version() {
        let mut state = EndpointState::new(1);
        state.heartbeat.version = 4;
        state.set(ApplicationState::Dc, VersionedValue::new("dc1", 2));
        state.set(ApplicationState::Rack, VersionedValue::new("r1", 6));

        let delta = state.state_newer_than(4).unwrap();
        assert_eq!(delta.application_states.len(), 1);
        assert!(delta.get(ApplicationState::Rack).is_some());

        assert!(state.state_newer_than(6).is_none());
    }

    #[test]
    fn endpoint_state_serde_skips_liveness() {
        let mut state = EndpointState::new(1);
        state.is_alive = false;
        let json = serde_json::to_string(&state).unwrap();
        let back: EndpointState = serde_json::from_str(&json).unwrap();
        assert!(back.is_alive);
        assert_eq!(back, state);
    }
}
