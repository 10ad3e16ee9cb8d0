use crate::PendingRanges;
use models::{Endpoint, HostId};
use partition::{ring_ranges, Token, TokenRange};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Snapshot of ring membership: who owns which tokens, who is joining,
/// draining, or moving, and the durable host-id of each address.
///
/// Readers hold cloned snapshots; a single writer mutates its own copy and
/// publishes it whole, so no operation here takes locks.
#[derive(Debug, Clone, Default)]
pub struct TokenMetadata {
    normal: BTreeMap<Token, Endpoint>,
    bootstrapping: BTreeMap<Token, Endpoint>,
    leaving: BTreeSet<Endpoint>,
    moving: BTreeMap<Endpoint, Token>,
    host_ids: BTreeMap<Endpoint, HostId>,
    /// Pending ranges per keyspace, installed after recomputation.
    pending: HashMap<String, Arc<PendingRanges>>,
}

impl TokenMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote `endpoint` to a normal member owning exactly `tokens`.
    /// Clears its bootstrap/leaving/moving entries and evicts previous
    /// owners of those tokens.
    pub fn update_normal_tokens(&mut self, tokens: impl IntoIterator<Item = Token>, endpoint: Endpoint) {
        self.bootstrapping.retain(|_, ep| *ep != endpoint);
        self.leaving.remove(&endpoint);
        self.moving.remove(&endpoint);
        self.normal.retain(|_, ep| *ep != endpoint);
        for token in tokens {
            if let Some(prev) = self.normal.insert(token.clone(), endpoint) {
                if prev != endpoint {
                    tracing::warn!(%token, %prev, now = %endpoint, "token changed ownership");
                }
            }
        }
    }

    pub fn add_bootstrap_tokens(
        &mut self,
        tokens: impl IntoIterator<Item = Token>,
        endpoint: Endpoint,
    ) {
        self.bootstrapping.retain(|_, ep| *ep != endpoint);
        for token in tokens {
            self.bootstrapping.insert(token, endpoint);
        }
    }

    pub fn remove_bootstrap_tokens(&mut self, endpoint: Endpoint) {
        self.bootstrapping.retain(|_, ep| *ep != endpoint);
    }

    pub fn add_leaving_endpoint(&mut self, endpoint: Endpoint) {
        self.leaving.insert(endpoint);
    }

    pub fn add_moving_endpoint(&mut self, token: Token, endpoint: Endpoint) {
        self.moving.insert(endpoint, token);
    }

    pub fn remove_moving_endpoint(&mut self, endpoint: Endpoint) {
        self.moving.remove(&endpoint);
    }

    /// Drop `endpoint` from every membership table. The host-id mapping is
    /// kept: a removed address may still be referenced by its durable id.
    pub fn remove_endpoint(&mut self, endpoint: Endpoint) {
        self.normal.retain(|_, ep| *ep != endpoint);
        self.bootstrapping.retain(|_, ep| *ep != endpoint);
        self.leaving.remove(&endpoint);
        self.moving.remove(&endpoint);
    }

    /// Bind `endpoint` to its durable id. Returns the previous address
    /// bound to that id when a collision displaced it; the caller decides
    /// the eviction by comparing startup generations.
    pub fn update_host_id(&mut self, host_id: HostId, endpoint: Endpoint) -> Option<Endpoint> {
        let displaced = self
            .host_ids
            .iter()
            .find(|(ep, id)| **id == host_id && **ep != endpoint)
            .map(|(ep, _)| *ep);
        if let Some(old) = displaced {
            self.host_ids.remove(&old);
        }
        self.host_ids.insert(endpoint, host_id);
        displaced
    }

    pub fn host_id(&self, endpoint: Endpoint) -> Option<HostId> {
        self.host_ids.get(&endpoint).copied()
    }

    pub fn endpoint_for_host_id(&self, host_id: HostId) -> Option<Endpoint> {
        self.host_ids
            .iter()
            .find(|(_, id)| **id == host_id)
            .map(|(ep, _)| *ep)
    }

    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.normal.keys().cloned().collect()
    }

    pub fn tokens_of(&self, endpoint: Endpoint) -> Vec<Token> {
        self.normal
            .iter()
            .filter(|(_, ep)| **ep == endpoint)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Owner of the first ring token at or after `token`, wrapping to the
    /// first token of the ring.
    pub fn get_endpoint(&self, token: &Token) -> Option<Endpoint> {
        self.normal
            .range(token.clone()..)
            .next()
            .or_else(|| self.normal.iter().next())
            .map(|(_, ep)| *ep)
    }

    /// The `count` distinct ring tokens at or after `token`, in ring walk
    /// order.
    pub fn ring_iter<'a>(&'a self, token: &Token) -> impl Iterator<Item = &'a Token> + 'a {
        self.normal
            .range(token.clone()..)
            .map(|(t, _)| t)
            .chain(self.normal.iter().map(|(t, _)| t))
            .take(self.normal.len())
    }

    pub fn owner(&self, token: &Token) -> Option<Endpoint> {
        self.normal.get(token).copied()
    }

    pub fn is_member(&self, endpoint: Endpoint) -> bool {
        self.normal.values().any(|ep| *ep == endpoint)
    }

    pub fn is_leaving(&self, endpoint: Endpoint) -> bool {
        self.leaving.contains(&endpoint)
    }

    pub fn is_moving(&self, endpoint: Endpoint) -> bool {
        self.moving.contains_key(&endpoint)
    }

    pub fn normal_endpoints(&self) -> BTreeSet<Endpoint> {
        self.normal.values().copied().collect()
    }

    pub fn bootstrapping_endpoints(&self) -> BTreeSet<Endpoint> {
        self.bootstrapping.values().copied().collect()
    }

    pub fn leaving_endpoints(&self) -> &BTreeSet<Endpoint> {
        &self.leaving
    }

    pub fn moving_endpoints(&self) -> &BTreeMap<Endpoint, Token> {
        &self.moving
    }

    pub fn token_count(&self) -> usize {
        self.normal.len()
    }

    /// Ranges of the ring delimited by this ring's tokens, each paired with
    /// the token closing it.
    pub fn token_ranges(&self) -> Vec<TokenRange> {
        ring_ranges(&self.sorted_tokens())
    }

    /// Ranges for which `endpoint` is the primary owner: one `(prev, t]`
    /// per token it holds.
    pub fn primary_ranges_for(&self, endpoint: Endpoint) -> Vec<TokenRange> {
        let sorted = self.sorted_tokens();
        let ranges = ring_ranges(&sorted);
        // ring_ranges yields one leading range per first token plus the
        // trailing wrap piece; a range belongs to the owner of the token
        // closing it, and the trailing piece to the first token's owner.
        ranges
            .into_iter()
            .filter(|range| {
                let owner = match &range.end {
                    Some(bound) => self.owner(&bound.value),
                    None => sorted.first().and_then(|t| self.owner(t)),
                };
                owner == Some(endpoint)
            })
            .collect()
    }

    // Snapshots for reasoning about transitional topology.

    /// Only the token → endpoint map and host ids; no transitions.
    pub fn clone_only_token_map(&self) -> TokenMetadata {
        TokenMetadata {
            normal: self.normal.clone(),
            host_ids: self.host_ids.clone(),
            ..Default::default()
        }
    }

    /// The ring as it will stand once every leaving endpoint has left.
    pub fn clone_after_all_left(&self) -> TokenMetadata {
        let mut out = self.clone_only_token_map();
        for ep in &self.leaving {
            out.remove_endpoint(*ep);
        }
        out
    }

    /// The ring as it will stand once every transition settles: leavers
    /// gone, bootstrappers normal, movers at their target token.
    pub fn clone_after_all_settled(&self) -> TokenMetadata {
        let mut out = self.clone_after_all_left();
        let mut by_endpoint: BTreeMap<Endpoint, Vec<Token>> = BTreeMap::new();
        for (token, ep) in &self.bootstrapping {
            by_endpoint.entry(*ep).or_default().push(token.clone());
        }
        for (ep, tokens) in by_endpoint {
            out.update_normal_tokens(tokens, ep);
        }
        for (ep, token) in &self.moving {
            out.update_normal_tokens([token.clone()], *ep);
        }
        out
    }

    /// Whether any transition is in flight.
    pub fn has_transitions(&self) -> bool {
        !self.bootstrapping.is_empty() || !self.leaving.is_empty() || !self.moving.is_empty()
    }

    // Pending-range table, replaced whole after recomputation; readers of a
    // snapshot keep seeing the table it was published with.

    pub fn set_pending_ranges(&mut self, keyspace: &str, pending: Arc<PendingRanges>) {
        self.pending.insert(keyspace.to_string(), pending);
    }

    pub fn get_pending_ranges(&self, keyspace: &str, endpoint: Endpoint) -> Vec<TokenRange> {
        self.pending
            .get(keyspace)
            .map(|p| p.ranges_of(endpoint))
            .unwrap_or_default()
    }

    /// Endpoints which will own `token` once in-flight transitions settle
    /// but do not own it yet.
    pub fn pending_endpoints_for(&self, keyspace: &str, token: &Token) -> Vec<Endpoint> {
        self.pending
            .get(keyspace)
            .map(|p| p.endpoints_for(token))
            .unwrap_or_default()
    }

    /// Every endpoint with any pending range in `keyspace`.
    pub fn pending_endpoint_set(&self, keyspace: &str) -> Vec<Endpoint> {
        self.pending
            .get(keyspace)
            .map(|p| p.endpoints().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    fn t(v: u64) -> Token {
        Token::from_u64(v)
    }

    #[test]
    fn normal_tokens_displace_previous_owner() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens([t(10), t(20)], ep("10.0.0.1"));
        tm.update_normal_tokens([t(20), t(30)], ep("10.0.0.2"));

        assert_eq!(tm.owner(&t(10)), Some(ep("10.0.0.1")));
        assert_eq!(tm.owner(&t(20)), Some(ep("10.0.0.2")));
        assert_eq!(tm.owner(&t(30)), Some(ep("10.0.0.2")));
    }

    #[test]
    fn update_normal_clears_transition_state() {
        let mut tm = TokenMetadata::new();
        tm.add_bootstrap_tokens([t(10)], ep("10.0.0.1"));
        tm.update_normal_tokens([t(10)], ep("10.0.0.1"));
        assert!(tm.bootstrapping_endpoints().is_empty());
        assert!(tm.is_member(ep("10.0.0.1")));
    }

    #[test]
    fn get_endpoint_walks_the_ring() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens([t(10)], ep("10.0.0.1"));
        tm.update_normal_tokens([t(20)], ep("10.0.0.2"));

        assert_eq!(tm.get_endpoint(&t(5)), Some(ep("10.0.0.1")));
        assert_eq!(tm.get_endpoint(&t(10)), Some(ep("10.0.0.1")));
        assert_eq!(tm.get_endpoint(&t(11)), Some(ep("10.0.0.2")));
        // Wraps past the last token.
        assert_eq!(tm.get_endpoint(&t(21)), Some(ep("10.0.0.1")));
    }

    #[test]
    fn host_id_collision_reports_displaced_address() {
        let mut tm = TokenMetadata::new();
        let id = HostId::random();
        assert_eq!(tm.update_host_id(id, ep("10.0.0.1")), None);
        assert_eq!(tm.update_host_id(id, ep("10.0.0.2")), Some(ep("10.0.0.1")));
        assert_eq!(tm.endpoint_for_host_id(id), Some(ep("10.0.0.2")));
    }

    #[test]
    fn remove_endpoint_keeps_host_id() {
        let mut tm = TokenMetadata::new();
        let id = HostId::random();
        tm.update_host_id(id, ep("10.0.0.1"));
        tm.update_normal_tokens([t(10)], ep("10.0.0.1"));
        tm.remove_endpoint(ep("10.0.0.1"));

        assert!(!tm.is_member(ep("10.0.0.1")));
        assert_eq!(tm.host_id(ep("10.0.0.1")), Some(id));
    }

    #[test]
    fn settled_clone_applies_all_transitions() {
        let mut tm = TokenMetadata::new();
        tm.update_normal_tokens([t(10)], ep("10.0.0.1"));
        tm.update_normal_tokens([t(20)], ep("10.0.0.2"));
        tm.update_normal_tokens([t(30)], ep("10.0.0.3"));
        tm.add_leaving_endpoint(ep("10.0.0.3"));
        tm.add_bootstrap_tokens([t(15)], ep("10.0.0.4"));
        tm.add_moving_endpoint(t(25), ep("10.0.0.2"));

        let settled = tm.clone_after_all_settled();
        assert!(!settled.is_member(ep("10.0.0.3")));
        assert_eq!(settled.owner(&t(15)), Some(ep("10.0.0.4")));
        assert_eq!(settled.owner(&t(25)), Some(ep("10.0.0.2")));
        assert_eq!(settled.owner(&t(20)), None);
        assert!(!settled.has_transitions());
    }
}
