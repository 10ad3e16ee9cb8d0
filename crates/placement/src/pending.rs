use crate::{ReplicationStrategy, TokenMetadata, Topology};
use models::Endpoint;
use partition::{Range, Token, TokenRange};
use std::collections::{BTreeSet, HashMap};

/// Ranges each endpoint stands to gain from in-flight topology changes.
/// Writes targeting a pending range also go to its future owner, so the
/// consistency guarantee holds across the transition.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PendingRanges {
    per_endpoint: HashMap<Endpoint, Vec<TokenRange>>,
}

impl PendingRanges {
    pub fn is_empty(&self) -> bool {
        self.per_endpoint.is_empty()
    }

    pub fn ranges_of(&self, endpoint: Endpoint) -> Vec<TokenRange> {
        self.per_endpoint.get(&endpoint).cloned().unwrap_or_default()
    }

    pub fn endpoints_for(&self, token: &Token) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self
            .per_endpoint
            .iter()
            .filter(|(_, ranges)| ranges.iter().any(|r| r.contains(token)))
            .map(|(ep, _)| *ep)
            .collect();
        out.sort();
        out
    }

    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.per_endpoint.keys().copied()
    }
}

/// Recompute pending ranges for one keyspace.
///
/// The ring is refined at the union of current and settled boundary
/// tokens; within each refined segment the replica set is constant on both
/// rings, so the future owners of the segment are exactly
/// `natural(settled) \ natural(current)`.
pub fn calculate_pending_ranges(
    tm: &TokenMetadata,
    strategy: &ReplicationStrategy,
    topology: &dyn Topology,
) -> PendingRanges {
    if !tm.has_transitions() {
        return PendingRanges::default();
    }
    let current = tm.clone_only_token_map();
    let settled = tm.clone_after_all_settled();

    let mut boundaries: BTreeSet<Token> = current.sorted_tokens().into_iter().collect();
    boundaries.extend(settled.sorted_tokens());
    if boundaries.is_empty() {
        return PendingRanges::default();
    }

    let mut out = PendingRanges::default();
    let tokens: Vec<Token> = boundaries.into_iter().collect();
    let mut prev = tokens.last().cloned().unwrap();
    for token in tokens {
        let now: BTreeSet<Endpoint> = strategy
            .natural_endpoints(&token, &current, topology)
            .into_iter()
            .collect();
        let later = strategy.natural_endpoints(&token, &settled, topology);

        for ep in later {
            if !now.contains(&ep) {
                let range = if prev == token {
                    // Single boundary: the whole ring is one segment.
                    Range::full()
                } else {
                    Range::open_closed(prev.clone(), token.clone())
                };
                out.per_endpoint.entry(ep).or_default().push(range);
            }
        }
        prev = token;
    }
    out
}
