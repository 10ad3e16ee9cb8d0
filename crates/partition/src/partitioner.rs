use crate::{maximum_token, minimum_token, murmur3, Error, Token, TokenKind};
use std::cmp::Ordering;
use std::sync::Arc;

/// A partitioner maps partition keys onto ring tokens, orders tokens, and
/// assigns contiguous token segments to local shards.
///
/// Implementations must be deterministic and identical cluster-wide.
pub trait Partitioner: Send + Sync + 'static {
    /// Cluster-wide name, exchanged during gossip and checked on handshake.
    fn name(&self) -> &'static str;

    /// Token of a partition key.
    fn token_of(&self, key: &[u8]) -> Token;

    /// Total order of tokens: kind dominates, then the partitioner's byte
    /// comparison for key tokens.
    fn tri_compare(&self, a: &Token, b: &Token) -> Ordering {
        a.cmp(b)
    }

    /// Ring midpoint of `a` and `b`.
    fn midpoint(&self, a: &Token, b: &Token) -> Token;

    /// Number of local shards contiguous token segments are split over.
    fn shard_count(&self) -> u32;

    /// Shard owning `t`.
    fn shard_of(&self, t: &Token) -> u32;

    /// First token of the shard segment following the one holding `t`, or
    /// the maximum token when no boundary remains. Repeated application
    /// yields strictly increasing tokens.
    fn token_for_next_shard(&self, t: &Token) -> Token;

    fn shard_of_minimum_token(&self) -> u32 {
        0
    }

    /// Fraction of the ring delimited by each token, keyed by token.
    /// The wrap-around segment is attributed to the first token; the
    /// fractions sum to 1.
    fn describe_ownership(&self, sorted_tokens: &[Token]) -> Vec<(Token, f64)>;
}

/// Murmur3-based partitioner: keys hash with a zero-seeded 128-bit murmur3
/// and the first 64 bits form the token, interpreted as an unsigned
/// big-endian fraction of the ring.
pub struct Murmur3Partitioner {
    shard_count: u32,
    // Shift tokens left by this many bits before sharding, so that runs of
    // consecutive tokens land on one shard.
    ignore_msb: u32,
}

impl Murmur3Partitioner {
    pub const NAME: &'static str = "Murmur3Partitioner";

    pub fn new(shard_count: u32, ignore_msb: u32) -> Result<Self, Error> {
        if shard_count == 0 {
            return Err(Error::ZeroShards);
        }
        Ok(Self {
            shard_count,
            ignore_msb: ignore_msb.min(63),
        })
    }

    // Width of the in-segment fraction, in bits.
    fn width(&self) -> u32 {
        64 - self.ignore_msb
    }

    fn segment_of(&self, u: u64) -> u64 {
        if self.ignore_msb == 0 {
            0
        } else {
            u >> self.width()
        }
    }

    fn low_of(&self, u: u64) -> u64 {
        u & (u64::MAX >> self.ignore_msb)
    }

    fn shard_of_u64(&self, u: u64) -> u32 {
        let low = self.low_of(u) as u128;
        ((low * self.shard_count as u128) >> self.width()) as u32
    }
}

impl Partitioner for Murmur3Partitioner {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn token_of(&self, key: &[u8]) -> Token {
        let (h1, _h2) = murmur3::hash3_x64_128(key, 0);
        Token::from_u64(h1)
    }

    fn midpoint(&self, a: &Token, b: &Token) -> Token {
        match (a.kind(), b.kind()) {
            (TokenKind::AfterAllKeys, TokenKind::AfterAllKeys) => a.clone(),
            _ => {
                // Unsigned average, rounding up. Sentinels read as the u64
                // edges, which is exact enough for ring splitting.
                let (x, y) = (a.to_u64() as u128, b.to_u64() as u128);
                Token::from_u64(((x + y + 1) >> 1) as u64)
            }
        }
    }

    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn shard_of(&self, t: &Token) -> u32 {
        match t.kind() {
            TokenKind::BeforeAllKeys => 0,
            TokenKind::AfterAllKeys => self.shard_count - 1,
            TokenKind::Key => self.shard_of_u64(t.to_u64()),
        }
    }

    fn token_for_next_shard(&self, t: &Token) -> Token {
        if t.is_maximum() {
            return maximum_token();
        }
        let u = match t.kind() {
            TokenKind::BeforeAllKeys => 0,
            _ => t.to_u64(),
        };
        let width = self.width();
        let seg = self.segment_of(u);
        let shard = self.shard_of_u64(u);

        if shard + 1 < self.shard_count {
            // First in-segment fraction owned by the next shard.
            let lb = ((1u128 << width) * (shard as u128 + 1) + self.shard_count as u128 - 1)
                / self.shard_count as u128;
            let base = if self.ignore_msb == 0 { 0 } else { seg << width };
            Token::from_u64(base | lb as u64)
        } else if self.ignore_msb > 0 && seg + 1 < (1u64 << self.ignore_msb) {
            // Wrap to shard zero of the following segment.
            Token::from_u64((seg + 1) << width)
        } else {
            maximum_token()
        }
    }

    fn describe_ownership(&self, sorted_tokens: &[Token]) -> Vec<(Token, f64)> {
        let Some(first) = sorted_tokens.first() else {
            return Vec::new();
        };
        if sorted_tokens.len() == 1 {
            return vec![(first.clone(), 1.0)];
        }
        let mut out = Vec::with_capacity(sorted_tokens.len());
        let mut prev = sorted_tokens.last().unwrap().to_u64();
        for t in sorted_tokens {
            let u = t.to_u64();
            // Wrapping difference covers the segment through the ring origin.
            let width = u.wrapping_sub(prev);
            out.push((t.clone(), width as f64 / 2f64.powi(64)));
            prev = u;
        }
        out
    }
}

/// Build a partitioner from its cluster-wide name. New partitioners
/// register here.
pub fn partitioner_from_name(
    name: &str,
    shard_count: u32,
    ignore_msb: u32,
) -> Result<Arc<dyn Partitioner>, Error> {
    // Accept both the short name and the fully-qualified legacy form.
    let short = name.rsplit('.').next().unwrap_or(name);
    match short {
        Murmur3Partitioner::NAME => Ok(Arc::new(Murmur3Partitioner::new(shard_count, ignore_msb)?)),
        _ => Err(Error::UnknownPartitioner(name.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn m3(shards: u32) -> Murmur3Partitioner {
        Murmur3Partitioner::new(shards, 0).unwrap()
    }

    #[test]
    fn midpoint_of_reversed_operands() {
        let p = m3(1);
        let a = Token::from_u64(0x9000_0000_0000_0000);
        let b = Token::from_u64(0x2000_0000_0000_0000);
        assert_eq!(p.midpoint(&a, &b), Token::from_u64(0x5800_0000_0000_0000));
        assert_eq!(p.tri_compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn midpoint_is_identity_on_equal_tokens() {
        let p = m3(1);
        for v in [0u64, 1, 0x7fff_ffff_ffff_ffff, u64::MAX] {
            let t = Token::from_u64(v);
            assert_eq!(p.midpoint(&t, &t), t);
        }
    }

    #[test]
    fn token_of_is_deterministic() {
        let p = m3(1);
        assert_eq!(p.token_of(b"some key"), p.token_of(b"some key"));
        assert_ne!(p.token_of(b"some key"), p.token_of(b"other key"));
    }

    #[test]
    fn shard_of_divides_the_ring_evenly() {
        let p = m3(4);
        assert_eq!(p.shard_of(&Token::from_u64(0)), 0);
        assert_eq!(p.shard_of(&Token::from_u64(0x3fff_ffff_ffff_ffff)), 0);
        assert_eq!(p.shard_of(&Token::from_u64(0x4000_0000_0000_0000)), 1);
        assert_eq!(p.shard_of(&Token::from_u64(0x8000_0000_0000_0000)), 2);
        assert_eq!(p.shard_of(&Token::from_u64(0xc000_0000_0000_0000)), 3);
        assert_eq!(p.shard_of(&Token::from_u64(u64::MAX)), 3);
        assert_eq!(p.shard_of(&minimum_token()), 0);
        assert_eq!(p.shard_of(&maximum_token()), 3);
    }

    #[test]
    fn next_shard_tokens_strictly_increase() {
        for (shards, msb) in [(1u32, 0u32), (4, 0), (3, 2), (8, 4)] {
            let p = Murmur3Partitioner::new(shards, msb).unwrap();
            let mut t = minimum_token();
            let mut prev_u = 0u64;
            let mut steps = 0usize;
            loop {
                let next = p.token_for_next_shard(&t);
                if next.is_maximum() {
                    break;
                }
                assert!(next.to_u64() > prev_u || steps == 0, "shards={shards} msb={msb}");
                prev_u = next.to_u64();
                t = next;
                steps += 1;
                assert!(steps <= (shards as usize) << msb, "runaway boundary walk");
            }
            assert_eq!(steps + 1, (shards as usize) << msb);
        }
    }

    #[test]
    fn next_shard_boundary_lands_on_next_shard() {
        let p = Murmur3Partitioner::new(5, 0).unwrap();
        let t = Token::from_u64(0x1111_1111_1111_1111);
        let s = p.shard_of(&t);
        let boundary = p.token_for_next_shard(&t);
        assert_eq!(p.shard_of(&boundary), s + 1);
        // Every token strictly below the boundary shares t's shard.
        assert_eq!(p.shard_of(&Token::from_u64(boundary.to_u64() - 1)), s);
    }

    #[test]
    fn ownership_fractions_of_an_even_ring() {
        let p = m3(1);
        let tokens: Vec<Token> = [
            0u64,
            0x4000_0000_0000_0000,
            0x8000_0000_0000_0000,
            0xc000_0000_0000_0000,
        ]
        .iter()
        .map(|v| Token::from_u64(*v))
        .collect();

        let rendered = p
            .describe_ownership(&tokens)
            .iter()
            .map(|(token, fraction)| format!("{token} => {fraction:.4}"))
            .collect::<Vec<_>>()
            .join("\n");
        insta::assert_snapshot!(rendered, @r###"
        0000000000000000 => 0.2500
        4000000000000000 => 0.2500
        8000000000000000 => 0.2500
        c000000000000000 => 0.2500
        "###);
    }

    #[test]
    fn shard_boundary_walk_over_four_shards() {
        let p = m3(4);
        let mut rendered = Vec::new();
        let mut t = minimum_token();
        loop {
            t = p.token_for_next_shard(&t);
            rendered.push(t.to_string());
            if t.is_maximum() {
                break;
            }
        }
        insta::assert_snapshot!(rendered.join("\n"), @r###"
        4000000000000000
        8000000000000000
        c000000000000000
        maximum token
        "###);
    }

    #[test]
    fn ownership_sums_to_one() {
        let p = m3(1);
        let mut tokens: Vec<_> = [0x1000u64, 0x20_0000, 0x8000_0000_0000_0000, u64::MAX - 17]
            .iter()
            .map(|v| Token::from_u64(*v))
            .collect();
        tokens.sort();
        let total: f64 = p.describe_ownership(&tokens).iter().map(|(_, f)| f).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn single_token_owns_everything() {
        let p = m3(1);
        let owns = p.describe_ownership(&[Token::from_u64(42)]);
        assert_eq!(owns, vec![(Token::from_u64(42), 1.0)]);
    }

    #[test]
    fn registry_resolves_names() {
        assert!(partitioner_from_name("Murmur3Partitioner", 2, 0).is_ok());
        assert!(partitioner_from_name("org.apache.cassandra.dht.Murmur3Partitioner", 2, 0).is_ok());
        assert!(partitioner_from_name("NoSuchPartitioner", 2, 0).is_err());
    }
}
