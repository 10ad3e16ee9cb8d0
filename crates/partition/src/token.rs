use bytes::Bytes;
use std::cmp::Ordering;

/// Kind of a ring token. The two sentinels order before and after every
/// key token; declaration order drives the derived ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum TokenKind {
    BeforeAllKeys,
    Key,
    AfterAllKeys,
}

/// A position on the ring. Key tokens carry opaque bytes interpreted as an
/// unsigned big-endian binary fraction in [0, 1); sentinels carry none.
///
/// Ordering is total: kind dominates, and key tokens compare
/// lexicographically over their bytes (equivalently, as fractions).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Token {
    kind: TokenKind,
    data: Bytes,
}

impl Token {
    pub fn key(data: impl Into<Bytes>) -> Self {
        Self {
            kind: TokenKind::Key,
            data: data.into(),
        }
    }

    /// Token of a 64-bit hash value, as 8 big-endian bytes.
    pub fn from_u64(value: u64) -> Self {
        Self::key(value.to_be_bytes().to_vec())
    }

    /// The leading 64 bits of this token's fraction, zero-extended.
    /// Sentinels map to the edges of the u64 space.
    pub fn to_u64(&self) -> u64 {
        match self.kind {
            TokenKind::BeforeAllKeys => 0,
            TokenKind::AfterAllKeys => u64::MAX,
            TokenKind::Key => {
                let mut buf = [0u8; 8];
                let n = self.data.len().min(8);
                buf[..n].copy_from_slice(&self.data[..n]);
                u64::from_be_bytes(buf)
            }
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_minimum(&self) -> bool {
        self.kind == TokenKind::BeforeAllKeys
    }

    pub fn is_maximum(&self) -> bool {
        self.kind == TokenKind::AfterAllKeys
    }

    /// Wire form: one tag byte followed by the key bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let tag = match self.kind {
            TokenKind::BeforeAllKeys => 0u8,
            TokenKind::Key => 1,
            TokenKind::AfterAllKeys => 2,
        };
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(tag);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let (tag, rest) = buf.split_first()?;
        let kind = match tag {
            0 => TokenKind::BeforeAllKeys,
            1 => TokenKind::Key,
            2 => TokenKind::AfterAllKeys,
            _ => return None,
        };
        Some(Self {
            kind,
            data: Bytes::copy_from_slice(rest),
        })
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.data.cmp(&other.data))
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TokenKind::BeforeAllKeys => write!(f, "minimum token"),
            TokenKind::AfterAllKeys => write!(f, "maximum token"),
            TokenKind::Key => {
                for b in self.data.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// The token ordered before every key.
pub fn minimum_token() -> Token {
    Token {
        kind: TokenKind::BeforeAllKeys,
        data: Bytes::new(),
    }
}

/// The token ordered after every key.
pub fn maximum_token() -> Token {
    Token {
        kind: TokenKind::AfterAllKeys,
        data: Bytes::new(),
    }
}

// Byte-wise sum of two fractions. Returns the sum (at the wider of the two
// widths) and the carry out of the leading byte.
fn add_bytes(b1: &[u8], b2: &[u8]) -> (Vec<u8>, bool) {
    let sz = b1.len().max(b2.len());
    let expand = |b: &[u8]| {
        let mut out = vec![0u8; sz];
        out[..b.len()].copy_from_slice(b);
        out
    };
    let mut sum = expand(b1);
    let rhs = expand(b2);

    let mut carry = 0u16;
    for idx in (0..sz).rev() {
        let t = carry + sum[idx] as u16 + rhs[idx] as u16;
        sum[idx] = t as u8;
        carry = t >> 8;
    }
    (sum, carry != 0)
}

// Halve a fraction, shifting the carry bit in at the top.
fn shift_right(carry: bool, mut b: Vec<u8>) -> Vec<u8> {
    let mut tmp = carry as u8;
    for byte in b.iter_mut() {
        let lsb = *byte & 1;
        *byte = (tmp << 7) | (*byte >> 1);
        tmp = lsb;
    }
    b
}

/// Midpoint of two tokens in the unsigned byte-fraction space.
///
/// The sentinels read as 0.0 and 1.0. When the operands are reversed
/// (`t1 > t2`) the pair wraps around the ring, and 0.5 is added modulo 1:
/// `midpoint(0.9, 0.2) == midpoint(0.9, 1.2) == 0.05`.
pub fn midpoint_unsigned_tokens(t1: &Token, t2: &Token) -> Token {
    let c1 = t1.kind == TokenKind::AfterAllKeys;
    let c2 = t2.kind == TokenKind::AfterAllKeys;
    if c1 && c2 {
        return t1.clone();
    }
    // A minimum token contributes 0.0 and needs no special case.
    let (sum, carried) = add_bytes(&t1.data, &t2.data);
    let carry = carried || c1 || c2;
    let mut avg = shift_right(carry, sum);
    if t1 > t2 {
        if let Some(first) = avg.first_mut() {
            *first ^= 0x80;
        }
    }
    Token::key(avg)
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn kind_ordering_dominates() {
        let min = minimum_token();
        let max = maximum_token();
        let key = Token::key(vec![0x00]);
        assert!(min < key);
        assert!(key < max);
        assert!(min < max);
    }

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = Token::key(vec![0x20, 0x00]);
        let b = Token::key(vec![0x90, 0x00]);
        assert!(a < b);
        assert!(Token::key(vec![0x20]) < Token::key(vec![0x20, 0x00]));
    }

    #[test]
    fn u64_round_trip() {
        for v in [0u64, 1, 0x8000_0000_0000_0000, u64::MAX] {
            assert_eq!(Token::from_u64(v).to_u64(), v);
        }
    }

    #[test]
    fn midpoint_of_equal_tokens_is_identity() {
        let t = Token::key(vec![0x42, 0x17]);
        assert_eq!(midpoint_unsigned_tokens(&t, &t), t);
    }

    #[test]
    fn midpoint_basic() {
        // midpoint(0.25, 0.75) == 0.5
        let a = Token::key(vec![0x40]);
        let b = Token::key(vec![0xc0]);
        assert_eq!(midpoint_unsigned_tokens(&a, &b), Token::key(vec![0x80]));
    }

    #[test]
    fn midpoint_wraps_when_reversed() {
        // midpoint(0.75, 0.25) wraps: (0.75 + 1.25) / 2 mod 1 == 0.
        let a = Token::key(vec![0xc0]);
        let b = Token::key(vec![0x40]);
        assert_eq!(midpoint_unsigned_tokens(&a, &b), Token::key(vec![0x00]));
    }

    #[test]
    fn midpoint_with_maximum_token() {
        // midpoint(0.5, 1.0) == 0.75
        let a = Token::key(vec![0x80]);
        assert_eq!(
            midpoint_unsigned_tokens(&a, &maximum_token()),
            Token::key(vec![0xc0])
        );
    }

    #[quickcheck]
    fn wire_round_trip(data: Vec<u8>) -> bool {
        let t = Token::key(data);
        Token::from_bytes(&t.to_bytes()) == Some(t)
    }

    #[quickcheck]
    fn sentinel_round_trip() -> bool {
        Token::from_bytes(&minimum_token().to_bytes()) == Some(minimum_token())
            && Token::from_bytes(&maximum_token().to_bytes()) == Some(maximum_token())
    }

    #[quickcheck]
    fn midpoint_identity(data: Vec<u8>) -> bool {
        let t = Token::key(data);
        midpoint_unsigned_tokens(&t, &t) == t
    }
}
