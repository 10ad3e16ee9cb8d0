use crate::Token;
use bytes::Bytes;
use std::cmp::Ordering;

/// Which side of a token a bare-token position sits on: `Start` sorts
/// before every key sharing the token, `End` after.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum TokenBound {
    Start,
    End,
}

/// A position on the ring: a token with a bound side, optionally refined by
/// a partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RingPosition {
    token: Token,
    bound: TokenBound,
    key: Option<Bytes>,
}

impl RingPosition {
    pub fn starting_at(token: Token) -> Self {
        Self {
            token,
            bound: TokenBound::Start,
            key: None,
        }
    }

    pub fn ending_at(token: Token) -> Self {
        Self {
            token,
            bound: TokenBound::End,
            key: None,
        }
    }

    /// Position of a decorated key: the key paired with its token.
    pub fn for_key(token: Token, key: impl Into<Bytes>) -> Self {
        Self {
            token,
            bound: TokenBound::Start,
            key: Some(key.into()),
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    // -1 when this bare-token position precedes keys with the same token,
    // +1 when it follows them, 0 when the position is itself a key.
    fn relation_to_keys(&self) -> i8 {
        if self.key.is_some() {
            0
        } else {
            match self.bound {
                TokenBound::Start => -1,
                TokenBound::End => 1,
            }
        }
    }
}

impl Ord for RingPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_token = self.token.cmp(&other.token);
        if by_token != Ordering::Equal {
            return by_token;
        }
        match (&self.key, &other.key) {
            (Some(a), Some(b)) => a.cmp(b),
            (None, None) => self.relation_to_keys().cmp(&other.relation_to_keys()),
            (None, Some(_)) => self.relation_to_keys().cmp(&0),
            (Some(_), None) => 0i8.cmp(&other.relation_to_keys()),
        }
    }
}

impl PartialOrd for RingPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for RingPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}", self.token)?;
        match &self.key {
            Some(key) => {
                write!(f, ", key ")?;
                for b in key.iter().take(16) {
                    write!(f, "{b:02x}")?;
                }
            }
            None => write!(
                f,
                ", {}",
                if self.relation_to_keys() < 0 {
                    "start"
                } else {
                    "end"
                }
            )?,
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Token;

    #[test]
    fn start_sorts_before_keys_end_after() {
        let t = Token::from_u64(100);
        let start = RingPosition::starting_at(t.clone());
        let end = RingPosition::ending_at(t.clone());
        let key = RingPosition::for_key(t.clone(), vec![0xaa]);

        assert!(start < key);
        assert!(key < end);
        assert!(start < end);
    }

    #[test]
    fn token_dominates() {
        let lo = RingPosition::ending_at(Token::from_u64(1));
        let hi = RingPosition::starting_at(Token::from_u64(2));
        assert!(lo < hi);
    }

    #[test]
    fn keys_compare_within_a_token() {
        let t = Token::from_u64(7);
        let a = RingPosition::for_key(t.clone(), vec![0x01]);
        let b = RingPosition::for_key(t.clone(), vec![0x02]);
        assert!(a < b);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }
}
