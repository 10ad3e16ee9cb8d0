//! Consistent-hash ring model: tokens, ring positions, ranges over them,
//! partitioners which map partition keys onto the ring, and shard-affine
//! range splitting.

mod murmur3;
mod partitioner;
mod position;
mod range;
mod sharder;
mod token;

pub use partitioner::{partitioner_from_name, Murmur3Partitioner, Partitioner};
pub use position::{RingPosition, TokenBound};
pub use range::{full_token_range, ring_ranges, to_partition_range, Range, RangeBound};
pub use sharder::{RangeAndShard, RangeSharder};
pub use token::{maximum_token, midpoint_unsigned_tokens, minimum_token, Token, TokenKind};

/// Non-wrapping range of ring positions, bounded inclusively or exclusively
/// on either side. An absent bound extends to the ring edge.
pub type PartitionRange = Range<RingPosition>;
/// Non-wrapping range of bare tokens.
pub type TokenRange = Range<Token>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported partitioner: '{0}'")]
    UnknownPartitioner(String),
    #[error("token bytes must be non-empty for a key token")]
    EmptyToken,
    #[error("shard count must be non-zero")]
    ZeroShards,
}
