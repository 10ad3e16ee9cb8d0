use std::time::Duration;

/// Per-request consistency level, matching the native-protocol names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
}

impl ConsistencyLevel {
    /// Levels which count only acknowledgements from the coordinator's own
    /// datacenter.
    pub fn is_datacenter_local(self) -> bool {
        matches!(self, Self::LocalOne | Self::LocalQuorum)
    }

    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        match s.to_ascii_uppercase().as_str() {
            "ANY" => Ok(Self::Any),
            "ONE" => Ok(Self::One),
            "TWO" => Ok(Self::Two),
            "THREE" => Ok(Self::Three),
            "QUORUM" => Ok(Self::Quorum),
            "ALL" => Ok(Self::All),
            "LOCAL_QUORUM" => Ok(Self::LocalQuorum),
            "EACH_QUORUM" => Ok(Self::EachQuorum),
            "LOCAL_ONE" => Ok(Self::LocalOne),
            _ => Err(crate::Error::InvalidConsistency(s.to_string())),
        }
    }
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Any => "ANY",
            Self::One => "ONE",
            Self::Two => "TWO",
            Self::Three => "THREE",
            Self::Quorum => "QUORUM",
            Self::All => "ALL",
            Self::LocalQuorum => "LOCAL_QUORUM",
            Self::EachQuorum => "EACH_QUORUM",
            Self::LocalOne => "LOCAL_ONE",
        };
        f.write_str(s)
    }
}

/// What kind of write a timeout was observed on; surfaced to clients.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    View,
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Simple => "SIMPLE",
            Self::Batch => "BATCH",
            Self::UnloggedBatch => "UNLOGGED_BATCH",
            Self::Counter => "COUNTER",
            Self::BatchLog => "BATCHLOG",
            Self::View => "VIEW",
        };
        f.write_str(s)
    }
}

/// How widely a read repairs divergent replicas, sampled per request from
/// the table's configured chances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRepairDecision {
    None,
    /// Query and repair every replica.
    Global,
    /// Query and repair replicas of the coordinator's datacenter only.
    DcLocal,
}

/// The table's speculative-retry policy for reads.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SpeculativeRetry {
    None,
    Always,
    /// Speculate when the primary has not answered within this latency
    /// percentile of recent reads.
    Percentile(f64),
    /// Speculate after a fixed delay.
    Custom(Duration),
}

impl Default for SpeculativeRetry {
    fn default() -> Self {
        SpeculativeRetry::Percentile(99.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_round_trip() {
        for cl in [
            ConsistencyLevel::Any,
            ConsistencyLevel::One,
            ConsistencyLevel::Quorum,
            ConsistencyLevel::EachQuorum,
            ConsistencyLevel::LocalOne,
        ] {
            assert_eq!(ConsistencyLevel::parse(&cl.to_string()).unwrap(), cl);
        }
        assert!(ConsistencyLevel::parse("SERIAL-ISH").is_err());
    }

    #[test]
    fn datacenter_locality() {
        assert!(ConsistencyLevel::LocalQuorum.is_datacenter_local());
        assert!(ConsistencyLevel::LocalOne.is_datacenter_local());
        assert!(!ConsistencyLevel::Quorum.is_datacenter_local());
        assert!(!ConsistencyLevel::EachQuorum.is_datacenter_local());
    }
}
