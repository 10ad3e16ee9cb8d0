//! Eventually-consistent membership: per-endpoint versioned state spread
//! through a 1 s SYN/ACK/ACK2 exchange, a φ-accrual failure detector
//! driving liveness verdicts, and feature negotiation across the cluster.

mod failure_detector;
mod gossiper;

pub use failure_detector::{FailureDetector, FailureListener};
pub use gossiper::{
    GossipConfig, GossipSubscriber, Gossiper, RingView, A_VERY_LONG_TIME, INTERVAL,
    MAX_GENERATION_DIFFERENCE,
};
