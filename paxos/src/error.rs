//! Error taxonomy.
//!
//! [`ConsensusError`] is the closed set of refusals a replica can answer
//! with; it crosses the wire, so it is a plain serde enum with a stable
//! variant order. [`PeerError`] wraps one peer call's outcome: transport
//! unavailability is tolerated and counted by the coordinator, everything
//! else propagates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Proposal, Quorum};

/// Consensus-level refusals. Variant order is the wire discriminant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConsensusError<V, C, S: Ord> {
    /// The caller's quorum does not match the replica's membership; the
    /// caller must refresh its peer list.
    WrongQuorum {
        expected: Quorum<S>,
        effective: Quorum<S>,
    },
    /// The replica holds a slot it cannot advance past because nothing was
    /// ever accepted under it.
    PartialState { proposal: Proposal<V, C> },
    /// Fewer than the required majority of peers were reachable.
    TooFewPeers { effective: usize, total: usize },
    /// A request broke the propose/accept/confirm discipline.
    ProtocolViolation { reason: String },
}

impl<V: fmt::Debug, C: fmt::Debug, S: fmt::Debug + Ord> fmt::Display for ConsensusError<V, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::WrongQuorum {
                expected,
                effective,
            } => {
                write!(f, "wrong quorum: {effective:?} instead of {expected:?}")
            }
            ConsensusError::PartialState { proposal } => {
                write!(f, "partial state: {proposal:?}")
            }
            ConsensusError::TooFewPeers { effective, total } => {
                write!(
                    f,
                    "too few peers are available to reach consensus: {effective} of {total}"
                )
            }
            ConsensusError::ProtocolViolation { reason } => f.write_str(reason),
        }
    }
}

impl<V: fmt::Debug, C: fmt::Debug, S: fmt::Debug + Ord> std::error::Error
    for ConsensusError<V, C, S>
{
}

/// Outcome of one RPC against one peer.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerError<V, C, S: Ord> {
    /// The peer could not be reached for this call. Per-call: the next call
    /// to the same peer may well succeed.
    Unavailable(String),
    /// The peer processed the call and refused it.
    Consensus(ConsensusError<V, C, S>),
}

impl<V: fmt::Debug, C: fmt::Debug, S: fmt::Debug + Ord> fmt::Display for PeerError<V, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Unavailable(reason) => write!(f, "peer unavailable: {reason}"),
            PeerError::Consensus(e) => e.fmt(f),
        }
    }
}

impl<V: fmt::Debug, C: fmt::Debug, S: fmt::Debug + Ord> std::error::Error for PeerError<V, C, S> {}

impl<V, C, S: Ord> From<ConsensusError<V, C, S>> for PeerError<V, C, S> {
    fn from(e: ConsensusError<V, C, S>) -> Self {
        PeerError::Consensus(e)
    }
}

/// Failure to encode or decode a replica snapshot.
#[derive(Debug)]
pub enum SnapshotError {
    /// The requested wire format cannot represent the state.
    Unrepresentable(&'static str),
    /// The byte codec failed.
    Codec(postcard::Error),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Unrepresentable(reason) => f.write_str(reason),
            SnapshotError::Codec(e) => write!(f, "snapshot codec error: {e}"),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::Codec(e) => Some(e),
            SnapshotError::Unrepresentable(_) => None,
        }
    }
}

impl From<postcard::Error> for SnapshotError {
    fn from(e: postcard::Error) -> Self {
        SnapshotError::Codec(e)
    }
}
