//! Core data model shared by replicas, coordinators and the wire.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Application payload carried through consensus.
pub trait Payload:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<T> Payload for T where
    T: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Opaque comparable identifier for a coordinator or a replica.
pub trait NodeId:
    Copy + Ord + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<T> NodeId for T where
    T: Copy + Ord + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Monotone identifier of a consensus slot.
///
/// The default value stands for "before any slot exists".
pub trait Version:
    Copy + Ord + Default + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The version immediately before this one, saturating at the smallest
    /// representable version.
    fn prev(self) -> Self;
}

macro_rules! integer_version {
    ($($ty:ty),* $(,)?) => {$(
        impl Version for $ty {
            fn prev(self) -> Self {
                self.saturating_sub(1)
            }
        }
    )*};
}

integer_version!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// The authorized replica membership for a slot family, ordered for
/// deterministic comparison.
pub type Quorum<S> = BTreeSet<S>;

/// Identifier of one proposal: ordered lexicographically by version, then
/// round, then sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Proposal<V, C> {
    pub version: V,
    pub round: u64,
    pub sender: C,
}

impl<V: fmt::Debug, C: fmt::Debug> fmt::Display for Proposal<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}:{:?}", self.version, self.round, self.sender)
    }
}

/// A consensus value: an application payload or a membership change.
///
/// Once a replica confirms a `Quorum` value for some version, every later
/// version on that replica is issued against the new membership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value<T, S: Ord> {
    Data(T),
    Quorum(Quorum<S>),
}

impl<T, S: Ord> Value<T, S> {
    /// The payload, unless this is a membership change.
    pub fn data(&self) -> Option<&T> {
        match self {
            Value::Data(data) => Some(data),
            Value::Quorum(_) => None,
        }
    }
}

impl<T, S: Ord> From<T> for Value<T, S> {
    fn from(data: T) -> Self {
        Value::Data(data)
    }
}

/// The highest value a replica has stored for its live slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Accepted<T, V, C, S: Ord> {
    pub proposal: Proposal<V, C>,
    pub value: Value<T, S>,
    pub confirmed: bool,
}

/// The live slot of a replica: the minimum acceptable proposal and whatever
/// has been accepted under it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionState<T, V, C, S: Ord> {
    pub proposal: Proposal<V, C>,
    pub accepted: Option<Accepted<T, V, C, S>>,
}

impl<T, V: Copy, C, S: Ord> VersionState<T, V, C, S> {
    pub fn version(&self) -> V {
        self.proposal.version
    }
}
