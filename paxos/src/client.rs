//! The coordinator: drives propose → accept → confirm against a peer set.

use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, instrument, trace};

use crate::error::{ConsensusError, PeerError};
use crate::peer::Peer;
use crate::types::{Accepted, NodeId, Payload, Proposal, Quorum, Value, Version};

/// The coordinator's peer list. Mutable so the host can grow or shrink
/// membership between rounds.
pub type Peers<T, V, C, S> = Vec<Box<dyn Peer<T, V, C, S>>>;

/// Base unit of the conflict backoff.
const BACKOFF_STEP: Duration = Duration::from_millis(100);
/// Cap on the exponential part of the backoff.
const BACKOFF_CAP: Duration = Duration::from_millis(6_400);

/// A Paxos coordinator.
///
/// One `choose` call runs its three phases sequentially; within each phase
/// all peers are called in parallel. Reusable across many `choose` and `get`
/// invocations.
pub struct Client<T, V, C, S: Ord> {
    id: C,
    peers: Peers<T, V, C, S>,
    round: u64,
    conflict_backoff: bool,
    rng: StdRng,
}

impl<T, V, C, S> Client<T, V, C, S>
where
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    /// Create a coordinator over `peers`.
    ///
    /// # Panics
    ///
    /// The peer list must not be empty.
    #[must_use]
    pub fn new(id: C, peers: Peers<T, V, C, S>) -> Self {
        assert!(!peers.is_empty(), "a coordinator needs at least one peer");
        Self {
            id,
            peers,
            round: 0,
            conflict_backoff: true,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Like [`Client::new`] but with a seeded backoff RNG, for deterministic
    /// tests.
    ///
    /// # Panics
    ///
    /// The peer list must not be empty.
    #[must_use]
    pub fn with_seed(id: C, peers: Peers<T, V, C, S>, seed: u64) -> Self {
        let mut client = Self::new(id, peers);
        client.rng = StdRng::seed_from_u64(seed);
        client
    }

    #[must_use]
    pub fn id(&self) -> C {
        self.id
    }

    #[must_use]
    pub fn peers(&self) -> &Peers<T, V, C, S> {
        &self.peers
    }

    /// Mutable access to the peer list, enabling membership changes.
    pub fn peers_mut(&mut self) -> &mut Peers<T, V, C, S> {
        &mut self.peers
    }

    /// Whether to sleep between attempts after a proposal conflict.
    pub fn set_conflict_backoff(&mut self, enabled: bool) {
        self.conflict_backoff = enabled;
    }

    fn quorum(&self) -> Quorum<S> {
        self.peers.iter().map(|peer| peer.id()).collect()
    }

    fn check_headcount(
        q: &Quorum<S>,
        reached: usize,
        reading: bool,
    ) -> Result<(), ConsensusError<V, C, S>> {
        debug!(reached, "counted reachable peers");
        let total = q.len();
        // A reader tolerates one more failure than a writer: a majority of
        // (total - 1) still intersects every confirmed write quorum, because
        // writes confirm on a strict majority of the same membership.
        let required = (total - usize::from(reading)) / 2;
        if reached <= required {
            trace!(reached, total, "too few peers to reach consensus");
            return Err(ConsensusError::TooFewPeers {
                effective: reached,
                total,
            });
        }
        Ok(())
    }

    fn conflict_delay(&mut self, attempt: u32) -> Duration {
        let exponential = BACKOFF_STEP
            .saturating_mul(1u32 << attempt.min(6))
            .min(BACKOFF_CAP);
        exponential.saturating_mul(self.rng.random_range(1..=8))
    }

    /// Choose `value` for the default (first) version.
    ///
    /// # Errors
    ///
    /// See [`Client::choose_at`].
    pub async fn choose(
        &mut self,
        value: impl Into<Value<T, S>>,
    ) -> Result<Option<Accepted<T, V, C, S>>, ConsensusError<V, C, S>> {
        self.choose_at(V::default(), value).await
    }

    /// Drive `value` to consensus for `version`.
    ///
    /// Returns `None` when `value` itself was chosen, or the previously
    /// accepted value when an earlier choice already holds — the caller then
    /// typically retries at a higher version.
    ///
    /// # Errors
    ///
    /// `TooFewPeers` when any phase reaches at most half of the quorum;
    /// every consensus refusal other than a single peer's unavailability.
    #[instrument(skip_all, fields(id = ?self.id, version = ?version))]
    pub async fn choose_at(
        &mut self,
        version: V,
        value: impl Into<Value<T, S>>,
    ) -> Result<Option<Accepted<T, V, C, S>>, ConsensusError<V, C, S>> {
        let value = value.into();
        debug!(?value, "choosing");
        let q = self.quorum();
        let mut version = version;
        let mut attempt = 0u32;
        let mut previous: Option<Accepted<T, V, C, S>> = None;
        loop {
            self.round += 1;
            let proposal = Proposal {
                version,
                round: self.round,
                sender: self.id,
            };
            debug!(%proposal, "sending proposal");
            {
                let mut reached = 0usize;
                let mut calls: FuturesUnordered<_> = self
                    .peers
                    .iter()
                    .map(|peer| peer.propose(q.clone(), proposal))
                    .collect();
                while let Some(result) = calls.next().await {
                    match result {
                        Ok(accepted) => {
                            if let Some(accepted) = accepted
                                && previous
                                    .as_ref()
                                    .is_none_or(|prev| prev.proposal < accepted.proposal)
                            {
                                debug!(at = %accepted.proposal, "value already accepted");
                                previous = Some(accepted);
                            }
                            reached += 1;
                        }
                        Err(PeerError::Unavailable(reason)) => {
                            trace!(%reason, "peer unavailable during propose");
                        }
                        Err(PeerError::Consensus(e)) => return Err(e),
                    }
                }
                drop(calls);
                if previous.as_ref().is_some_and(|prev| prev.confirmed) {
                    debug!("previous value already confirmed");
                    return Ok(previous);
                }
                Self::check_headcount(&q, reached, false)?;
                if let Some(prev) = &previous
                    && proposal < prev.proposal
                {
                    version = prev.proposal.version;
                    self.round = prev.proposal.round;
                    debug!(?version, round = self.round, "a concurrent coordinator is ahead, retrying");
                    continue;
                }
            }
            // accept whatever the propose phase obliges us to carry forward
            let offer = previous
                .as_ref()
                .map_or_else(|| value.clone(), |prev| prev.value.clone());
            debug!(?offer, "sending acceptation");
            let conflict = {
                let mut reached = 0usize;
                let mut conflict: Option<Proposal<V, C>> = None;
                let mut calls: FuturesUnordered<_> = self
                    .peers
                    .iter()
                    .map(|peer| peer.accept(q.clone(), proposal, offer.clone()))
                    .collect();
                while let Some(result) = calls.next().await {
                    match result {
                        Ok(minimum) => {
                            if proposal < minimum {
                                debug!(%minimum, "conflicting proposal");
                                conflict = Some(minimum);
                                // abandon the calls still in flight
                                break;
                            }
                            reached += 1;
                        }
                        Err(PeerError::Unavailable(reason)) => {
                            trace!(%reason, "peer unavailable during accept");
                        }
                        Err(PeerError::Consensus(e)) => return Err(e),
                    }
                }
                drop(calls);
                if conflict.is_none() {
                    Self::check_headcount(&q, reached, false)?;
                }
                conflict
            };
            if let Some(minimum) = conflict {
                version = minimum.version;
                self.round = self.round.max(minimum.round);
                if self.conflict_backoff {
                    let delay = self.conflict_delay(attempt);
                    debug!(?delay, "conflicted proposal, backing off");
                    tokio::time::sleep(delay).await;
                } else {
                    debug!("conflicted proposal, retrying");
                }
                attempt += 1;
                continue;
            }
            debug!(chosen = ?offer, "sending confirmation");
            {
                let mut reached = 0usize;
                let mut calls: FuturesUnordered<_> = self
                    .peers
                    .iter()
                    .map(|peer| peer.confirm(q.clone(), proposal))
                    .collect();
                while let Some(result) = calls.next().await {
                    match result {
                        Ok(()) => reached += 1,
                        Err(PeerError::Unavailable(reason)) => {
                            trace!(%reason, "peer unavailable during confirm");
                        }
                        Err(PeerError::Consensus(e)) => return Err(e),
                    }
                }
                drop(calls);
                Self::check_headcount(&q, reached, false)?;
            }
            return Ok(previous);
        }
    }

    /// Read the chosen value, if any.
    ///
    /// # Errors
    ///
    /// See [`Client::get_quorum`].
    pub async fn get(&mut self) -> Result<Option<T>, ConsensusError<V, C, S>> {
        Ok(self.get_quorum().await?.0)
    }

    /// Read the chosen value together with the membership it was read under.
    ///
    /// # Errors
    ///
    /// `TooFewPeers` under the relaxed read threshold; every consensus
    /// refusal other than a single peer's unavailability.
    #[instrument(skip_all, fields(id = ?self.id))]
    pub async fn get_quorum(&mut self) -> Result<(Option<T>, Quorum<S>), ConsensusError<V, C, S>> {
        debug!("reading value");
        let q = self.quorum();
        let mut reached = 0usize;
        let mut newest: Option<Accepted<T, V, C, S>> = None;
        let mut calls: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|peer| peer.get(q.clone()))
            .collect();
        while let Some(result) = calls.next().await {
            match result {
                Ok(accepted) => {
                    if let Some(accepted) = accepted
                        && newest
                            .as_ref()
                            .is_none_or(|best| best.proposal < accepted.proposal)
                    {
                        newest = Some(accepted);
                    }
                    reached += 1;
                }
                Err(PeerError::Unavailable(reason)) => {
                    trace!(%reason, "peer unavailable during get");
                }
                Err(PeerError::Consensus(e)) => return Err(e),
            }
        }
        drop(calls);
        Self::check_headcount(&q, reached, true)?;
        match newest {
            None => Ok((None, q)),
            Some(accepted) => match accepted.value {
                Value::Data(data) => Ok((Some(data), q)),
                Value::Quorum(_) => Err(ConsensusError::ProtocolViolation {
                    reason: "replica answered a read with a membership change".into(),
                }),
            },
        }
    }
}
