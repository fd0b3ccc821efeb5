//! The replica: one Paxos acceptor for a single slot family.
//!
//! A replica keeps exactly one live slot. When a proposal for a newer
//! version arrives and the live slot is confirmed, the slot's outcome is
//! collapsed into replica-level fields (`value` for data, the membership for
//! quorum changes) before the new slot opens. All transitions are O(1) and
//! synchronous; callers wrap the replica in whatever synchronization the
//! host needs.

use chanmux::WireVersion;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{ConsensusError, SnapshotError};
use crate::types::{Accepted, NodeId, Payload, Proposal, Quorum, Value, Version, VersionState};

/// A Paxos replica answering `propose`, `accept`, `confirm` and `get`.
#[derive(Clone, Debug)]
pub struct Server<T, V, C, S: Ord> {
    id: S,
    /// Membership the current slot family is issued against.
    quorum_initial: Quorum<S>,
    /// Last confirmed data value from an already-advanced version.
    value: Option<T>,
    state: Option<VersionState<T, V, C, S>>,
    version: WireVersion,
    /// A quorum change that was abandoned before confirmation. If a caller
    /// later presents exactly this membership, the change was evidently
    /// chosen elsewhere and is promoted.
    pending_quorum: Option<(V, Quorum<S>)>,
}

impl<T, V, C, S> Server<T, V, C, S>
where
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    /// Create a replica for the given slot family.
    ///
    /// # Errors
    ///
    /// The initial quorum must contain the replica itself.
    pub fn new(id: S, quorum: Quorum<S>, version: WireVersion) -> Result<Self, ConsensusError<V, C, S>> {
        if !quorum.contains(&id) {
            return Err(ConsensusError::ProtocolViolation {
                reason: format!("initial quorum {quorum:?} does not contain {id:?}"),
            });
        }
        Ok(Self {
            id,
            quorum_initial: quorum,
            value: None,
            state: None,
            version,
            pending_quorum: None,
        })
    }

    #[must_use]
    pub fn id(&self) -> S {
        self.id
    }

    #[must_use]
    pub fn wire_version(&self) -> WireVersion {
        self.version
    }

    fn check_quorum(&mut self, q: &Quorum<S>) -> Result<(), ConsensusError<V, C, S>> {
        if *q == self.quorum_initial {
            return Ok(());
        }
        if let Some((version, pending)) = &self.pending_quorum
            && q == pending
        {
            debug!(version = ?version, quorum = ?pending, "caller proves abandoned quorum change was chosen, promoting");
            self.quorum_initial = pending.clone();
            self.pending_quorum = None;
            return Ok(());
        }
        trace!(expected = ?self.quorum_initial, effective = ?q, "quorum mismatch");
        Err(ConsensusError::WrongQuorum {
            expected: self.quorum_initial.clone(),
            effective: q.clone(),
        })
    }

    /// Whether the slot preceding `p.version` is known settled, so a new
    /// slot may open.
    fn check_confirmed(&self, p: &Proposal<V, C>) -> bool {
        if self.version < WireVersion::CONFIRMED_ACCEPTS {
            return true;
        }
        let Some(state) = &self.state else {
            return true;
        };
        let version = state.version();
        if version >= p.version {
            return true;
        }
        version == p.version.prev() && state.accepted.as_ref().is_some_and(|a| a.confirmed)
    }

    /// Phase 1: register `p` as a candidate minimum proposal.
    ///
    /// Returns the slot's accepted value, if any, so the caller learns what
    /// it must adopt; `None` means `p` was adopted as the slot's first
    /// proposal. A caller that is behind a newer confirmed version gets that
    /// version's accept back instead.
    ///
    /// # Errors
    ///
    /// `WrongQuorum` on membership mismatch, `PartialState` if the slot to
    /// advance past never accepted a value.
    pub fn propose(
        &mut self,
        q: Quorum<S>,
        p: Proposal<V, C>,
    ) -> Result<Option<Accepted<T, V, C, S>>, ConsensusError<V, C, S>> {
        trace!(proposal = %p, "proposal received");
        if let Some(state) = &self.state
            && let Some(accepted) = &state.accepted
            && accepted.proposal.version > p.version
        {
            debug!(
                held = ?accepted.proposal.version,
                proposed = ?p.version,
                "refusing proposal for an older version"
            );
            return Ok(Some(accepted.clone()));
        }
        if self.check_confirmed(&p) {
            if let Some(slot) = self.state.take_if(|s| p.version > s.version()) {
                let VersionState { proposal, accepted } = slot;
                match accepted {
                    Some(accepted) => {
                        debug!(version = ?accepted.proposal.version, "collapsing settled slot");
                        match accepted.value {
                            Value::Data(data) => self.value = Some(data),
                            Value::Quorum(quorum) => self.quorum_initial = quorum,
                        }
                        self.pending_quorum = None;
                    }
                    None => {
                        self.state = Some(VersionState {
                            proposal,
                            accepted: None,
                        });
                        return Err(ConsensusError::PartialState { proposal });
                    }
                }
            }
            self.check_quorum(&q)?;
        } else {
            // The previous slot was abandoned before settling. Remember a
            // dropped quorum change so a caller that holds it can prove it
            // was chosen.
            if let Some(slot) = self.state.take()
                && let Some(accepted) = slot.accepted
                && let Value::Quorum(quorum) = accepted.value
            {
                warn!(
                    version = ?accepted.proposal.version,
                    ?quorum,
                    "abandoning unconfirmed quorum change"
                );
                self.pending_quorum = Some((accepted.proposal.version, quorum));
            }
        }
        if let Some(slot) = &mut self.state {
            if slot.proposal < p {
                debug!(proposal = %p, "updating minimum proposal");
                slot.proposal = p;
            }
            Ok(slot.accepted.clone())
        } else {
            debug!(version = ?p.version, "adopting first proposal for version");
            self.state = Some(VersionState {
                proposal: p,
                accepted: None,
            });
            Ok(None)
        }
    }

    /// Phase 2: store `value` under `p`.
    ///
    /// Returns the slot's minimum proposal; a result greater than `p` tells
    /// the caller its accept lost to a concurrent coordinator.
    ///
    /// # Errors
    ///
    /// `WrongQuorum` on membership mismatch; `ProtocolViolation` when `p`
    /// was never proposed here, or when it would overwrite a confirmed
    /// value with a different one.
    pub fn accept(
        &mut self,
        q: Quorum<S>,
        p: Proposal<V, C>,
        value: Value<T, S>,
    ) -> Result<Proposal<V, C>, ConsensusError<V, C, S>> {
        trace!(proposal = %p, ?value, "accept requested");
        self.check_quorum(&q)?;
        let Some(slot) = self.state.as_mut() else {
            warn!(proposal = %p, "accept with no proposal on record");
            return Err(ConsensusError::ProtocolViolation {
                reason: "propose before accepting".into(),
            });
        };
        if slot.proposal < p {
            warn!(proposal = %p, minimum = %slot.proposal, "accept for a proposal never seen");
            return Err(ConsensusError::ProtocolViolation {
                reason: "propose before accepting".into(),
            });
        }
        if p < slot.proposal {
            trace!(minimum = %slot.proposal, "discarding obsolete accept");
            return Ok(slot.proposal);
        }
        if let Some(accepted) = &mut slot.accepted {
            if accepted.confirmed && accepted.value != value {
                warn!(proposal = %p, "accept would overwrite a confirmed value");
                return Err(ConsensusError::ProtocolViolation {
                    reason: "conflicting accept for a confirmed value".into(),
                });
            }
            accepted.proposal = p;
            accepted.value = value;
        } else {
            slot.accepted = Some(Accepted {
                proposal: p,
                value,
                confirmed: false,
            });
        }
        Ok(slot.proposal)
    }

    /// Phase 3: mark the accepted value as chosen. Idempotent; a stale
    /// confirm is ignored.
    ///
    /// # Errors
    ///
    /// `WrongQuorum` on membership mismatch; `ProtocolViolation` when there
    /// is nothing proposed and accepted to confirm.
    pub fn confirm(&mut self, q: Quorum<S>, p: Proposal<V, C>) -> Result<(), ConsensusError<V, C, S>> {
        trace!(proposal = %p, "confirm requested");
        self.check_quorum(&q)?;
        let violation = || ConsensusError::ProtocolViolation {
            reason: "propose and accept before confirming".into(),
        };
        let Some(slot) = self.state.as_mut() else {
            warn!(proposal = %p, "confirm with no slot");
            return Err(violation());
        };
        if slot.proposal < p || slot.accepted.is_none() {
            warn!(proposal = %p, "confirm without a matching accept");
            return Err(violation());
        }
        if p < slot.proposal {
            trace!(minimum = %slot.proposal, "discarding obsolete confirm");
            return Ok(());
        }
        if let Some(accepted) = &mut slot.accepted {
            accepted.confirmed = true;
        }
        Ok(())
    }

    /// Read the replica's current value.
    ///
    /// # Errors
    ///
    /// `WrongQuorum` on membership mismatch.
    pub fn get(&mut self, q: Quorum<S>) -> Result<Option<Accepted<T, V, C, S>>, ConsensusError<V, C, S>> {
        trace!("get requested");
        self.check_quorum(&q)?;
        Ok(self.current_value())
    }

    /// The membership in force: a confirmed but not yet advanced quorum
    /// change takes precedence over the stored membership.
    #[must_use]
    pub fn current_quorum(&self) -> Quorum<S> {
        if let Some(state) = &self.state
            && let Some(accepted) = &state.accepted
            && accepted.confirmed
            && let Value::Quorum(q) = &accepted.value
        {
            return q.clone();
        }
        self.quorum_initial.clone()
    }

    /// The newest confirmed data value, wrapped as an `Accepted` under the
    /// live slot's proposal.
    #[must_use]
    pub fn current_value(&self) -> Option<Accepted<T, V, C, S>> {
        let state = self.state.as_ref()?;
        if let Some(accepted) = &state.accepted
            && accepted.confirmed
            && matches!(accepted.value, Value::Data(_))
        {
            return Some(accepted.clone());
        }
        self.value.as_ref().map(|value| Accepted {
            proposal: state.proposal,
            value: Value::Data(value.clone()),
            confirmed: true,
        })
    }

    /// The newest version known settled on this replica. Non-decreasing.
    #[must_use]
    pub fn current_version(&self) -> V {
        match &self.state {
            Some(state) => {
                if state.accepted.as_ref().is_some_and(|a| a.confirmed) {
                    state.version()
                } else {
                    state.version().prev()
                }
            }
            None => V::default(),
        }
    }
}

/// Snapshot layout for formats that carry the confirmed flag and the replica
/// value. The slot list is ordered; at most one entry is ever written, and
/// the highest-versioned entry wins on read.
#[derive(Serialize, Deserialize)]
struct Snapshot<T, V, C, S: Ord> {
    id: S,
    quorum: Quorum<S>,
    value: Option<T>,
    state: Vec<VersionState<T, V, C, S>>,
}

#[derive(Serialize, Deserialize)]
struct LegacyAccepted<T, V, C> {
    proposal: Proposal<V, C>,
    value: T,
}

#[derive(Serialize, Deserialize)]
struct LegacyVersionState<T, V, C> {
    proposal: Proposal<V, C>,
    accepted: Option<LegacyAccepted<T, V, C>>,
}

/// Pre-0.1.0 layout: no replica value, data-only accepts, implicitly
/// confirmed.
#[derive(Serialize, Deserialize)]
struct LegacySnapshot<T, V, C, S: Ord> {
    id: S,
    quorum: Quorum<S>,
    state: Vec<LegacyVersionState<T, V, C>>,
}

impl<T, V, C, S> Server<T, V, C, S>
where
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    /// Encode a snapshot of this replica in the given wire format.
    ///
    /// # Errors
    ///
    /// Formats before 0.1.0 cannot represent membership-change values.
    pub fn serialize(&self, wire: WireVersion) -> Result<Vec<u8>, SnapshotError> {
        if wire >= WireVersion::CONFIRMED_ACCEPTS {
            let snapshot = Snapshot {
                id: self.id,
                quorum: self.quorum_initial.clone(),
                value: self.value.clone(),
                state: self.state.clone().into_iter().collect(),
            };
            Ok(postcard::to_allocvec(&snapshot)?)
        } else {
            let state = self
                .state
                .clone()
                .map(|slot| {
                    let accepted = slot
                        .accepted
                        .map(|a| match a.value {
                            Value::Data(value) => Ok(LegacyAccepted {
                                proposal: a.proposal,
                                value,
                            }),
                            Value::Quorum(_) => Err(SnapshotError::Unrepresentable(
                                "cannot encode a quorum change before 0.1.0",
                            )),
                        })
                        .transpose()?;
                    Ok::<_, SnapshotError>(LegacyVersionState {
                        proposal: slot.proposal,
                        accepted,
                    })
                })
                .transpose()?;
            let snapshot = LegacySnapshot {
                id: self.id,
                quorum: self.quorum_initial.clone(),
                state: state.into_iter().collect(),
            };
            Ok(postcard::to_allocvec(&snapshot)?)
        }
    }

    /// Rebuild a replica from a snapshot in the given wire format.
    ///
    /// # Errors
    ///
    /// Codec failures on malformed input.
    pub fn deserialize(bytes: &[u8], wire: WireVersion) -> Result<Self, SnapshotError> {
        if wire >= WireVersion::CONFIRMED_ACCEPTS {
            let snapshot: Snapshot<T, V, C, S> = postcard::from_bytes(bytes)?;
            let state = snapshot.state.into_iter().max_by_key(VersionState::version);
            Ok(Self {
                id: snapshot.id,
                quorum_initial: snapshot.quorum,
                value: snapshot.value,
                state,
                version: wire,
                pending_quorum: None,
            })
        } else {
            let snapshot: LegacySnapshot<T, V, C, S> = postcard::from_bytes(bytes)?;
            let state = snapshot
                .state
                .into_iter()
                .map(|slot| VersionState {
                    proposal: slot.proposal,
                    accepted: slot.accepted.map(|a| Accepted {
                        proposal: a.proposal,
                        value: Value::Data(a.value),
                        confirmed: true,
                    }),
                })
                .max_by_key(VersionState::version);
            Ok(Self {
                id: snapshot.id,
                quorum_initial: snapshot.quorum,
                value: None,
                state,
                version: wire,
                pending_quorum: None,
            })
        }
    }
}
