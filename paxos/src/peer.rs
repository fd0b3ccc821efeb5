//! Peer handles: one replica as seen by a coordinator.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::PeerError;
use crate::server::Server;
use crate::types::{Accepted, NodeId, Payload, Proposal, Quorum, Value, Version};

/// The four consensus RPCs against one replica.
///
/// Implemented by [`LocalPeer`] for replicas in the same process and by
/// [`crate::RemotePeer`] for replicas behind a channel. Every method may be
/// invoked concurrently with the others.
#[async_trait]
pub trait Peer<T, V, C, S: Ord>: Send + Sync {
    fn id(&self) -> S;

    async fn propose(
        &self,
        q: Quorum<S>,
        p: Proposal<V, C>,
    ) -> Result<Option<Accepted<T, V, C, S>>, PeerError<V, C, S>>;

    async fn accept(
        &self,
        q: Quorum<S>,
        p: Proposal<V, C>,
        value: Value<T, S>,
    ) -> Result<Proposal<V, C>, PeerError<V, C, S>>;

    async fn confirm(&self, q: Quorum<S>, p: Proposal<V, C>) -> Result<(), PeerError<V, C, S>>;

    async fn get(&self, q: Quorum<S>) -> Result<Option<Accepted<T, V, C, S>>, PeerError<V, C, S>>;
}

/// Direct delegation to a replica in the same process.
///
/// The replica mutex is only ever held for the O(1) state transition, never
/// across a suspension point.
pub struct LocalPeer<T, V, C, S: Ord> {
    server: Arc<Mutex<Server<T, V, C, S>>>,
}

impl<T, V, C, S: Ord> LocalPeer<T, V, C, S> {
    pub fn new(server: Arc<Mutex<Server<T, V, C, S>>>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<T, V, C, S> Peer<T, V, C, S> for LocalPeer<T, V, C, S>
where
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    fn id(&self) -> S {
        self.server.lock().unwrap().id()
    }

    async fn propose(
        &self,
        q: Quorum<S>,
        p: Proposal<V, C>,
    ) -> Result<Option<Accepted<T, V, C, S>>, PeerError<V, C, S>> {
        self.server.lock().unwrap().propose(q, p).map_err(Into::into)
    }

    async fn accept(
        &self,
        q: Quorum<S>,
        p: Proposal<V, C>,
        value: Value<T, S>,
    ) -> Result<Proposal<V, C>, PeerError<V, C, S>> {
        self.server
            .lock()
            .unwrap()
            .accept(q, p, value)
            .map_err(Into::into)
    }

    async fn confirm(&self, q: Quorum<S>, p: Proposal<V, C>) -> Result<(), PeerError<V, C, S>> {
        self.server.lock().unwrap().confirm(q, p).map_err(Into::into)
    }

    async fn get(&self, q: Quorum<S>) -> Result<Option<Accepted<T, V, C, S>>, PeerError<V, C, S>> {
        self.server.lock().unwrap().get(q).map_err(Into::into)
    }
}
