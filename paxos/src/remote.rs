//! Remote peers: the four RPCs marshaled over a [`chanmux`] channel.
//!
//! Each call opens a fresh channel, sends one request and reads one reply.
//! A call abandoned mid-flight just drops its channel; the late reply then
//! surfaces on the serving side's id as an orphan and is discarded, so
//! cancellation can never cross-wire two calls.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chanmux::{Channel, ChanneledStream, TransportError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, trace, warn};

use crate::error::{ConsensusError, PeerError};
use crate::peer::Peer;
use crate::server::Server;
use crate::types::{Accepted, NodeId, Payload, Proposal, Quorum, Value, Version};

/// One consensus RPC. Variant order is the wire discriminant.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Request<T, V, C, S: Ord> {
    Propose {
        quorum: Quorum<S>,
        proposal: Proposal<V, C>,
    },
    Accept {
        quorum: Quorum<S>,
        proposal: Proposal<V, C>,
        value: Value<T, S>,
    },
    Confirm {
        quorum: Quorum<S>,
        proposal: Proposal<V, C>,
    },
    Get {
        quorum: Quorum<S>,
    },
}

/// The reply to one [`Request`]. Variant order is the wire discriminant.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Response<T, V, C, S: Ord> {
    Propose(Option<Accepted<T, V, C, S>>),
    Accept(Proposal<V, C>),
    Confirm,
    Get(Option<Accepted<T, V, C, S>>),
    /// The replica processed the request and refused it.
    Refused(ConsensusError<V, C, S>),
}

fn unavailable<V, C, S: Ord>(e: &TransportError) -> PeerError<V, C, S> {
    PeerError::Unavailable(e.to_string())
}

fn garbled<V, C, S: Ord>(what: &str, e: &postcard::Error) -> PeerError<V, C, S> {
    PeerError::Consensus(ConsensusError::ProtocolViolation {
        reason: format!("{what}: {e}"),
    })
}

/// A replica reachable over a channeled stream.
pub struct RemotePeer<IO, T, V, C, S: Ord> {
    id: S,
    mux: ChanneledStream<IO>,
    _marker: PhantomData<fn() -> (T, V, C)>,
}

impl<IO, T, V, C, S: Ord + Copy> RemotePeer<IO, T, V, C, S> {
    pub fn new(id: S, mux: ChanneledStream<IO>) -> Self {
        Self {
            id,
            mux,
            _marker: PhantomData,
        }
    }
}

impl<IO, T, V, C, S> RemotePeer<IO, T, V, C, S>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    async fn call(
        &self,
        request: Request<T, V, C, S>,
    ) -> Result<Response<T, V, C, S>, PeerError<V, C, S>> {
        let bytes =
            postcard::to_allocvec(&request).map_err(|e| garbled("encoding request", &e))?;
        let channel = self.mux.open();
        trace!(channel = channel.id(), "sending request");
        channel
            .write(&bytes)
            .await
            .map_err(|e| unavailable(&e))?;
        let reply = channel.read().await.map_err(|e| unavailable(&e))?;
        postcard::from_bytes(&reply).map_err(|e| garbled("decoding reply", &e))
    }
}

#[async_trait]
impl<IO, T, V, C, S> Peer<T, V, C, S> for RemotePeer<IO, T, V, C, S>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    fn id(&self) -> S {
        self.id
    }

    async fn propose(
        &self,
        q: Quorum<S>,
        p: Proposal<V, C>,
    ) -> Result<Option<Accepted<T, V, C, S>>, PeerError<V, C, S>> {
        match self
            .call(Request::Propose {
                quorum: q,
                proposal: p,
            })
            .await?
        {
            Response::Propose(accepted) => Ok(accepted),
            Response::Refused(e) => Err(PeerError::Consensus(e)),
            _ => Err(PeerError::Consensus(ConsensusError::ProtocolViolation {
                reason: "mismatched reply to propose".into(),
            })),
        }
    }

    async fn accept(
        &self,
        q: Quorum<S>,
        p: Proposal<V, C>,
        value: Value<T, S>,
    ) -> Result<Proposal<V, C>, PeerError<V, C, S>> {
        match self
            .call(Request::Accept {
                quorum: q,
                proposal: p,
                value,
            })
            .await?
        {
            Response::Accept(minimum) => Ok(minimum),
            Response::Refused(e) => Err(PeerError::Consensus(e)),
            _ => Err(PeerError::Consensus(ConsensusError::ProtocolViolation {
                reason: "mismatched reply to accept".into(),
            })),
        }
    }

    async fn confirm(&self, q: Quorum<S>, p: Proposal<V, C>) -> Result<(), PeerError<V, C, S>> {
        match self
            .call(Request::Confirm {
                quorum: q,
                proposal: p,
            })
            .await?
        {
            Response::Confirm => Ok(()),
            Response::Refused(e) => Err(PeerError::Consensus(e)),
            _ => Err(PeerError::Consensus(ConsensusError::ProtocolViolation {
                reason: "mismatched reply to confirm".into(),
            })),
        }
    }

    async fn get(&self, q: Quorum<S>) -> Result<Option<Accepted<T, V, C, S>>, PeerError<V, C, S>> {
        match self.call(Request::Get { quorum: q }).await? {
            Response::Get(accepted) => Ok(accepted),
            Response::Refused(e) => Err(PeerError::Consensus(e)),
            _ => Err(PeerError::Consensus(ConsensusError::ProtocolViolation {
                reason: "mismatched reply to get".into(),
            })),
        }
    }
}

/// Answer one request on `channel` against `server`.
///
/// # Errors
///
/// Transport faults other than the peer hanging up.
pub async fn serve_channel<IO, T, V, C, S>(
    channel: Channel<IO>,
    server: Arc<Mutex<Server<T, V, C, S>>>,
) -> Result<(), TransportError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    let bytes = match channel.read().await {
        Ok(bytes) => bytes,
        Err(TransportError::Eof) => return Ok(()),
        Err(e) => return Err(e),
    };
    let request: Request<T, V, C, S> = match postcard::from_bytes(&bytes) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "dropping undecodable request");
            return Ok(());
        }
    };
    trace!(?request, "serving request");
    let response = {
        let mut server = server.lock().unwrap();
        match request {
            Request::Propose { quorum, proposal } => match server.propose(quorum, proposal) {
                Ok(accepted) => Response::Propose(accepted),
                Err(e) => Response::Refused(e),
            },
            Request::Accept {
                quorum,
                proposal,
                value,
            } => match server.accept(quorum, proposal, value) {
                Ok(minimum) => Response::Accept(minimum),
                Err(e) => Response::Refused(e),
            },
            Request::Confirm { quorum, proposal } => match server.confirm(quorum, proposal) {
                Ok(()) => Response::Confirm,
                Err(e) => Response::Refused(e),
            },
            Request::Get { quorum } => match server.get(quorum) {
                Ok(accepted) => Response::Get(accepted),
                Err(e) => Response::Refused(e),
            },
        }
    };
    let bytes = match postcard::to_allocvec(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "dropping unencodable response");
            return Ok(());
        }
    };
    channel.write(&bytes).await
}

/// Serve `server` to every channel the peer opens on `stream`, until the
/// connection closes.
///
/// # Errors
///
/// Transport faults other than the peer hanging up.
#[instrument(skip_all)]
pub async fn serve<IO, T, V, C, S>(
    stream: ChanneledStream<IO>,
    server: Arc<Mutex<Server<T, V, C, S>>>,
) -> Result<(), TransportError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    T: Payload,
    V: Version,
    C: NodeId,
    S: NodeId,
{
    loop {
        let channel = match stream.accept().await {
            Ok(channel) => channel,
            Err(TransportError::Eof) => {
                debug!("peer hung up, stopping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_channel(channel, server).await {
                debug!(error = %e, "request channel failed");
            }
        });
    }
}
