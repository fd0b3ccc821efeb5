//! Channel multiplexing over one framed duplex stream.
//!
//! Every frame carries a 4-byte big-endian channel id followed by the channel
//! payload. The master endpoint allocates ids 1, 2, 3, … and the slave −1,
//! −2, −3, …, so the two allocators can never collide.
//!
//! Reader discipline: at most one task reads the backend at a time. A task
//! that needs a packet first drains its own queue, then either takes the
//! reader role or parks on its channel's notifier. The active reader routes
//! every arriving frame to its owner and hands the role back as soon as its
//! own packet (or an incoming channel, for acceptors) shows up; when the role
//! is released — normally, on failure, or because the reading task was
//! cancelled — every waiter is woken so one of them can take over or observe
//! the sticky failure. An arriving packet therefore always either satisfies
//! its owner or wakes the next reader: no channel starves.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::frame::{self, FrameCodec};
use crate::version::WireVersion;

type FrameWriter<S> = SplitSink<Framed<S, FrameCodec>, Bytes>;
type FrameReader<S> = SplitStream<Framed<S, FrameCodec>>;

/// What the active reader is waiting for.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Target {
    Channel(i32),
    Accept,
}

struct ChannelQueue {
    frames: VecDeque<Bytes>,
    ready: Arc<Notify>,
}

struct MuxState {
    /// Magnitude of the next locally allocated id.
    next_id: i32,
    /// Whether some task currently holds the reader role.
    reading: bool,
    /// Sticky backend failure, reported to every subsequent operation.
    failed: Option<TransportError>,
    channels: HashMap<i32, ChannelQueue>,
    /// Frames that arrived on ids with no local channel, in arrival order.
    pending: VecDeque<(i32, VecDeque<Bytes>)>,
}

struct Inner<S> {
    master: bool,
    version: WireVersion,
    writer: AsyncMutex<FrameWriter<S>>,
    reader: AsyncMutex<FrameReader<S>>,
    state: Mutex<MuxState>,
    /// Wakes tasks blocked in `accept`.
    incoming: Notify,
}

/// Exclusive hold on the reader role. Dropping it — even through
/// cancellation — releases the role and wakes every waiter.
struct ReaderRole<'a, S> {
    inner: &'a Inner<S>,
}

impl<S> Drop for ReaderRole<'_, S> {
    fn drop(&mut self) {
        // resetting under the lock guarantees a concurrent waiter either
        // sees the role free or gets woken below
        let mut state = self.inner.state.lock().unwrap();
        state.reading = false;
        for queue in state.channels.values() {
            queue.ready.notify_waiters();
        }
        drop(state);
        self.inner.incoming.notify_waiters();
    }
}

impl<S> Inner<S> {
    /// Whether this endpoint's allocator produced `id`.
    fn allocated_locally(&self, id: i32) -> bool {
        if self.master { id > 0 } else { id < 0 }
    }

    /// Take the reader role if it is free. Caller must hold the state lock.
    fn take_role<'a>(&'a self, state: &mut MuxState) -> Option<ReaderRole<'a, S>> {
        if state.reading {
            None
        } else {
            state.reading = true;
            Some(ReaderRole { inner: self })
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Inner<S> {
    /// Drive the backend until a frame for `target` arrives or the backend
    /// fails. Only the task holding the [`ReaderRole`] may call this.
    async fn pump(&self, target: Target) {
        let mut reader = self.reader.lock().await;
        loop {
            let frame = reader.next().await;
            let mut state = self.state.lock().unwrap();
            let mut payload = match frame {
                Some(Ok(payload)) => payload,
                Some(Err(e)) => {
                    debug!(error = %e, "backend read failed");
                    state.failed = Some(e);
                    return;
                }
                None => {
                    trace!("backend reached end of stream");
                    state.failed = Some(TransportError::Eof);
                    return;
                }
            };
            if payload.len() < 4 {
                state.failed = Some(TransportError::Corrupted);
                return;
            }
            let id = payload.get_i32();
            if let Some(queue) = state.channels.get_mut(&id) {
                trace!(id, len = payload.len(), "routed frame");
                queue.frames.push_back(payload);
                if target == Target::Channel(id) {
                    return;
                }
                queue.ready.notify_waiters();
            } else {
                trace!(id, len = payload.len(), "frame for unknown channel");
                if let Some((_, frames)) = state.pending.iter_mut().find(|(known, _)| *known == id)
                {
                    frames.push_back(payload);
                } else {
                    state.pending.push_back((id, VecDeque::from([payload])));
                }
                if target == Target::Accept {
                    return;
                }
                self.incoming.notify_waiters();
            }
            drop(state);
        }
    }
}

/// One underlying duplex stream multiplexed into independent channels.
///
/// Cheap to clone; all clones share the connection.
pub struct ChanneledStream<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ChanneledStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ChanneledStream<S> {
    /// Establish a channeled stream over `io`.
    ///
    /// Negotiates the wire version (pairwise minimum), then runs the master
    /// handshake: each side sends one random byte, ties are redrawn, and the
    /// higher roll becomes master. Both endpoints must pass the same
    /// `checksum` flag.
    ///
    /// # Errors
    ///
    /// Any transport fault during negotiation or handshake.
    pub async fn new(
        mut io: S,
        version: WireVersion,
        checksum: bool,
    ) -> Result<Self, TransportError> {
        let version = frame::negotiate(&mut io, version).await?;
        let mut framed = Framed::new(io, FrameCodec::new(version, checksum));
        let master = loop {
            let roll: u8 = rand::rng().random();
            framed.send(Bytes::copy_from_slice(&[roll])).await?;
            let Some(peer) = framed.next().await.transpose()? else {
                return Err(TransportError::Eof);
            };
            if peer.len() != 1 {
                return Err(TransportError::Corrupted);
            }
            if roll != peer[0] {
                break roll > peer[0];
            }
            trace!("handshake rolls tied, drawing again");
        };
        debug!(master, %version, "channeled stream established");
        let (writer, reader) = framed.split();
        Ok(Self {
            inner: Arc::new(Inner {
                master,
                version,
                writer: AsyncMutex::new(writer),
                reader: AsyncMutex::new(reader),
                state: Mutex::new(MuxState {
                    next_id: 1,
                    reading: false,
                    failed: None,
                    channels: HashMap::new(),
                    pending: VecDeque::new(),
                }),
                incoming: Notify::new(),
            }),
        })
    }

    /// Open a channel on a fresh locally allocated id.
    pub fn open(&self) -> Channel<S> {
        let mut state = self.inner.state.lock().unwrap();
        let magnitude = state.next_id;
        state.next_id = state.next_id.checked_add(1).unwrap_or(1);
        let id = if self.inner.master { magnitude } else { -magnitude };
        let ready = Arc::new(Notify::new());
        state.channels.insert(
            id,
            ChannelQueue {
                frames: VecDeque::new(),
                ready: ready.clone(),
            },
        );
        trace!(id, "opened channel");
        Channel {
            mux: self.inner.clone(),
            id,
            ready,
        }
    }

    /// Wait for the peer to open a channel.
    ///
    /// Frames on ids our own allocator produced are orphans — replies to
    /// channels we already dropped — and are discarded.
    ///
    /// # Errors
    ///
    /// The sticky backend failure, once the connection is down.
    pub async fn accept(&self) -> Result<Channel<S>, TransportError> {
        loop {
            let mut notified = pin!(self.inner.incoming.notified());
            notified.as_mut().enable();
            let role = {
                let mut state = self.inner.state.lock().unwrap();
                while let Some((id, frames)) = state.pending.pop_front() {
                    if self.inner.allocated_locally(id) {
                        debug!(id, "discarding orphaned channel");
                        continue;
                    }
                    let ready = Arc::new(Notify::new());
                    state.channels.insert(
                        id,
                        ChannelQueue {
                            frames,
                            ready: ready.clone(),
                        },
                    );
                    debug!(id, "accepted incoming channel");
                    return Ok(Channel {
                        mux: self.inner.clone(),
                        id,
                        ready,
                    });
                }
                if let Some(err) = &state.failed {
                    return Err(err.clone());
                }
                self.inner.take_role(&mut state)
            };
            match role {
                Some(_role) => self.inner.pump(Target::Accept).await,
                None => notified.await,
            }
        }
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        self.inner.master
    }

    #[must_use]
    pub fn version(&self) -> WireVersion {
        self.inner.version
    }
}

/// One logical channel of a [`ChanneledStream`].
///
/// Reads and writes are frame-preserving and ordered per channel. Dropping a
/// channel retires its id; frames that arrive for it afterwards surface as
/// orphans and are discarded by `accept`.
pub struct Channel<S> {
    mux: Arc<Inner<S>>,
    id: i32,
    ready: Arc<Notify>,
}

impl<S> std::fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl<S> Channel<S> {
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Channel<S> {
    /// Send one frame on this channel.
    ///
    /// # Errors
    ///
    /// Any transport fault on the backend.
    pub async fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        trace!(id = self.id, len = payload.len(), "sending frame");
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_i32(self.id);
        buf.extend_from_slice(payload);
        let mut writer = self.mux.writer.lock().await;
        writer.send(buf.freeze()).await
    }

    /// Receive the next frame on this channel.
    ///
    /// # Errors
    ///
    /// The sticky backend failure, once the connection is down.
    pub async fn read(&self) -> Result<Bytes, TransportError> {
        loop {
            let mut notified = pin!(self.ready.notified());
            notified.as_mut().enable();
            let role = {
                let mut state = self.mux.state.lock().unwrap();
                if let Some(queue) = state.channels.get_mut(&self.id)
                    && let Some(frame) = queue.frames.pop_front()
                {
                    trace!(id = self.id, len = frame.len(), "received frame");
                    return Ok(frame);
                }
                if let Some(err) = &state.failed {
                    return Err(err.clone());
                }
                self.mux.take_role(&mut state)
            };
            match role {
                Some(_role) => self.mux.pump(Target::Channel(self.id)).await,
                None => notified.await,
            }
        }
    }
}

impl<S> Drop for Channel<S> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.mux.state.lock() {
            state.channels.remove(&self.id);
        }
    }
}
