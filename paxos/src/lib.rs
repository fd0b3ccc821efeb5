//! Multi-decree Paxos with one live slot per version, confirmed accepts and
//! dynamic quorum reconfiguration.
//!
//! # Roles
//!
//! - [`Server`] is the replica (acceptor): a pure, synchronous state machine
//!   answering `propose`, `accept`, `confirm` and `get`, serializable for
//!   snapshotting.
//! - [`Client`] is the coordinator: it drives the three phases in parallel
//!   against its peer set, adopts previously accepted values, and backs off
//!   on conflicts.
//! - [`Peer`] abstracts how a coordinator reaches a replica: [`LocalPeer`]
//!   delegates in-process, [`RemotePeer`] marshals each call over a
//!   [`chanmux`] channel.
//!
//! # Values and membership
//!
//! A chosen [`Value`] is either application data or a quorum change. Quorum
//! changes go through consensus like any other value; once one is confirmed,
//! every later version is issued against the new membership, and callers
//! still using the old one get [`ConsensusError::WrongQuorum`] back.
//!
//! ```ignore
//! let server = Arc::new(Mutex::new(Server::new(1, quorum, WireVersion::CURRENT)?));
//! let peers: Peers<i32, u64, u32, u32> = vec![Box::new(LocalPeer::new(server))];
//! let mut client = Client::new(7, peers);
//! assert_eq!(client.choose_at(0, 42).await?, None);
//! assert_eq!(client.get().await?, Some(42));
//! ```

#![warn(clippy::pedantic)]

mod client;
mod error;
mod peer;
mod remote;
mod server;
mod types;

pub use chanmux::WireVersion;
pub use client::{Client, Peers};
pub use error::{ConsensusError, PeerError, SnapshotError};
pub use peer::{LocalPeer, Peer};
pub use remote::{RemotePeer, serve, serve_channel};
pub use server::Server;
pub use types::{Accepted, NodeId, Payload, Proposal, Quorum, Value, Version, VersionState};
