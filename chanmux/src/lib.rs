//! Channel multiplexing over any ordered, reliable duplex byte stream.
//!
//! A [`ChanneledStream`] wraps a single `AsyncRead + AsyncWrite` transport and
//! splits it into independent, ordered, frame-preserving channels. Both
//! endpoints run a symmetric handshake that elects a master; the master
//! allocates positive channel ids and the slave negative ones, so ids never
//! collide without a shared allocator.
//!
//! Below the channels sits a framing layer ([`frame::FrameCodec`]): varint
//! length-delimited packets, an optional control byte for out-of-band
//! messages, and an optional per-connection integrity trailer. Clean
//! end-of-stream, mid-frame truncation and corruption are reported as
//! distinct [`TransportError`] kinds.
//!
//! ```ignore
//! let (a, b) = tokio::io::duplex(4096);
//! let left = ChanneledStream::new(a, WireVersion::CURRENT, true);
//! let right = ChanneledStream::new(b, WireVersion::CURRENT, true);
//! let (left, right) = tokio::try_join!(left, right)?;
//!
//! let channel = left.open();
//! channel.write(b"ping").await?;
//! let incoming = right.accept().await?;
//! assert_eq!(&incoming.read().await?[..], b"ping");
//! ```

#![warn(clippy::pedantic)]

mod error;
pub mod frame;
mod mux;
mod version;

pub use error::TransportError;
pub use mux::{Channel, ChanneledStream};
pub use version::WireVersion;
