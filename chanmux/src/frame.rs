//! Length-delimited framing with version negotiation.
//!
//! Frame layout, newest format first:
//!
//! ```text
//! [control: u8]   only when the negotiated version has control bytes;
//!                 0 announces a data frame, anything else is skipped
//! [length: varint]
//! [payload: length bytes]
//! [trailer: u32]  only when the connection enables checksums
//! ```
//!
//! The varint is little-endian base 128: seven payload bits per byte with a
//! continuation bit, except that a ninth byte carries eight raw bits, so a
//! `u64` never takes more than nine bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::TransportError;
use crate::version::WireVersion;

/// Upper bound on a single frame payload.
const MAX_FRAME: u64 = 16 * 1024 * 1024;

/// Control byte announcing that a data frame follows.
const CONTROL_DATA: u8 = 0;

const TRAILER_LEN: usize = 4;

/// Exchange wire versions with the peer and settle on the pairwise minimum.
///
/// Must run before any framed traffic; each side writes its version as three
/// raw bytes and reads the peer's three.
///
/// # Errors
///
/// Fails with [`TransportError::Truncated`] if the peer hangs up mid-exchange.
pub async fn negotiate<S>(io: &mut S, local: WireVersion) -> Result<WireVersion, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(&[local.major, local.minor, local.sub]).await?;
    io.flush().await?;
    let mut peer = [0u8; 3];
    io.read_exact(&mut peer).await?;
    let peer = WireVersion::new(peer[0], peer[1], peer[2]);
    let effective = local.min(peer);
    trace!(%local, %peer, %effective, "negotiated wire version");
    Ok(effective)
}

/// Append `n` in varint form.
pub fn put_varint(buf: &mut impl BufMut, mut n: u64) {
    for _ in 0..8 {
        if n < 0x80 {
            buf.put_u8(n as u8);
            return;
        }
        buf.put_u8((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    // 56 bits consumed; whatever remains fits in one raw byte
    buf.put_u8(n as u8);
}

/// Decode a varint from the front of `src` without consuming anything.
///
/// Returns the value and its encoded width, or `None` if `src` ends before
/// the varint does.
fn peek_varint(src: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..8 {
        let byte = *src.get(i)?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    let byte = *src.get(8)?;
    value |= u64::from(byte) << 56;
    Some((value, 9))
}

fn trailer(payload: &[u8]) -> u32 {
    let hash = *blake3::hash(payload).as_bytes();
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Frame codec for one negotiated connection.
///
/// Both endpoints must agree on `checksum`; it cannot change mid-connection.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    version: WireVersion,
    checksum: bool,
}

impl FrameCodec {
    #[must_use]
    pub fn new(version: WireVersion, checksum: bool) -> Self {
        Self { version, checksum }
    }

    #[must_use]
    pub fn version(&self) -> WireVersion {
        self.version
    }

    fn control_byte(&self) -> bool {
        self.version >= WireVersion::CONTROL_BYTES
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        loop {
            let mut header = 0;
            if self.control_byte() {
                match src.first() {
                    None => return Ok(None),
                    Some(&CONTROL_DATA) => header = 1,
                    Some(&control) => {
                        // out-of-band marker: not ours, skip it
                        trace!(control, "skipping out-of-band control byte");
                        src.advance(1);
                        continue;
                    }
                }
            }
            let Some((length, width)) = peek_varint(&src[header..]) else {
                return Ok(None);
            };
            if length > MAX_FRAME {
                return Err(TransportError::Corrupted);
            }
            let length = length as usize;
            let total = header + width + length + if self.checksum { TRAILER_LEN } else { 0 };
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            src.advance(header + width);
            let payload = src.split_to(length).freeze();
            if self.checksum && src.get_u32() != trailer(&payload) {
                return Err(TransportError::Corrupted);
            }
            return Ok(Some(payload));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(TransportError::Truncated),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if self.control_byte() {
            dst.put_u8(CONTROL_DATA);
        }
        put_varint(dst, item.len() as u64);
        dst.extend_from_slice(&item);
        if self.checksum {
            dst.put_u32(trailer(&item));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_width(n: u64) -> usize {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, n);
        let (decoded, width) = peek_varint(&buf).expect("complete varint");
        assert_eq!(decoded, n);
        width
    }

    #[test]
    fn varint_round_trips() {
        assert_eq!(varint_width(0), 1);
        assert_eq!(varint_width(127), 1);
        assert_eq!(varint_width(128), 2);
        assert_eq!(varint_width(16_383), 2);
        assert_eq!(varint_width(16_384), 3);
        assert_eq!(varint_width(u64::from(u32::MAX)), 5);
        assert_eq!(varint_width(u64::MAX), 9);
    }

    #[test]
    fn varint_incomplete_wants_more() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        assert!(peek_varint(&buf[..1]).is_none());
    }

    fn round_trip(codec: &mut FrameCodec, payload: &[u8]) -> Bytes {
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(payload), &mut wire)
            .expect("encode");
        let frame = codec.decode(&mut wire).expect("decode").expect("complete");
        assert!(wire.is_empty());
        frame
    }

    #[test]
    fn frame_round_trips() {
        let mut codec = FrameCodec::new(WireVersion::CURRENT, true);
        assert_eq!(&round_trip(&mut codec, b"hello")[..], b"hello");
        assert_eq!(&round_trip(&mut codec, b"")[..], b"");
    }

    #[test]
    fn legacy_frames_have_no_control_byte() {
        let mut codec = FrameCodec::new(WireVersion::CONFIRMED_ACCEPTS, false);
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"abc"), &mut wire)
            .expect("encode");
        assert_eq!(&wire[..], &[3, b'a', b'b', b'c']);
    }

    #[test]
    fn out_of_band_control_bytes_are_skipped() {
        let mut codec = FrameCodec::new(WireVersion::CURRENT, false);
        let mut wire = BytesMut::new();
        wire.put_u8(7);
        wire.put_u8(9);
        codec
            .encode(Bytes::from_static(b"data"), &mut wire)
            .expect("encode");
        let frame = codec.decode(&mut wire).expect("decode").expect("complete");
        assert_eq!(&frame[..], b"data");
    }

    #[test]
    fn partial_frame_wants_more() {
        let mut codec = FrameCodec::new(WireVersion::CURRENT, true);
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"partial"), &mut wire)
            .expect("encode");
        let mut cut = wire.split_to(wire.len() - 3);
        assert!(codec.decode(&mut cut).expect("no error yet").is_none());
    }

    #[test]
    fn truncation_is_detected_at_eof() {
        let mut codec = FrameCodec::new(WireVersion::CURRENT, true);
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"partial"), &mut wire)
            .expect("encode");
        let mut cut = wire.split_to(wire.len() - 3);
        assert!(matches!(
            codec.decode_eof(&mut cut),
            Err(TransportError::Truncated)
        ));
    }

    #[test]
    fn clean_eof_is_not_an_error() {
        let mut codec = FrameCodec::new(WireVersion::CURRENT, true);
        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).expect("clean eof").is_none());
    }

    #[test]
    fn corruption_is_detected() {
        let mut codec = FrameCodec::new(WireVersion::CURRENT, true);
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"payload"), &mut wire)
            .expect("encode");
        let flip = wire.len() - TRAILER_LEN - 1;
        wire[flip] ^= 0xff;
        assert!(matches!(
            codec.decode(&mut wire),
            Err(TransportError::Corrupted)
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::new(WireVersion::CURRENT, true);
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"first"), &mut wire)
            .expect("encode");
        codec
            .encode(Bytes::from_static(b"second"), &mut wire)
            .expect("encode");
        let first = codec.decode(&mut wire).expect("decode").expect("complete");
        let second = codec.decode(&mut wire).expect("decode").expect("complete");
        assert_eq!(&first[..], b"first");
        assert_eq!(&second[..], b"second");
        assert!(codec.decode(&mut wire).expect("drained").is_none());
    }
}
