//! Length-prefixed frame codec.
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! # Security Considerations
//!
//! The length prefix is checked against the current limit before any buffer
//! is reserved for the payload. A connection starts with the handshake limit
//! and is raised to the full limit only once admitted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE, ProtocolError};

const LENGTH_PREFIX: usize = 4;

/// Codec for 4-byte big-endian length-prefixed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::handshake()
    }
}

impl FrameCodec {
    /// Create a codec with a custom limit.
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Codec limited to handshake frames.
    #[must_use]
    pub const fn handshake() -> Self {
        Self::new(MAX_HANDSHAKE_FRAME_SIZE)
    }

    /// Codec for admitted connections.
    #[must_use]
    pub const fn full() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }

    /// Current limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Raises the limit to [`MAX_FRAME_SIZE`].
    pub fn upgrade(&mut self) {
        self.max_frame_size = MAX_FRAME_SIZE;
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(len, self.max_frame_size));
        }

        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(item.len(), self.max_frame_size));
        }
        let len = u32::try_from(item.len())
            .map_err(|_| ProtocolError::frame_too_large(item.len(), self.max_frame_size))?;

        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut codec = FrameCodec::full();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, b'h', b'e'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"llo");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_prefix_rejected_before_payload() {
        let mut codec = FrameCodec::handshake();
        let len = u32::try_from(MAX_HANDSHAKE_FRAME_SIZE + 1).unwrap();
        let mut buf = BytesMut::from(&len.to_be_bytes()[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
        assert!(buf.capacity() < MAX_HANDSHAKE_FRAME_SIZE);
    }

    #[test]
    fn test_upgrade_raises_limit() {
        let mut codec = FrameCodec::handshake();
        let payload = Bytes::from(vec![0u8; MAX_HANDSHAKE_FRAME_SIZE + 1]);
        let mut dst = BytesMut::new();
        assert!(codec.encode(payload.clone(), &mut dst).is_err());

        codec.upgrade();
        codec.encode(payload, &mut dst).unwrap();
        let decoded = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_HANDSHAKE_FRAME_SIZE + 1);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec::full();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"a"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b""), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"bc"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "a");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "bc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
