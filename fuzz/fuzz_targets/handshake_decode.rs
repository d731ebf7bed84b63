//! Fuzz harness for the handshake path.
//!
//! Runs before the peer is admitted: splits arbitrary input into frames
//! with the handshake codec and parses each frame as a handshake message.

#![no_main]
use battd_daemon::protocol::{FrameCodec, parse_handshake_message};
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::handshake();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = parse_handshake_message(&frame);
    }
});
