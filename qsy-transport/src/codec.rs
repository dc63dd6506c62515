//! Stream framing for node connections.
//!
//! TCP delivers a byte stream, so a frame can arrive split across several
//! reads. [`QsyCodec`] keeps the partial frame in the `FramedRead` buffer and
//! yields one item per 16 assembled bytes.

use std::io;
use std::net::IpAddr;

use bytes::BytesMut;
use qsy_core::protocol::PACKET_SIZE;
use qsy_core::{MalformedPacket, QsyPacket, decode, encode};
use tokio_util::codec::{Decoder, Encoder};

/// Fixed-size frame codec bound to the address of the remote node.
///
/// Decoding never fails the stream on a bad frame: malformed frames are
/// yielded as `Err` items so the caller can log and skip them. Only I/O
/// errors (and trailing bytes at end-of-stream) end the stream.
#[derive(Debug, Clone, Copy)]
pub struct QsyCodec {
    source: IpAddr,
}

impl QsyCodec {
    /// Codec for frames coming from `source`.
    pub fn new(source: IpAddr) -> Self {
        Self { source }
    }
}

impl Decoder for QsyCodec {
    type Item = Result<QsyPacket, MalformedPacket>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_SIZE {
            src.reserve(PACKET_SIZE - src.len());
            return Ok(None);
        }
        let frame = src.split_to(PACKET_SIZE);
        Ok(Some(decode(&frame, self.source)))
    }
}

impl Encoder<QsyPacket> for QsyCodec {
    type Error = io::Error;

    fn encode(&mut self, item: QsyPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&encode(&item));
        Ok(())
    }
}
