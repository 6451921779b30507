//! Framed codec for OSC over stream sockets.
//!
//! Uses LengthDelimitedCodec for framing (4-byte big-endian size prefix, the
//! OSC 1.0 stream convention) plus the OSC binary format for each payload.
//! Datagram transports skip the prefix entirely: one packet per datagram.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::osc::{OscError, OscMessage, decode_packet};
use super::transport::TransportKind;

const LENGTH_FIELD_BYTES: usize = 4;

/// Codec that frames OSC packets with a length prefix.
///
/// A frame whose payload fails to parse is yielded as an `Err` item rather
/// than a decoder error, so one bad packet does not close the connection.
pub struct OscStreamCodec {
    inner: LengthDelimitedCodec,
}

impl Default for OscStreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl OscStreamCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_BYTES)
                .new_codec(),
        }
    }
}

impl Decoder for OscStreamCodec {
    type Item = Result<Vec<OscMessage>, OscError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(decode_packet(&frame))),
            None => Ok(None),
        }
    }
}

impl Encoder<OscMessage> for OscStreamCodec {
    type Error = io::Error;

    fn encode(&mut self, item: OscMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(address = %item.address, size_bytes = payload.len(), "Encoding frame");
        self.inner.encode(payload, dst)
    }
}

/// Encode a message for the given transport's framing.
pub fn encode_for(kind: TransportKind, message: &OscMessage) -> Result<Bytes, OscError> {
    match kind {
        TransportKind::Datagram => message.encode(),
        TransportKind::Stream => {
            let payload = message.encode()?;
            let len = u32::try_from(payload.len())
                .map_err(|_| OscError::InvalidSize(payload.len() as i64))?;
            let mut dst = BytesMut::with_capacity(LENGTH_FIELD_BYTES + payload.len());
            dst.put_u32(len);
            dst.put_slice(&payload);
            Ok(dst.freeze())
        }
    }
}

/// Decode one complete transport unit (a datagram, or exactly one stream frame).
pub fn decode_for(kind: TransportKind, bytes: &[u8]) -> Result<Vec<OscMessage>, OscError> {
    match kind {
        TransportKind::Datagram => decode_packet(bytes),
        TransportKind::Stream => {
            let (prefix, payload) = bytes
                .split_first_chunk::<LENGTH_FIELD_BYTES>()
                .ok_or(OscError::Truncated {
                    offset: 0,
                    needed: LENGTH_FIELD_BYTES,
                })?;
            let len = u32::from_be_bytes(*prefix) as usize;
            if payload.len() < len {
                return Err(OscError::Truncated {
                    offset: LENGTH_FIELD_BYTES,
                    needed: len,
                });
            }
            if payload.len() > len {
                return Err(OscError::TrailingBytes(payload.len() - len));
            }
            decode_packet(payload)
        }
    }
}
