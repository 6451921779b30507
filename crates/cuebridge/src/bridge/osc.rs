//! OSC 1.0 packet model and binary encoding.
//!
//! Messages are an address string followed by a type tag string and the
//! big-endian argument payloads, every element padded to a 4-byte boundary.
//! Bundles are only understood on the receiving side, where they are
//! flattened into their contained messages.

use std::fmt;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};

const BUNDLE_TAG: &[u8; 8] = b"#bundle\0";
const MAX_BUNDLE_DEPTH: usize = 8;

/// A single typed OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Blob(Vec<u8>),
    Bool(bool),
    Nil,
}

impl OscArg {
    /// The type tag character written for this argument.
    pub fn tag(&self) -> char {
        match self {
            Self::Int(_) => 'i',
            Self::Long(_) => 'h',
            Self::Float(_) => 'f',
            Self::Double(_) => 'd',
            Self::Str(_) => 's',
            Self::Blob(_) => 'b',
            Self::Bool(true) => 'T',
            Self::Bool(false) => 'F',
            Self::Nil => 'N',
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for OscArg {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f32> for OscArg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for OscArg {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for OscArg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl fmt::Display for OscArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Nil => f.write_str("nil"),
        }
    }
}

/// Malformed packet conditions. Any of these drops the offending packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OscError {
    #[error("empty packet")]
    Empty,

    #[error("packet truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("string at offset {0} is not NUL terminated")]
    Unterminated(usize),

    #[error("string at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),

    #[error("string contains an embedded NUL byte")]
    EmbeddedNul,

    #[error("address {0:?} does not start with '/'")]
    InvalidAddress(String),

    #[error("type tag string does not start with ','")]
    MissingTypeTags,

    #[error("unsupported type tag '{0}'")]
    UnsupportedTag(char),

    #[error("invalid element size {0}")]
    InvalidSize(i64),

    #[error("{0} trailing bytes after message arguments")]
    TrailingBytes(usize),

    #[error("bundles nested too deeply")]
    BundleTooDeep,
}

/// An address plus its ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<OscArg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// A message with no arguments.
    pub fn bare(address: impl Into<String>) -> Self {
        Self::new(address, Vec::new())
    }

    /// Encode into a single OSC packet (no stream framing).
    pub fn encode(&self) -> Result<Bytes, OscError> {
        let mut dst = BytesMut::with_capacity(self.encoded_len_hint());
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), OscError> {
        if !self.address.starts_with('/') {
            return Err(OscError::InvalidAddress(self.address.clone()));
        }
        put_string(dst, &self.address)?;

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(OscArg::tag));
        put_string(dst, &tags)?;

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => dst.put_i32(*v),
                OscArg::Long(v) => dst.put_i64(*v),
                OscArg::Float(v) => dst.put_f32(*v),
                OscArg::Double(v) => dst.put_f64(*v),
                OscArg::Str(s) => put_string(dst, s)?,
                OscArg::Blob(b) => {
                    let len = i32::try_from(b.len())
                        .map_err(|_| OscError::InvalidSize(b.len() as i64))?;
                    dst.put_i32(len);
                    dst.put_slice(b);
                    dst.put_bytes(0, padded_len(b.len()) - b.len());
                }
                OscArg::Bool(_) | OscArg::Nil => {}
            }
        }
        Ok(())
    }

    /// Decode exactly one message. Bundles are rejected here; use
    /// [`decode_packet`] for anything received off the wire.
    ///
    /// Decoding is lenient: a missing type tag string and non-zero padding
    /// are accepted. [`encode`](Self::encode) always writes the canonical
    /// form, so re-encoding such input yields different bytes. Only encoder
    /// output round-trips byte for byte.
    pub fn decode(bytes: &[u8]) -> Result<Self, OscError> {
        if bytes.is_empty() {
            return Err(OscError::Empty);
        }
        let mut reader = Reader::new(bytes);
        let message = reader.message()?;
        match reader.remaining() {
            0 => Ok(message),
            n => Err(OscError::TrailingBytes(n)),
        }
    }

    fn encoded_len_hint(&self) -> usize {
        padded_len(self.address.len() + 1) + padded_len(self.args.len() + 2) + self.args.len() * 8
    }
}

impl fmt::Display for OscMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Decode a received packet, flattening bundles into their messages in order.
pub fn decode_packet(bytes: &[u8]) -> Result<Vec<OscMessage>, OscError> {
    let mut out = Vec::new();
    decode_packet_into(bytes, 0, &mut out)?;
    Ok(out)
}

fn decode_packet_into(
    bytes: &[u8],
    depth: usize,
    out: &mut Vec<OscMessage>,
) -> Result<(), OscError> {
    if !bytes.starts_with(BUNDLE_TAG) {
        out.push(OscMessage::decode(bytes)?);
        return Ok(());
    }
    if depth >= MAX_BUNDLE_DEPTH {
        return Err(OscError::BundleTooDeep);
    }

    let mut reader = Reader::new(bytes);
    reader.take(BUNDLE_TAG.len())?;
    // Time tag: contents are dispatched on arrival.
    reader.take(8)?;
    while reader.remaining() > 0 {
        let size = reader.i32()?;
        if size < 0 || size % 4 != 0 {
            return Err(OscError::InvalidSize(i64::from(size)));
        }
        let element = reader.take(size as usize)?;
        decode_packet_into(element, depth + 1, out)?;
    }
    Ok(())
}

/// Length of `n` bytes once padded to the next 4-byte boundary.
fn padded_len(n: usize) -> usize {
    (n + 3) & !3
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), OscError> {
    if s.as_bytes().contains(&0) {
        return Err(OscError::EmbeddedNul);
    }
    dst.put_slice(s.as_bytes());
    dst.put_bytes(0, padded_len(s.len() + 1) - s.len());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OscError> {
        let truncated = OscError::Truncated {
            offset: self.pos,
            needed: n,
        };
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(truncated)?;
        let slice = self.buf.get(self.pos..end).unwrap_or_default();
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self) -> Result<&'a str, OscError> {
        let start = self.pos;
        let rest = self.buf.get(start..).unwrap_or_default();
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(OscError::Unterminated(start))?;
        let raw = self.take(padded_len(nul + 1))?;
        std::str::from_utf8(&raw[..nul]).map_err(|_| OscError::InvalidUtf8(start))
    }

    fn i32(&mut self) -> Result<i32, OscError> {
        Ok(self.take(4)?.get_i32())
    }

    fn message(&mut self) -> Result<OscMessage, OscError> {
        let address = self.string()?;
        if !address.starts_with('/') {
            return Err(OscError::InvalidAddress(address.to_string()));
        }

        // Pre-1.0 senders may omit the type tag string when there are no args.
        if self.remaining() == 0 {
            return Ok(OscMessage::bare(address));
        }

        let tags = self.string()?;
        let tags = tags.strip_prefix(',').ok_or(OscError::MissingTypeTags)?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            let arg = match tag {
                'i' => OscArg::Int(self.i32()?),
                'h' => OscArg::Long(self.take(8)?.get_i64()),
                'f' => OscArg::Float(self.take(4)?.get_f32()),
                'd' => OscArg::Double(self.take(8)?.get_f64()),
                's' => OscArg::Str(self.string()?.to_string()),
                'b' => {
                    let len = self.i32()?;
                    let len = usize::try_from(len)
                        .map_err(|_| OscError::InvalidSize(i64::from(len)))?;
                    let data = self.take(len)?.to_vec();
                    self.take(padded_len(len) - len)?;
                    OscArg::Blob(data)
                }
                'T' => OscArg::Bool(true),
                'F' => OscArg::Bool(false),
                'N' => OscArg::Nil,
                other => return Err(OscError::UnsupportedTag(other)),
            };
            args.push(arg);
        }

        Ok(OscMessage {
            address: address.to_string(),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OscMessage {
        OscMessage::new(
            "/run-code",
            vec![
                OscArg::from("sender1"),
                OscArg::from("play 60"),
                OscArg::Int(-7),
                OscArg::Long(1 << 40),
                OscArg::Float(440.5),
                OscArg::Double(0.125),
                OscArg::Blob(vec![1, 2, 3]),
                OscArg::Bool(true),
                OscArg::Bool(false),
                OscArg::Nil,
            ],
        )
    }

    #[test]
    fn encodes_known_layout() {
        let bytes = OscMessage::new("/ack", vec![OscArg::from("req42")])
            .encode()
            .unwrap();
        assert_eq!(&bytes[..], b"/ack\0\0\0\0,s\0\0req42\0\0\0");
    }

    #[test]
    fn encodes_int_big_endian() {
        let bytes = OscMessage::new("/x", vec![OscArg::Int(1)]).encode().unwrap();
        assert_eq!(&bytes[..], b"/x\0\0,i\0\0\0\0\0\x01");
    }

    #[test]
    fn decode_then_encode_reproduces_bytes() {
        let original = sample().encode().unwrap();
        let decoded = OscMessage::decode(&original).unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(decoded.encode().unwrap(), original);
    }

    #[test]
    fn empty_message_has_comma_tag() {
        let bytes = OscMessage::bare("/exited").encode().unwrap();
        assert_eq!(&bytes[..], b"/exited\0,\0\0\0");
        assert_eq!(OscMessage::decode(&bytes).unwrap().args, vec![]);
    }

    #[test]
    fn missing_type_tags_means_no_args() {
        let msg = OscMessage::decode(b"/ping\0\0\0").unwrap();
        assert_eq!(msg.address, "/ping");
        assert!(msg.args.is_empty());
    }

    #[test]
    fn lenient_input_reencodes_canonically() {
        let canonical = OscMessage::bare("/ping").encode().unwrap();
        assert_eq!(&canonical[..], b"/ping\0\0\0,\0\0\0");

        for lenient in [&b"/ping\0\0\0"[..], &b"/ping\0xy,\0zz"[..]] {
            let msg = OscMessage::decode(lenient).unwrap();
            assert_eq!(msg, OscMessage::bare("/ping"));
            assert_eq!(msg.encode().unwrap(), canonical);
        }
    }

    #[test]
    fn truncated_argument_is_malformed() {
        let bytes = OscMessage::new("/x", vec![OscArg::Int(5)]).encode().unwrap();
        let err = OscMessage::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, OscError::Truncated { .. }));
    }

    #[test]
    fn unterminated_address_is_malformed() {
        assert_eq!(
            OscMessage::decode(b"/abc").unwrap_err(),
            OscError::Unterminated(0)
        );
    }

    #[test]
    fn address_must_start_with_slash() {
        let err = OscMessage::decode(b"ping\0\0\0\0,\0\0\0").unwrap_err();
        assert_eq!(err, OscError::InvalidAddress("ping".to_string()));
        assert!(OscMessage::bare("ping").encode().is_err());
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = OscMessage::decode(b"/x\0\0,q\0\0").unwrap_err();
        assert_eq!(err, OscError::UnsupportedTag('q'));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let err = OscMessage::decode(b"/x\0\0,\0\0\0junk").unwrap_err();
        assert_eq!(err, OscError::TrailingBytes(4));
    }

    #[test]
    fn negative_blob_size_is_rejected() {
        let err = OscMessage::decode(b"/x\0\0,b\0\0\xff\xff\xff\xff").unwrap_err();
        assert_eq!(err, OscError::InvalidSize(-1));
    }

    #[test]
    fn embedded_nul_cannot_be_encoded() {
        let msg = OscMessage::new("/info", vec![OscArg::from("a\0b")]);
        assert_eq!(msg.encode().unwrap_err(), OscError::EmbeddedNul);
    }

    #[test]
    fn bundles_flatten_in_order() {
        let first = OscMessage::new("/ping", vec!["gui".into(), "1".into()]);
        let second = OscMessage::new("/stop-all-jobs", vec!["gui".into()]);

        let mut inner = BytesMut::new();
        inner.put_slice(BUNDLE_TAG);
        inner.put_u64(1);
        let second_bytes = second.encode().unwrap();
        inner.put_i32(second_bytes.len() as i32);
        inner.put_slice(&second_bytes);

        let mut outer = BytesMut::new();
        outer.put_slice(BUNDLE_TAG);
        outer.put_u64(1);
        let first_bytes = first.encode().unwrap();
        outer.put_i32(first_bytes.len() as i32);
        outer.put_slice(&first_bytes);
        outer.put_i32(inner.len() as i32);
        outer.put_slice(&inner);

        let messages = decode_packet(&outer).unwrap();
        assert_eq!(messages, vec![first, second]);
    }

    #[test]
    fn deeply_nested_bundles_are_rejected() {
        let mut packet = BytesMut::new();
        packet.put_slice(BUNDLE_TAG);
        packet.put_u64(1);
        for _ in 0..MAX_BUNDLE_DEPTH {
            let mut outer = BytesMut::new();
            outer.put_slice(BUNDLE_TAG);
            outer.put_u64(1);
            outer.put_i32(packet.len() as i32);
            outer.put_slice(&packet);
            packet = outer;
        }
        assert_eq!(decode_packet(&packet).unwrap_err(), OscError::BundleTooDeep);
    }

    #[test]
    fn display_renders_address_and_args() {
        let msg = OscMessage::new(
            "/error",
            vec![OscArg::Int(3), "boom".into(), OscArg::Nil],
        );
        insta::assert_snapshot!(msg.to_string(), @r#"/error 3 "boom" nil"#);
    }
}
