use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Magic byte that opens every voice datagram
pub const MAGIC: u8 = 0xFF;

/// Magic byte plus the two session id words
pub const HEADER_LEN: usize = 17;

/// Largest datagram read from either side of the relay
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// 128-bit identifier of a voice participant, carried in every client datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub const fn from_u64_pair(high: u64, low: u64) -> Self {
        Self(Uuid::from_u64_pair(high, low))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_u64_pair(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A raw datagram read from the public socket
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub source: SocketAddr,
}

/// Reasons a datagram is not routable voice traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("empty datagram")]
    Empty,

    #[error("unexpected leading byte {0:#04x}")]
    BadMagic(u8),

    #[error("header truncated at {0} bytes")]
    Truncated(usize),
}

impl PacketError {
    /// Metric label for this discard reason
    pub fn reason(&self) -> &'static str {
        match self {
            PacketError::Empty => "empty",
            PacketError::BadMagic(_) => "bad_magic",
            PacketError::Truncated(_) => "truncated",
        }
    }
}

/// Extract the session id from a voice datagram header.
///
/// Only the header is inspected; the payload is opaque and stays untouched.
pub fn parse_header(data: &[u8]) -> Result<SessionId, PacketError> {
    let mut buf = data;
    if !buf.has_remaining() {
        return Err(PacketError::Empty);
    }

    let magic = buf.get_u8();
    if magic != MAGIC {
        return Err(PacketError::BadMagic(magic));
    }

    if data.len() < HEADER_LEN {
        return Err(PacketError::Truncated(data.len()));
    }

    let high = buf.get_u64();
    let low = buf.get_u64();
    Ok(SessionId::from_u64_pair(high, low))
}

/// Build a datagram the way a voice client frames it
pub fn frame(session: SessionId, payload: &[u8]) -> Bytes {
    let (high, low) = session.as_u64_pair();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(MAGIC);
    buf.put_u64(high);
    buf.put_u64(low);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_header() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
        data.extend_from_slice(&0x1112_1314_1516_1718u64.to_be_bytes());
        data.extend_from_slice(b"payload");

        let session = parse_header(&data).unwrap();
        assert_eq!(
            session.as_u64_pair(),
            (0x0102_0304_0506_0708, 0x1112_1314_1516_1718)
        );
        assert_eq!(
            session.to_string(),
            "01020304-0506-0708-1112-131415161718"
        );
    }

    #[test]
    fn test_header_only_is_valid() {
        let data = frame(SessionId::from_u64_pair(0, 1), b"");
        assert_eq!(data.len(), HEADER_LEN);
        assert_eq!(parse_header(&data).unwrap(), SessionId::from_u64_pair(0, 1));
    }

    #[test]
    fn test_reject_wrong_magic() {
        let mut data = frame(SessionId::from_u64_pair(0, 1), b"abc").to_vec();
        data[0] = 0xFE;
        assert_eq!(parse_header(&data), Err(PacketError::BadMagic(0xFE)));
    }

    #[test]
    fn test_reject_empty_and_truncated() {
        assert_eq!(parse_header(&[]), Err(PacketError::Empty));
        assert_eq!(parse_header(&[0xFF]), Err(PacketError::Truncated(1)));
        assert_eq!(parse_header(&[0xFF; 16]), Err(PacketError::Truncated(16)));
    }

    #[test]
    fn test_frame_keeps_payload_verbatim() {
        let session = SessionId::from_u64_pair(0, 1);
        let data = frame(session, b"abc");

        let mut expected = vec![0xFF];
        expected.extend_from_slice(&[0u8; 15]);
        expected.push(0x01);
        expected.extend_from_slice(b"abc");
        assert_eq!(&data[..], &expected[..]);
    }

    #[test]
    fn test_discard_reasons() {
        assert_eq!(PacketError::Empty.reason(), "empty");
        assert_eq!(PacketError::BadMagic(0).reason(), "bad_magic");
        assert_eq!(PacketError::Truncated(3).reason(), "truncated");
    }
}
