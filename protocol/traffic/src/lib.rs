//! Wire framing shared by the client and server roles.
//!
//! TCP carries no framing: the exchange is position-based. The server sends a
//! fixed-length connection identifier, the configured pattern moves its bytes,
//! and the server finishes with a fixed-length completion marker.
//!
//! UDP datagrams all begin with a two-byte little-endian frame tag. A
//! connection-id datagram carries the opaque identifier; a data datagram
//! carries a sequence number and the sender's clock reading/frequency so the
//! receiver can estimate time in flight.

use std::fmt;

/// Length of the opaque per-connection identifier exchanged at startup.
pub const CONNECTION_ID_LEN: usize = 36;

/// Sentinel the server sends once it has finished sending everything it
/// intends to send.
pub const COMPLETION_MARKER: &[u8; 4] = b"DONE";

/// Length of the completion marker.
pub const COMPLETION_MARKER_LEN: usize = COMPLETION_MARKER.len();

/// Frame tag for a data datagram.
pub const FRAME_TAG_DATA: u16 = 0x0000;
/// Frame tag for a connection-id datagram.
pub const FRAME_TAG_CONNECTION_ID: u16 = 0x1000;

/// Length of the frame tag prefix on every datagram.
pub const FRAME_TAG_LEN: usize = 2;

/// Full length of a connection-id datagram: tag + identifier.
pub const CONNECTION_ID_DATAGRAM_LEN: usize = FRAME_TAG_LEN + CONNECTION_ID_LEN;

/// Header of a data datagram: tag, sequence number, sender clock reading,
/// sender clock frequency.
pub const DATAGRAM_HEADER_LEN: usize = FRAME_TAG_LEN + 8 + 8 + 8;

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM_BYTES: usize = 64_000;

/// Control verb the client sends to request the server begin streaming.
pub const START_VERB: &[u8; 5] = b"START";

/// Errors raised while decoding a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown frame tag {0:#06x}")]
    UnknownTag(u16),
    #[error("datagram exceeds the maximum size: {0} bytes")]
    TooLarge(usize),
}

/// The kind of datagram, decoded from the leading frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Data,
    ConnectionId,
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameTag::Data => write!(f, "data"),
            FrameTag::ConnectionId => write!(f, "connection-id"),
        }
    }
}

/// Decode the frame tag from the head of a datagram.
pub fn decode_tag(datagram: &[u8]) -> Result<FrameTag, FrameError> {
    if datagram.len() < FRAME_TAG_LEN {
        return Err(FrameError::TooShort(datagram.len()));
    }
    if datagram.len() > MAX_DATAGRAM_BYTES {
        return Err(FrameError::TooLarge(datagram.len()));
    }
    match u16::from_le_bytes([datagram[0], datagram[1]]) {
        FRAME_TAG_DATA => Ok(FrameTag::Data),
        FRAME_TAG_CONNECTION_ID => Ok(FrameTag::ConnectionId),
        other => Err(FrameError::UnknownTag(other)),
    }
}

/// Header fields of a data datagram.
///
/// `sender_clock` and `sender_clock_frequency` are the sender's monotonic
/// counter reading and tick rate at the moment the datagram was composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub sequence: i64,
    pub sender_clock: i64,
    pub sender_clock_frequency: i64,
}

impl DatagramHeader {
    /// Encode the header (including the data frame tag) into the front of
    /// `buf`. `buf` must hold at least [`DATAGRAM_HEADER_LEN`] bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&FRAME_TAG_DATA.to_le_bytes());
        buf[2..10].copy_from_slice(&self.sequence.to_le_bytes());
        buf[10..18].copy_from_slice(&self.sender_clock.to_le_bytes());
        buf[18..26].copy_from_slice(&self.sender_clock_frequency.to_le_bytes());
    }

    /// Decode a data datagram header. The caller is expected to have already
    /// checked the frame tag; this validates length and tag again for safety.
    pub fn decode(datagram: &[u8]) -> Result<Self, FrameError> {
        if decode_tag(datagram)? != FrameTag::Data {
            return Err(FrameError::UnknownTag(u16::from_le_bytes([
                datagram[0],
                datagram[1],
            ])));
        }
        if datagram.len() < DATAGRAM_HEADER_LEN {
            return Err(FrameError::TooShort(datagram.len()));
        }
        let read_i64 = |off: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&datagram[off..off + 8]);
            i64::from_le_bytes(raw)
        };
        Ok(Self {
            sequence: read_i64(2),
            sender_clock: read_i64(10),
            sender_clock_frequency: read_i64(18),
        })
    }
}

/// Encode a connection-id datagram into `buf`, returning the encoded length.
/// `buf` must hold at least [`CONNECTION_ID_DATAGRAM_LEN`] bytes.
pub fn encode_connection_id_datagram(
    buf: &mut [u8],
    connection_id: &[u8; CONNECTION_ID_LEN],
) -> usize {
    buf[0..2].copy_from_slice(&FRAME_TAG_CONNECTION_ID.to_le_bytes());
    buf[2..CONNECTION_ID_DATAGRAM_LEN].copy_from_slice(connection_id);
    CONNECTION_ID_DATAGRAM_LEN
}

/// Extract the connection id from a connection-id datagram.
pub fn decode_connection_id_datagram(
    datagram: &[u8],
) -> Result<[u8; CONNECTION_ID_LEN], FrameError> {
    if decode_tag(datagram)? != FrameTag::ConnectionId {
        return Err(FrameError::UnknownTag(u16::from_le_bytes([
            datagram[0],
            datagram[1],
        ])));
    }
    if datagram.len() < CONNECTION_ID_DATAGRAM_LEN {
        return Err(FrameError::TooShort(datagram.len()));
    }
    let mut id = [0u8; CONNECTION_ID_LEN];
    id.copy_from_slice(&datagram[FRAME_TAG_LEN..CONNECTION_ID_DATAGRAM_LEN]);
    Ok(id)
}

/// Returns true if the payload is exactly the START verb.
pub fn is_start_verb(payload: &[u8]) -> bool {
    payload == START_VERB
}

/// Format 16 bytes of entropy as a hyphenated hex identifier of exactly
/// [`CONNECTION_ID_LEN`] bytes (8-4-4-4-12 grouping).
pub fn format_connection_id(entropy: u128) -> [u8; CONNECTION_ID_LEN] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let raw = entropy.to_be_bytes();
    let mut out = [0u8; CONNECTION_ID_LEN];
    let mut pos = 0;
    for (i, byte) in raw.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            out[pos] = b'-';
            pos += 1;
        }
        out[pos] = HEX[(byte >> 4) as usize];
        out[pos + 1] = HEX[(byte & 0xf) as usize];
        pos += 2;
    }
    debug_assert_eq!(pos, CONNECTION_ID_LEN);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips() {
        let mut buf = [0u8; 4];
        buf[0..2].copy_from_slice(&FRAME_TAG_DATA.to_le_bytes());
        assert_eq!(decode_tag(&buf).unwrap(), FrameTag::Data);

        buf[0..2].copy_from_slice(&FRAME_TAG_CONNECTION_ID.to_le_bytes());
        assert_eq!(decode_tag(&buf).unwrap(), FrameTag::ConnectionId);
    }

    #[test]
    fn tag_rejects_unknown_and_short() {
        assert_eq!(decode_tag(&[0x34]), Err(FrameError::TooShort(1)));
        assert_eq!(decode_tag(&[0x34, 0x12]), Err(FrameError::UnknownTag(0x1234)));
    }

    #[test]
    fn datagram_header_layout() {
        let header = DatagramHeader {
            sequence: 7,
            sender_clock: 123_456_789,
            sender_clock_frequency: 1_000_000_000,
        };
        let mut buf = vec![0u8; DATAGRAM_HEADER_LEN + 10];
        header.encode(&mut buf);

        // tag occupies the first two bytes, little endian
        assert_eq!(&buf[0..2], &[0x00, 0x00]);
        assert_eq!(DatagramHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn header_decode_rejects_short_data_frame() {
        let header = DatagramHeader {
            sequence: 1,
            sender_clock: 2,
            sender_clock_frequency: 3,
        };
        let mut buf = vec![0u8; DATAGRAM_HEADER_LEN];
        header.encode(&mut buf);
        buf.truncate(DATAGRAM_HEADER_LEN - 1);
        assert!(matches!(
            DatagramHeader::decode(&buf),
            Err(FrameError::TooShort(_))
        ));
    }

    #[test]
    fn connection_id_datagram_round_trips() {
        let id = format_connection_id(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        let mut buf = [0u8; CONNECTION_ID_DATAGRAM_LEN];
        let n = encode_connection_id_datagram(&mut buf, &id);
        assert_eq!(n, CONNECTION_ID_DATAGRAM_LEN);
        assert_eq!(decode_tag(&buf).unwrap(), FrameTag::ConnectionId);
        assert_eq!(decode_connection_id_datagram(&buf).unwrap(), id);
    }

    #[test]
    fn connection_id_is_hyphenated_hex() {
        let id = format_connection_id(u128::MAX);
        let text = std::str::from_utf8(&id).unwrap();
        assert_eq!(text.len(), CONNECTION_ID_LEN);
        assert_eq!(text, "ffffffff-ffff-ffff-ffff-ffffffffffff");
    }

    #[test]
    fn start_verb_is_five_ascii_bytes() {
        assert_eq!(START_VERB.len(), 5);
        assert!(is_start_verb(b"START"));
        assert!(!is_start_verb(b"STOP"));
        assert!(!is_start_verb(b"START "));
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let buf = vec![0u8; MAX_DATAGRAM_BYTES + 1];
        assert_eq!(
            decode_tag(&buf),
            Err(FrameError::TooLarge(MAX_DATAGRAM_BYTES + 1))
        );
    }
}
