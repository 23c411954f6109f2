//! Outer frame codec.
//!
//! Wire layout (big-endian throughout):
//!
//! ```text
//! [ header 2B ][ declared_length 2B ][ command 2B ][ msg_id 4B ]
//! [ direction 1B ][ gateway_id 7B ][ payload N B ][ checksum 1B ][ tail 2B ]
//! ```
//!
//! `declared_length` counts every byte from `command` through `tail`
//! inclusive, i.e. `17 + N`. The checksum is the 8-bit sum of all bytes from
//! `command` through the last payload byte inclusive.
//!
//! The stream decoder never tears down a connection on a malformed frame: it
//! reports a [`BadFrame`] and resynchronises one byte past the header.

use std::fmt;
use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_UPLINK: u16 = 0xFCFE;
pub const HEADER_DOWNLINK: u16 = 0xFCFF;
pub const TAIL: u16 = 0xFCEE;

/// Bytes covered by `declared_length` besides the payload:
/// command(2) + msg_id(4) + direction(1) + gateway_id(7) + checksum(1) + tail(2).
pub const FRAME_OVERHEAD: usize = 17;

/// Declared lengths above this are rejected without buffering the frame.
pub const MAX_DECLARED_LEN: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Frame direction. Devices send uplink; the platform sends downlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    pub fn header(self) -> u16 {
        match self {
            Direction::Uplink => HEADER_UPLINK,
            Direction::Downlink => HEADER_DOWNLINK,
        }
    }

    /// The direction byte inside the frame body. Must agree with the header.
    pub fn wire_byte(self) -> u8 {
        match self {
            Direction::Uplink => 0x01,
            Direction::Downlink => 0x00,
        }
    }

    fn from_header(header: u16) -> Option<Direction> {
        match header {
            HEADER_UPLINK => Some(Direction::Uplink),
            HEADER_DOWNLINK => Some(Direction::Downlink),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayId
// ---------------------------------------------------------------------------

/// A 7-byte packed-hex gateway identity (14 ASCII nibbles on the outside).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GatewayId([u8; 7]);

impl GatewayId {
    pub const LEN: usize = 7;

    pub fn from_bytes(bytes: [u8; 7]) -> GatewayId {
        GatewayId(bytes)
    }

    /// Parse the 14-nibble hex form, e.g. `"82241218000382"`.
    pub fn parse(s: &str) -> Result<GatewayId, FrameError> {
        if s.len() != 14 {
            return Err(FrameError::BadGatewayId);
        }
        let raw = hex::decode(s).map_err(|_| FrameError::BadGatewayId)?;
        let mut bytes = [0u8; 7];
        bytes.copy_from_slice(&raw);
        Ok(GatewayId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for GatewayId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GatewayId::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("gateway id must be 14 hex characters")]
    BadGatewayId,
    #[error("payload of {0} bytes exceeds the frame size limit")]
    PayloadTooLarge(usize),
    #[error("buffer does not hold a complete frame")]
    Truncated,
    #[error("unknown frame header")]
    BadHeader,
    #[error("declared length {0} is out of range")]
    BadDeclaredLength(usize),
    #[error("frame tail missing or corrupt")]
    BadTail,
    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    BadChecksum { expected: u8, actual: u8 },
    #[error("direction byte disagrees with the frame header")]
    DirectionMismatch,
    #[error("trailing bytes after a complete frame")]
    TrailingBytes,
}

/// Why a stretch of the stream failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BadFrameKind {
    Checksum,
    Tail,
    Oversize,
    Direction,
}

impl BadFrameKind {
    pub fn label(self) -> &'static str {
        match self {
            BadFrameKind::Checksum => "checksum",
            BadFrameKind::Tail => "tail",
            BadFrameKind::Oversize => "oversize",
            BadFrameKind::Direction => "direction",
        }
    }
}

/// A rejected frame, with the absolute stream position of its header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadFrame {
    pub kind: BadFrameKind,
    pub position: u64,
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A decoded frame, or the input to the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub command: u16,
    pub msg_id: u32,
    pub gateway_id: GatewayId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn uplink(command: u16, msg_id: u32, gateway_id: GatewayId, payload: Vec<u8>) -> Frame {
        Frame {
            direction: Direction::Uplink,
            command,
            msg_id,
            gateway_id,
            payload,
        }
    }

    pub fn downlink(command: u16, msg_id: u32, gateway_id: GatewayId, payload: Vec<u8>) -> Frame {
        Frame {
            direction: Direction::Downlink,
            command,
            msg_id,
            gateway_id,
            payload,
        }
    }

    /// Encode into a complete framed byte vector with checksum and tail.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let declared = FRAME_OVERHEAD + self.payload.len();
        if declared > MAX_DECLARED_LEN {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let mut out = Vec::with_capacity(4 + declared);
        out.extend_from_slice(&self.direction.header().to_be_bytes());
        out.extend_from_slice(&(declared as u16).to_be_bytes());
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.push(self.direction.wire_byte());
        out.extend_from_slice(self.gateway_id.as_bytes());
        out.extend_from_slice(&self.payload);
        let checksum = checksum(&out[4..]);
        out.push(checksum);
        out.extend_from_slice(&TAIL.to_be_bytes());
        Ok(out)
    }

    /// Strict parse of exactly one frame occupying the whole buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < 4 {
            return Err(FrameError::Truncated);
        }
        let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if !(FRAME_OVERHEAD..=MAX_DECLARED_LEN).contains(&declared) {
            return Err(FrameError::BadDeclaredLength(declared));
        }
        let total = 4 + declared;
        if buf.len() < total {
            return Err(FrameError::Truncated);
        }
        if buf.len() > total {
            return Err(FrameError::TrailingBytes);
        }
        parse_complete(buf)
    }
}

/// 8-bit sum over `command` through the last payload byte.
pub fn checksum(command_through_payload: &[u8]) -> u8 {
    command_through_payload
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Parse a buffer known to hold exactly `4 + declared` bytes of one frame.
fn parse_complete(buf: &[u8]) -> Result<Frame, FrameError> {
    let header = u16::from_be_bytes([buf[0], buf[1]]);
    let direction = Direction::from_header(header).ok_or(FrameError::BadHeader)?;
    let total = buf.len();

    let tail = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
    if tail != TAIL {
        return Err(FrameError::BadTail);
    }

    let expected = checksum(&buf[4..total - 3]);
    let actual = buf[total - 3];
    if expected != actual {
        return Err(FrameError::BadChecksum { expected, actual });
    }

    if buf[10] != direction.wire_byte() {
        return Err(FrameError::DirectionMismatch);
    }

    let command = u16::from_be_bytes([buf[4], buf[5]]);
    let msg_id = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let mut gw = [0u8; 7];
    gw.copy_from_slice(&buf[11..18]);
    let payload = buf[18..total - 3].to_vec();

    Ok(Frame {
        direction,
        command,
        msg_id,
        gateway_id: GatewayId(gw),
        payload,
    })
}

// ---------------------------------------------------------------------------
// Stream codec
// ---------------------------------------------------------------------------

/// One item out of the stream decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    Bad(BadFrame),
}

/// Stateful stream codec for [`tokio_util::codec::FramedRead`] /
/// [`tokio_util::codec::FramedWrite`].
///
/// Tracks the absolute number of bytes consumed so [`BadFrame::position`]
/// points into the stream, not the current buffer.
#[derive(Debug, Default)]
pub struct BkvCodec {
    consumed: u64,
}

impl BkvCodec {
    fn emit_bad(&mut self, src: &mut BytesMut, kind: BadFrameKind, skip: usize) -> Decoded {
        let bad = BadFrame {
            kind,
            position: self.consumed,
        };
        self.consumed += skip as u64;
        src.advance(skip);
        Decoded::Bad(bad)
    }
}

/// Find the offset of the next plausible header in `buf`.
fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| {
        let h = u16::from_be_bytes([w[0], w[1]]);
        h == HEADER_UPLINK || h == HEADER_DOWNLINK
    })
}

impl Decoder for BkvCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, io::Error> {
        loop {
            let Some(start) = find_header(src) else {
                // Keep a trailing 0xFC that might be the first header byte.
                let keep = usize::from(src.last() == Some(&0xFC));
                let drop = src.len() - keep;
                self.consumed += drop as u64;
                src.advance(drop);
                return Ok(None);
            };
            if start > 0 {
                self.consumed += start as u64;
                src.advance(start);
            }
            if src.len() < 4 {
                return Ok(None);
            }

            let declared = u16::from_be_bytes([src[2], src[3]]) as usize;
            if !(FRAME_OVERHEAD..=MAX_DECLARED_LEN).contains(&declared) {
                return Ok(Some(self.emit_bad(src, BadFrameKind::Oversize, 1)));
            }

            let total = 4 + declared;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            match parse_complete(&src[..total]) {
                Ok(frame) => {
                    self.consumed += total as u64;
                    src.advance(total);
                    return Ok(Some(Decoded::Frame(frame)));
                }
                Err(FrameError::BadTail) => {
                    return Ok(Some(self.emit_bad(src, BadFrameKind::Tail, 1)));
                }
                Err(FrameError::BadChecksum { .. }) => {
                    return Ok(Some(self.emit_bad(src, BadFrameKind::Checksum, 1)));
                }
                Err(FrameError::DirectionMismatch) => {
                    // The frame is structurally sound; skip it whole.
                    return Ok(Some(self.emit_bad(src, BadFrameKind::Direction, total)));
                }
                Err(_) => {
                    // Unreachable for a checksum-verified frame; resync anyway.
                    return Ok(Some(self.emit_bad(src, BadFrameKind::Tail, 1)));
                }
            }
        }
    }
}

impl Encoder<Frame> for BkvCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let bytes = frame
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gw() -> GatewayId {
        GatewayId::parse("82241218000382").unwrap()
    }

    fn sample_frame() -> Frame {
        Frame::uplink(0x1000, 0x0000_0042, gw(), vec![0x01, 0x04, 0x00, 0x81, 0x00, 0xF0])
    }

    fn decode_all(bytes: &[u8]) -> Vec<Decoded> {
        let mut codec = BkvCodec::default();
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn roundtrip() {
        let frame = sample_frame();
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
        assert_eq!(decode_all(&bytes), vec![Decoded::Frame(frame)]);
    }

    #[test]
    fn declared_length_covers_command_through_tail() {
        let bytes = sample_frame().to_bytes().unwrap();
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!(declared, bytes.len() - 4);
        assert_eq!(declared, FRAME_OVERHEAD + 6);
    }

    #[test]
    fn empty_payload_is_valid() {
        let frame = Frame::uplink(0x0000, 7, gw(), Vec::new());
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes.len(), 4 + FRAME_OVERHEAD);
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn decoder_suspends_on_partial_input() {
        let bytes = sample_frame().to_bytes().unwrap();
        let mut codec = BkvCodec::default();
        // Feed all but the last byte: nothing must come out.
        let mut partial = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Decoded::Frame(sample_frame()))
        );
    }

    #[test]
    fn decoder_skips_garbage_before_header() {
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend_from_slice(&sample_frame().to_bytes().unwrap());
        assert_eq!(decode_all(&bytes), vec![Decoded::Frame(sample_frame())]);
    }

    #[test]
    fn corrupt_checksum_resyncs_to_following_frame() {
        let mut first = sample_frame().to_bytes().unwrap();
        let payload_at = first.len() - 4;
        first[payload_at] ^= 0xFF;
        let second = sample_frame().to_bytes().unwrap();
        let mut stream = first;
        stream.extend_from_slice(&second);

        let items = decode_all(&stream);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            Decoded::Bad(BadFrame {
                kind: BadFrameKind::Checksum,
                position: 0
            })
        );
        assert_eq!(items[1], Decoded::Frame(sample_frame()));
    }

    #[test]
    fn bad_frame_position_is_absolute_in_the_stream() {
        let good = sample_frame().to_bytes().unwrap();
        let mut corrupt = good.clone();
        let payload_at = corrupt.len() - 4;
        corrupt[payload_at] ^= 0x55;
        let mut stream = good.clone();
        stream.extend_from_slice(&corrupt);

        let items = decode_all(&stream);
        assert_eq!(items[0], Decoded::Frame(sample_frame()));
        assert_eq!(
            items[1],
            Decoded::Bad(BadFrame {
                kind: BadFrameKind::Checksum,
                position: good.len() as u64
            })
        );
    }

    #[test]
    fn max_declared_length_suspends_for_the_full_frame() {
        // The length field tops out one byte under the 64 KiB limit, so a
        // maximal declared length is legal and the decoder waits for it.
        let mut bytes = sample_frame().to_bytes().unwrap();
        bytes[2] = 0xFF;
        bytes[3] = 0xFF;
        let mut codec = BkvCodec::default();
        let mut buf = BytesMut::from(bytes.as_slice());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.capacity() >= 4 + 0xFFFF);
    }

    #[test]
    fn undersize_declared_length_is_rejected() {
        let mut bytes = sample_frame().to_bytes().unwrap();
        bytes[2] = 0x00;
        bytes[3] = (FRAME_OVERHEAD - 1) as u8;
        let items = decode_all(&bytes);
        assert!(matches!(
            items[0],
            Decoded::Bad(BadFrame {
                kind: BadFrameKind::Oversize,
                ..
            })
        ));
    }

    #[test]
    fn declared_length_off_by_one_is_a_bad_frame() {
        for delta in [-1i32, 1] {
            let mut bytes = sample_frame().to_bytes().unwrap();
            let declared = u16::from_be_bytes([bytes[2], bytes[3]]);
            let skewed = (i32::from(declared) + delta) as u16;
            bytes[2..4].copy_from_slice(&skewed.to_be_bytes());
            // Pad so the decoder has enough bytes either way.
            bytes.push(0x00);
            let items = decode_all(&bytes);
            assert!(
                items
                    .iter()
                    .all(|item| !matches!(item, Decoded::Frame(f) if *f == sample_frame())),
                "skewed declared length {delta:+} must not decode"
            );
            assert!(
                items.iter().any(|item| matches!(item, Decoded::Bad(_))),
                "skewed declared length {delta:+} must report a bad frame"
            );
        }
    }

    #[test]
    fn direction_byte_must_match_header() {
        let mut bytes = sample_frame().to_bytes().unwrap();
        // Flip the direction byte and fix the checksum so only the
        // direction check can fail.
        bytes[10] = Direction::Downlink.wire_byte();
        let total = bytes.len();
        let fixed = checksum(&bytes[4..total - 3]);
        bytes[total - 3] = fixed;
        let items = decode_all(&bytes);
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Decoded::Bad(BadFrame {
                kind: BadFrameKind::Direction,
                ..
            })
        ));
    }

    #[test]
    fn any_single_byte_corruption_is_rejected() {
        let original = sample_frame();
        let bytes = original.to_bytes().unwrap();
        for i in 0..bytes.len() {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0x20;
            let items = decode_all(&corrupt);
            assert!(
                items
                    .iter()
                    .all(|item| !matches!(item, Decoded::Frame(f) if *f == original)),
                "corruption at byte {i} still decoded the original frame"
            );
        }
    }

    #[test]
    fn encoder_never_mutates_the_payload() {
        let payload = vec![0xAA, 0xBB, 0xCC];
        let frame = Frame::downlink(0x0015, 1, gw(), payload.clone());
        let _ = frame.to_bytes().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn gateway_id_roundtrip() {
        let id = GatewayId::parse("86004459453005").unwrap();
        assert_eq!(id.to_string(), "86004459453005");
        assert!(GatewayId::parse("8600445945300").is_err());
        assert!(GatewayId::parse("86004459453005aa").is_err());
        assert!(GatewayId::parse("8600445945300g").is_err());
    }

    #[test]
    fn from_bytes_rejects_trailing_bytes() {
        let mut bytes = sample_frame().to_bytes().unwrap();
        bytes.push(0x00);
        assert_eq!(Frame::from_bytes(&bytes), Err(FrameError::TrailingBytes));
    }
}
