//! Inner payload shapes.
//!
//! Which shape applies is dictated by the outer `command`:
//!
//! - `0x0015` (control) and `0x001D` (query) carry fixed-width blocks
//!   prefixed by a 2-byte parameter-length field;
//! - `0x0005` (network configure) carries a channel byte followed by
//!   `[socket 1B][mac 6B]` records;
//! - everything else is a `[tag 1B][len 1B][value]` sequence.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload truncated")]
    Truncated,
    #[error("unexpected parameter length {0}")]
    BadParamLen(u16),
    #[error("unexpected subcommand {0:#04x}")]
    BadSubcommand(u8),
    #[error("missing tag {0:#04x}")]
    MissingTag(u8),
    #[error("bad value for tag {0:#04x}")]
    BadValue(u8),
    #[error("trailing bytes after payload")]
    TrailingBytes,
}

// ---------------------------------------------------------------------------
// Control block (0x0015)
// ---------------------------------------------------------------------------

pub const CONTROL_SUBCOMMAND: u8 = 0x07;

/// Downlink switch command for one jack of one socket.
///
/// Layout: `[param_len=8 2B][0x07 1B][socket 1B][jack 1B][switch 1B]
/// [mode 1B][duration_min 2B][energy_0p01 2B]`. The subcommand byte is not
/// counted by `param_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub socket_no: u8,
    pub jack_no: u8,
    pub switch_on: bool,
    pub mode: u8,
    pub duration_min: u16,
    pub energy_0p01: u16,
}

impl ControlBlock {
    const PARAM_LEN: u16 = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11);
        out.extend_from_slice(&Self::PARAM_LEN.to_be_bytes());
        out.push(CONTROL_SUBCOMMAND);
        out.push(self.socket_no);
        out.push(self.jack_no);
        out.push(u8::from(self.switch_on));
        out.push(self.mode);
        out.extend_from_slice(&self.duration_min.to_be_bytes());
        out.extend_from_slice(&self.energy_0p01.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<ControlBlock, PayloadError> {
        if buf.len() < 11 {
            return Err(PayloadError::Truncated);
        }
        if buf.len() > 11 {
            return Err(PayloadError::TrailingBytes);
        }
        let param_len = u16::from_be_bytes([buf[0], buf[1]]);
        if param_len != Self::PARAM_LEN {
            return Err(PayloadError::BadParamLen(param_len));
        }
        if buf[2] != CONTROL_SUBCOMMAND {
            return Err(PayloadError::BadSubcommand(buf[2]));
        }
        Ok(ControlBlock {
            socket_no: buf[3],
            jack_no: buf[4],
            switch_on: buf[5] != 0,
            mode: buf[6],
            duration_min: u16::from_be_bytes([buf[7], buf[8]]),
            energy_0p01: u16::from_be_bytes([buf[9], buf[10]]),
        })
    }
}

/// Uplink acknowledgement of a control block.
///
/// Layout: `[param_len=3 2B][0x07 1B][socket 1B][result 1B]`.
/// Result `0` means the switch was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlAck {
    pub socket_no: u8,
    pub result: u8,
}

impl ControlAck {
    const PARAM_LEN: u16 = 3;

    pub fn success(&self) -> bool {
        self.result == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.extend_from_slice(&Self::PARAM_LEN.to_be_bytes());
        out.push(CONTROL_SUBCOMMAND);
        out.push(self.socket_no);
        out.push(self.result);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<ControlAck, PayloadError> {
        if buf.len() != 5 {
            return Err(PayloadError::Truncated);
        }
        let param_len = u16::from_be_bytes([buf[0], buf[1]]);
        if param_len != Self::PARAM_LEN {
            return Err(PayloadError::BadParamLen(param_len));
        }
        if buf[2] != CONTROL_SUBCOMMAND {
            return Err(PayloadError::BadSubcommand(buf[2]));
        }
        Ok(ControlAck {
            socket_no: buf[3],
            result: buf[4],
        })
    }
}

// ---------------------------------------------------------------------------
// Query socket (0x001D)
// ---------------------------------------------------------------------------

/// Downlink request for a status report of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySocket {
    pub socket_no: u8,
}

impl QuerySocket {
    pub fn encode(&self) -> Vec<u8> {
        vec![0x00, 0x01, self.socket_no]
    }

    pub fn decode(buf: &[u8]) -> Result<QuerySocket, PayloadError> {
        if buf.len() != 3 {
            return Err(PayloadError::Truncated);
        }
        let param_len = u16::from_be_bytes([buf[0], buf[1]]);
        if param_len != 1 {
            return Err(PayloadError::BadParamLen(param_len));
        }
        Ok(QuerySocket { socket_no: buf[2] })
    }
}

// ---------------------------------------------------------------------------
// Network configure (0x0005)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkNode {
    pub socket_no: u8,
    pub mac: [u8; 6],
}

/// Downlink mesh configuration: radio channel plus socket/MAC records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub channel: u8,
    pub nodes: Vec<NetworkNode>,
}

impl NetworkConfig {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.nodes.len() * 7);
        out.push(self.channel);
        for node in &self.nodes {
            out.push(node.socket_no);
            out.extend_from_slice(&node.mac);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<NetworkConfig, PayloadError> {
        let (channel, mut rest) = buf.split_first().ok_or(PayloadError::Truncated)?;
        let mut nodes = Vec::new();
        while !rest.is_empty() {
            if rest.len() < 7 {
                return Err(PayloadError::Truncated);
            }
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&rest[1..7]);
            nodes.push(NetworkNode {
                socket_no: rest[0],
                mac,
            });
            rest = &rest[7..];
        }
        Ok(NetworkConfig {
            channel: *channel,
            nodes,
        })
    }
}

// ---------------------------------------------------------------------------
// TLV
// ---------------------------------------------------------------------------

/// One `[tag 1B][len 1B][value]` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: u8,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tag: u8, value: Vec<u8>) -> Tlv {
        Tlv { tag, value }
    }

    pub fn u8(tag: u8, v: u8) -> Tlv {
        Tlv::new(tag, vec![v])
    }

    pub fn u16(tag: u8, v: u16) -> Tlv {
        Tlv::new(tag, v.to_be_bytes().to_vec())
    }

    pub fn u32(tag: u8, v: u32) -> Tlv {
        Tlv::new(tag, v.to_be_bytes().to_vec())
    }

    pub fn str(tag: u8, v: &str) -> Tlv {
        Tlv::new(tag, v.as_bytes().to_vec())
    }
}

impl fmt::Display for Tlv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tlv({:#04x}, {} bytes)", self.tag, self.value.len())
    }
}

pub fn parse_tlvs(mut buf: &[u8]) -> Result<Vec<Tlv>, PayloadError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 2 {
            return Err(PayloadError::Truncated);
        }
        let tag = buf[0];
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(PayloadError::Truncated);
        }
        out.push(Tlv::new(tag, buf[2..2 + len].to_vec()));
        buf = &buf[2 + len..];
    }
    Ok(out)
}

pub fn encode_tlvs(tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::new();
    for tlv in tlvs {
        out.push(tlv.tag);
        out.push(tlv.value.len() as u8);
        out.extend_from_slice(&tlv.value);
    }
    out
}

fn find<'a>(tlvs: &'a [Tlv], tag: u8) -> Option<&'a Tlv> {
    tlvs.iter().find(|t| t.tag == tag)
}

fn get_u8(tlvs: &[Tlv], tag: u8) -> Result<u8, PayloadError> {
    let tlv = find(tlvs, tag).ok_or(PayloadError::MissingTag(tag))?;
    match tlv.value.as_slice() {
        [v] => Ok(*v),
        _ => Err(PayloadError::BadValue(tag)),
    }
}

fn get_u16(tlvs: &[Tlv], tag: u8) -> Result<u16, PayloadError> {
    let tlv = find(tlvs, tag).ok_or(PayloadError::MissingTag(tag))?;
    match tlv.value.as_slice() {
        [a, b] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(PayloadError::BadValue(tag)),
    }
}

fn get_u32(tlvs: &[Tlv], tag: u8) -> Result<u32, PayloadError> {
    let tlv = find(tlvs, tag).ok_or(PayloadError::MissingTag(tag))?;
    match tlv.value.as_slice() {
        [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(PayloadError::BadValue(tag)),
    }
}

fn get_str(tlvs: &[Tlv], tag: u8) -> Result<String, PayloadError> {
    let tlv = find(tlvs, tag).ok_or(PayloadError::MissingTag(tag))?;
    String::from_utf8(tlv.value.clone()).map_err(|_| PayloadError::BadValue(tag))
}

// ---------------------------------------------------------------------------
// Status report (0x1000)
// ---------------------------------------------------------------------------

/// One per-port entry of a status report: tag `0x01`, value
/// `[port_no][status_bits][power_w 2B]`. Unknown tags are skipped so firmware
/// can add fields without breaking older platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortReading {
    pub port_no: u8,
    pub status_bits: u8,
    pub power_w: u16,
}

pub const TAG_PORT_READING: u8 = 0x01;

pub fn decode_status_report(buf: &[u8]) -> Result<Vec<PortReading>, PayloadError> {
    let tlvs = parse_tlvs(buf)?;
    let mut out = Vec::new();
    for tlv in &tlvs {
        if tlv.tag != TAG_PORT_READING {
            continue;
        }
        match tlv.value.as_slice() {
            [port_no, status_bits, hi, lo] => out.push(PortReading {
                port_no: *port_no,
                status_bits: *status_bits,
                power_w: u16::from_be_bytes([*hi, *lo]),
            }),
            _ => return Err(PayloadError::BadValue(TAG_PORT_READING)),
        }
    }
    Ok(out)
}

pub fn encode_status_report(readings: &[PortReading]) -> Vec<u8> {
    let tlvs: Vec<Tlv> = readings
        .iter()
        .map(|r| {
            let mut value = vec![r.port_no, r.status_bits];
            value.extend_from_slice(&r.power_w.to_be_bytes());
            Tlv::new(TAG_PORT_READING, value)
        })
        .collect();
    encode_tlvs(&tlvs)
}

// ---------------------------------------------------------------------------
// Settlement (0x0016)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleReason {
    /// The charge ran to its natural end (duration/energy target or full).
    Completed,
    /// The charge was cut short (stop command or local action).
    Stopped,
}

impl SettleReason {
    pub fn from_wire(v: u8) -> Result<SettleReason, PayloadError> {
        match v {
            1 => Ok(SettleReason::Completed),
            2 => Ok(SettleReason::Stopped),
            _ => Err(PayloadError::BadValue(tags::settlement::REASON)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            SettleReason::Completed => 1,
            SettleReason::Stopped => 2,
        }
    }
}

/// Device-initiated end-of-charge report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub business_no: u16,
    pub socket_no: u8,
    pub reason: SettleReason,
    pub kwh_0p01: u32,
    pub duration_min: u16,
    /// Compatibility path: newer firmware echoes the full order number.
    pub order_no: Option<String>,
}

pub mod tags {
    pub mod settlement {
        pub const BUSINESS_NO: u8 = 0x01;
        pub const SOCKET_NO: u8 = 0x02;
        pub const REASON: u8 = 0x03;
        pub const KWH_0P01: u8 = 0x04;
        pub const DURATION_MIN: u8 = 0x05;
        pub const ORDER_NO: u8 = 0x06;
    }
    pub mod register {
        pub const FIRMWARE: u8 = 0x01;
        pub const SOCKET_COUNT: u8 = 0x02;
    }
    pub mod alarm {
        pub const SOCKET_NO: u8 = 0x01;
        pub const CODE: u8 = 0x02;
    }
    pub mod ota {
        pub const URL: u8 = 0x01;
        pub const VERSION: u8 = 0x02;
        pub const MD5: u8 = 0x03;
        pub const SIZE: u8 = 0x04;
        pub const TARGET_TYPE: u8 = 0x05;
        pub const TARGET_SOCKET: u8 = 0x06;
    }
    pub mod ota_progress {
        pub const PROGRESS: u8 = 0x01;
        pub const STATUS: u8 = 0x02;
    }
    pub mod ack {
        pub const RESULT: u8 = 0x01;
    }
}

impl Settlement {
    pub fn encode(&self) -> Vec<u8> {
        use tags::settlement as t;
        let mut tlvs = vec![
            Tlv::u16(t::BUSINESS_NO, self.business_no),
            Tlv::u8(t::SOCKET_NO, self.socket_no),
            Tlv::u8(t::REASON, self.reason.to_wire()),
            Tlv::u32(t::KWH_0P01, self.kwh_0p01),
            Tlv::u16(t::DURATION_MIN, self.duration_min),
        ];
        if let Some(order_no) = &self.order_no {
            tlvs.push(Tlv::str(t::ORDER_NO, order_no));
        }
        encode_tlvs(&tlvs)
    }

    pub fn decode(buf: &[u8]) -> Result<Settlement, PayloadError> {
        use tags::settlement as t;
        let tlvs = parse_tlvs(buf)?;
        Ok(Settlement {
            business_no: get_u16(&tlvs, t::BUSINESS_NO)?,
            socket_no: get_u8(&tlvs, t::SOCKET_NO)?,
            reason: SettleReason::from_wire(get_u8(&tlvs, t::REASON)?)?,
            kwh_0p01: get_u32(&tlvs, t::KWH_0P01)?,
            duration_min: get_u16(&tlvs, t::DURATION_MIN)?,
            order_no: match find(&tlvs, t::ORDER_NO) {
                Some(_) => Some(get_str(&tlvs, t::ORDER_NO)?),
                None => None,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Register (0x0001)
// ---------------------------------------------------------------------------

/// First frame after a device boots: firmware version and socket count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub firmware: String,
    pub socket_count: u8,
}

impl Register {
    pub fn encode(&self) -> Vec<u8> {
        use tags::register as t;
        encode_tlvs(&[
            Tlv::str(t::FIRMWARE, &self.firmware),
            Tlv::u8(t::SOCKET_COUNT, self.socket_count),
        ])
    }

    pub fn decode(buf: &[u8]) -> Result<Register, PayloadError> {
        use tags::register as t;
        let tlvs = parse_tlvs(buf)?;
        Ok(Register {
            firmware: get_str(&tlvs, t::FIRMWARE)?,
            socket_count: get_u8(&tlvs, t::SOCKET_COUNT)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Alarm (0x0017)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alarm {
    pub socket_no: u8,
    pub code: u8,
}

impl Alarm {
    pub fn encode(&self) -> Vec<u8> {
        use tags::alarm as t;
        encode_tlvs(&[
            Tlv::u8(t::SOCKET_NO, self.socket_no),
            Tlv::u8(t::CODE, self.code),
        ])
    }

    pub fn decode(buf: &[u8]) -> Result<Alarm, PayloadError> {
        use tags::alarm as t;
        let tlvs = parse_tlvs(buf)?;
        Ok(Alarm {
            socket_no: get_u8(&tlvs, t::SOCKET_NO)?,
            code: get_u8(&tlvs, t::CODE)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Parameter set (0x0019)
// ---------------------------------------------------------------------------

/// One configuration parameter. The tag is the parameter id itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub id: u8,
    pub value: u32,
}

pub fn encode_param_set(params: &[Param]) -> Vec<u8> {
    let tlvs: Vec<Tlv> = params.iter().map(|p| Tlv::u32(p.id, p.value)).collect();
    encode_tlvs(&tlvs)
}

pub fn decode_param_set(buf: &[u8]) -> Result<Vec<Param>, PayloadError> {
    let tlvs = parse_tlvs(buf)?;
    tlvs.iter()
        .map(|tlv| {
            Ok(Param {
                id: tlv.tag,
                value: get_u32(std::slice::from_ref(tlv), tlv.tag)?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// OTA (0x001A / 0x001B)
// ---------------------------------------------------------------------------

/// Downlink firmware-upgrade trigger. The firmware content is hosted
/// elsewhere; only the URL passes through here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaPush {
    pub url: String,
    pub version: String,
    pub md5: [u8; 16],
    pub size: u32,
    pub target_type: u8,
    pub target_socket: u8,
}

impl OtaPush {
    pub fn encode(&self) -> Vec<u8> {
        use tags::ota as t;
        encode_tlvs(&[
            Tlv::str(t::URL, &self.url),
            Tlv::str(t::VERSION, &self.version),
            Tlv::new(t::MD5, self.md5.to_vec()),
            Tlv::u32(t::SIZE, self.size),
            Tlv::u8(t::TARGET_TYPE, self.target_type),
            Tlv::u8(t::TARGET_SOCKET, self.target_socket),
        ])
    }

    pub fn decode(buf: &[u8]) -> Result<OtaPush, PayloadError> {
        use tags::ota as t;
        let tlvs = parse_tlvs(buf)?;
        let md5_tlv = find(&tlvs, t::MD5).ok_or(PayloadError::MissingTag(t::MD5))?;
        let md5: [u8; 16] = md5_tlv
            .value
            .as_slice()
            .try_into()
            .map_err(|_| PayloadError::BadValue(t::MD5))?;
        Ok(OtaPush {
            url: get_str(&tlvs, t::URL)?,
            version: get_str(&tlvs, t::VERSION)?,
            md5,
            size: get_u32(&tlvs, t::SIZE)?,
            target_type: get_u8(&tlvs, t::TARGET_TYPE)?,
            target_socket: get_u8(&tlvs, t::TARGET_SOCKET)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaProgress {
    pub progress: u8,
    pub status: u8,
}

impl OtaProgress {
    pub fn encode(&self) -> Vec<u8> {
        use tags::ota_progress as t;
        encode_tlvs(&[
            Tlv::u8(t::PROGRESS, self.progress),
            Tlv::u8(t::STATUS, self.status),
        ])
    }

    pub fn decode(buf: &[u8]) -> Result<OtaProgress, PayloadError> {
        use tags::ota_progress as t;
        let tlvs = parse_tlvs(buf)?;
        Ok(OtaProgress {
            progress: get_u8(&tlvs, t::PROGRESS)?,
            status: get_u8(&tlvs, t::STATUS)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Generic command acknowledgement
// ---------------------------------------------------------------------------

/// Uplink reply to parameter/OTA/network downlinks: tag `0x01` with a result
/// byte, `0` on success. A missing result tag counts as success: early
/// firmware acks with an empty payload.
pub fn decode_generic_ack(buf: &[u8]) -> Result<u8, PayloadError> {
    let tlvs = parse_tlvs(buf)?;
    match find(&tlvs, tags::ack::RESULT) {
        Some(_) => get_u8(&tlvs, tags::ack::RESULT),
        None => Ok(0),
    }
}

pub fn encode_generic_ack(result: u8) -> Vec<u8> {
    encode_tlvs(&[Tlv::u8(tags::ack::RESULT, result)])
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_wire_shape() {
        let block = ControlBlock {
            socket_no: 2,
            jack_no: 0,
            switch_on: true,
            mode: 1,
            duration_min: 240,
            energy_0p01: 0,
        };
        let bytes = block.encode();
        assert_eq!(
            bytes,
            vec![0x00, 0x08, 0x07, 0x02, 0x00, 0x01, 0x01, 0x00, 0xF0, 0x00, 0x00]
        );
        assert_eq!(ControlBlock::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn control_block_rejects_bad_param_len() {
        let mut bytes = ControlBlock {
            socket_no: 1,
            jack_no: 0,
            switch_on: false,
            mode: 1,
            duration_min: 60,
            energy_0p01: 0,
        }
        .encode();
        bytes[1] = 0x09;
        assert_eq!(
            ControlBlock::decode(&bytes),
            Err(PayloadError::BadParamLen(9))
        );
    }

    #[test]
    fn control_block_rejects_bad_subcommand() {
        let mut bytes = ControlBlock {
            socket_no: 1,
            jack_no: 0,
            switch_on: true,
            mode: 2,
            duration_min: 0,
            energy_0p01: 500,
        }
        .encode();
        bytes[2] = 0x06;
        assert_eq!(
            ControlBlock::decode(&bytes),
            Err(PayloadError::BadSubcommand(0x06))
        );
    }

    #[test]
    fn control_ack_roundtrip() {
        let ack = ControlAck {
            socket_no: 3,
            result: 0,
        };
        assert!(ack.success());
        assert_eq!(ControlAck::decode(&ack.encode()).unwrap(), ack);

        let nack = ControlAck {
            socket_no: 3,
            result: 2,
        };
        assert!(!nack.success());
    }

    #[test]
    fn query_socket_wire_shape() {
        let q = QuerySocket { socket_no: 5 };
        assert_eq!(q.encode(), vec![0x00, 0x01, 0x05]);
        assert_eq!(QuerySocket::decode(&q.encode()).unwrap(), q);
    }

    #[test]
    fn network_config_roundtrip() {
        let cfg = NetworkConfig {
            channel: 11,
            nodes: vec![
                NetworkNode {
                    socket_no: 0,
                    mac: [0xAA, 0xBB, 0xCC, 0x00, 0x01, 0x02],
                },
                NetworkNode {
                    socket_no: 1,
                    mac: [0xAA, 0xBB, 0xCC, 0x00, 0x01, 0x03],
                },
            ],
        };
        assert_eq!(NetworkConfig::decode(&cfg.encode()).unwrap(), cfg);
    }

    #[test]
    fn network_config_rejects_partial_record() {
        let mut bytes = NetworkConfig {
            channel: 1,
            nodes: vec![NetworkNode {
                socket_no: 0,
                mac: [0; 6],
            }],
        }
        .encode();
        bytes.pop();
        assert_eq!(NetworkConfig::decode(&bytes), Err(PayloadError::Truncated));
    }

    #[test]
    fn tlv_parse_rejects_truncated_value() {
        assert_eq!(parse_tlvs(&[0x01, 0x03, 0xAA]), Err(PayloadError::Truncated));
        assert_eq!(parse_tlvs(&[0x01]), Err(PayloadError::Truncated));
    }

    #[test]
    fn status_report_skips_unknown_tags() {
        let mut bytes = encode_status_report(&[PortReading {
            port_no: 1,
            status_bits: 0x81,
            power_w: 1200,
        }]);
        bytes.extend_from_slice(&[0x7F, 0x02, 0x00, 0x00]);
        let readings = decode_status_report(&bytes).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].power_w, 1200);
    }

    #[test]
    fn status_report_rejects_short_reading() {
        let bytes = encode_tlvs(&[Tlv::new(TAG_PORT_READING, vec![1, 0x81])]);
        assert_eq!(
            decode_status_report(&bytes),
            Err(PayloadError::BadValue(TAG_PORT_READING))
        );
    }

    #[test]
    fn settlement_roundtrip_with_and_without_order_no() {
        let base = Settlement {
            business_no: 0x00C8,
            socket_no: 2,
            reason: SettleReason::Completed,
            kwh_0p01: 153,
            duration_min: 240,
            order_no: None,
        };
        assert_eq!(Settlement::decode(&base.encode()).unwrap(), base);

        let with_order = Settlement {
            order_no: Some("THD1700000000001".to_owned()),
            reason: SettleReason::Stopped,
            ..base.clone()
        };
        assert_eq!(Settlement::decode(&with_order.encode()).unwrap(), with_order);
    }

    #[test]
    fn settlement_rejects_unknown_reason() {
        let mut s = Settlement {
            business_no: 1,
            socket_no: 0,
            reason: SettleReason::Completed,
            kwh_0p01: 0,
            duration_min: 0,
            order_no: None,
        }
        .encode();
        // Reason is the third TLV: tag, len, value triplets of 2+2, 2+1, 2+1.
        let reason_value_at = 4 + 3 + 2;
        assert_eq!(s[reason_value_at], 1);
        s[reason_value_at] = 9;
        assert_eq!(
            Settlement::decode(&s),
            Err(PayloadError::BadValue(tags::settlement::REASON))
        );
    }

    #[test]
    fn param_set_roundtrip() {
        let params = vec![
            Param { id: 0x10, value: 3600 },
            Param { id: 0x11, value: 1 },
        ];
        assert_eq!(decode_param_set(&encode_param_set(&params)).unwrap(), params);
    }

    #[test]
    fn ota_push_roundtrip() {
        let push = OtaPush {
            url: "https://firmware.example/v2.bin".to_owned(),
            version: "2.1.0".to_owned(),
            md5: [0x11; 16],
            size: 524_288,
            target_type: 1,
            target_socket: 0,
        };
        assert_eq!(OtaPush::decode(&push.encode()).unwrap(), push);
    }

    #[test]
    fn ota_push_rejects_short_md5() {
        let mut push = OtaPush {
            url: "u".to_owned(),
            version: "v".to_owned(),
            md5: [0; 16],
            size: 1,
            target_type: 2,
            target_socket: 1,
        }
        .encode();
        // Shrink the md5 TLV by rewriting its declared length.
        let md5_len_at = push
            .iter()
            .position(|&b| b == tags::ota::MD5)
            .map(|i| i + 1)
            .unwrap();
        push[md5_len_at] = 15;
        push.remove(md5_len_at + 16);
        assert_eq!(
            OtaPush::decode(&push),
            Err(PayloadError::BadValue(tags::ota::MD5))
        );
    }

    #[test]
    fn generic_ack_defaults_to_success_on_empty_payload() {
        assert_eq!(decode_generic_ack(&[]).unwrap(), 0);
        assert_eq!(decode_generic_ack(&encode_generic_ack(4)).unwrap(), 4);
    }
}
