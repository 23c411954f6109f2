//! Conformance fixtures for the wire contract.
//!
//! These vectors are the cross-implementation contract: a frame built from
//! the given fields must serialise to exactly these bytes, and the bytes must
//! decode back to the same fields.

use bkv_protocol::command;
use bkv_protocol::frame::{Frame, GatewayId};
use bkv_protocol::payload::{ControlBlock, QuerySocket};

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn bytes_of(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

/// Start-charge downlink: socket 2, jack A, by-duration, 240 minutes,
/// business number 0x9A51 carried in the low half of the msg_id.
const START_CHARGE_240MIN: &str =
    "fcff001c0015001c9a5100860044594530050008070200010100f00000bcfcee";

/// Empty-payload heartbeat uplink from gateway 82241218000382.
const HEARTBEAT: &str = "fcfe0011000000000001018224121800038257fcee";

/// Single-socket status query downlink.
const QUERY_SOCKET_2: &str = "fcff0014001d000000c9008600445945300500010286fcee";

#[test]
fn start_charge_frame_encodes_to_fixture() {
    let block = ControlBlock {
        socket_no: 2,
        jack_no: 0,
        switch_on: true,
        mode: 1,
        duration_min: 240,
        energy_0p01: 0,
    };
    let frame = Frame::downlink(
        command::CONTROL,
        0x001C_9A51,
        GatewayId::parse("86004459453005").unwrap(),
        block.encode(),
    );
    assert_eq!(hex_of(&frame.to_bytes().unwrap()), START_CHARGE_240MIN);
}

#[test]
fn start_charge_fixture_decodes_to_fields() {
    let frame = Frame::from_bytes(&bytes_of(START_CHARGE_240MIN)).unwrap();
    assert_eq!(frame.command, command::CONTROL);
    assert_eq!(frame.msg_id, 0x001C_9A51);
    assert_eq!(frame.gateway_id.to_string(), "86004459453005");

    let block = ControlBlock::decode(&frame.payload).unwrap();
    assert_eq!(block.socket_no, 2);
    assert_eq!(block.jack_no, 0);
    assert!(block.switch_on);
    assert_eq!(block.mode, 1);
    assert_eq!(block.duration_min, 240);
    assert_eq!(block.energy_0p01, 0);
}

#[test]
fn heartbeat_fixture_roundtrips() {
    let frame = Frame::uplink(
        command::HEARTBEAT,
        1,
        GatewayId::parse("82241218000382").unwrap(),
        Vec::new(),
    );
    assert_eq!(hex_of(&frame.to_bytes().unwrap()), HEARTBEAT);
    assert_eq!(Frame::from_bytes(&bytes_of(HEARTBEAT)).unwrap(), frame);
}

#[test]
fn query_fixture_roundtrips() {
    let frame = Frame::downlink(
        command::QUERY_SOCKET,
        0xC9,
        GatewayId::parse("86004459453005").unwrap(),
        QuerySocket { socket_no: 2 }.encode(),
    );
    let encoded = frame.to_bytes().unwrap();
    assert_eq!(Frame::from_bytes(&encoded).unwrap(), frame);
    assert_eq!(hex_of(&encoded), QUERY_SOCKET_2);
}

#[test]
fn encode_then_decode_equals_identity_for_every_fixture() {
    for fixture in [START_CHARGE_240MIN, HEARTBEAT] {
        let bytes = bytes_of(fixture);
        let frame = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(frame.to_bytes().unwrap(), bytes);
    }
}
