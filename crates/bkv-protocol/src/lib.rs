//! Wire protocol for BKV charging-socket gateways.
//!
//! A gateway device speaks a length-delimited binary protocol over a
//! long-lived TCP connection. The outer frame carries a command code, a
//! message id, a direction marker and a packed gateway identity; the inner
//! payload is either a fixed-layout block or a tag-length-value sequence,
//! keyed by the command. This crate is pure codec: it owns the byte-level
//! contract and nothing else.

pub mod business;
pub mod command;
pub mod frame;
pub mod payload;
pub mod port_status;

pub use frame::{
    BadFrame, BadFrameKind, BkvCodec, Decoded, Direction, Frame, FrameError, GatewayId,
};
