//! Named counters and gauges.
//!
//! One factory builds (and describes) every series at startup; components
//! receive the struct and call the method for the series they own. The
//! exporter is whoever installs a `metrics` recorder; this module only
//! emits.

use bkv_protocol::frame::BadFrameKind;
use metrics::{
    counter, describe_counter, describe_gauge, gauge, Counter, Gauge,
};

use crate::orders::OrderStatus;

#[derive(Clone)]
pub struct Metrics {
    checksum_errors: Counter,
    heartbeats: Counter,
    online: Gauge,
    outbound_ack_timeouts: Counter,
}

impl Metrics {
    pub fn new() -> Metrics {
        describe_counter!("frames_decoded", "Frames decoded, by command");
        describe_counter!("bad_frames", "Rejected frames, by kind");
        describe_counter!("checksum_errors", "Frames dropped for a bad checksum");
        describe_counter!("heartbeats", "Heartbeat frames received");
        describe_gauge!("online_gauge", "Devices currently online");
        describe_counter!("outbound_enqueue", "Outbound messages enqueued, by priority");
        describe_counter!("outbound_ack_timeout", "Outbound messages that timed out waiting for an ACK");
        describe_counter!("order_transitions", "Order state transitions, by from/to");
        describe_counter!("reconciler_rows", "Rows affected per reconciler sweep");
        describe_counter!("event_push", "Webhook push attempts, by result");
        describe_counter!("session_offline", "Connections closed, by cause");
        describe_counter!("unknown_commands", "Frames with an unregistered command");
        describe_counter!("handler_errors", "Handler failures, by command");

        Metrics {
            checksum_errors: counter!("checksum_errors"),
            heartbeats: counter!("heartbeats"),
            online: gauge!("online_gauge"),
            outbound_ack_timeouts: counter!("outbound_ack_timeout"),
        }
    }

    pub fn frame_decoded(&self, command: u16) {
        counter!("frames_decoded", "command" => bkv_protocol::command::name(command)).increment(1);
    }

    pub fn bad_frame(&self, kind: BadFrameKind) {
        counter!("bad_frames", "kind" => kind.label()).increment(1);
        if kind == BadFrameKind::Checksum {
            self.checksum_errors.increment(1);
        }
    }

    pub fn heartbeat(&self) {
        self.heartbeats.increment(1);
    }

    pub fn online(&self, count: usize) {
        self.online.set(count as f64);
    }

    pub fn outbound_enqueued(&self, priority: i32) {
        counter!("outbound_enqueue", "priority" => priority.to_string()).increment(1);
    }

    pub fn outbound_ack_timeout(&self) {
        self.outbound_ack_timeouts.increment(1);
    }

    pub fn order_transition(&self, from: OrderStatus, to: OrderStatus) {
        counter!("order_transitions", "from" => from.label(), "to" => to.label()).increment(1);
    }

    pub fn reconciler_rows(&self, sweep: &'static str, rows: u64) {
        if rows > 0 {
            counter!("reconciler_rows", "sweep" => sweep).increment(rows);
        }
    }

    pub fn event_push(&self, result: &'static str) {
        counter!("event_push", "result" => result).increment(1);
    }

    pub fn session_offline(&self, cause: &'static str) {
        counter!("session_offline", "cause" => cause).increment(1);
    }

    pub fn unknown_command(&self, command: u16) {
        counter!("unknown_commands", "command" => format!("{command:#06x}")).increment(1);
    }

    pub fn handler_error(&self, command: u16) {
        counter!("handler_errors", "command" => bkv_protocol::command::name(command)).increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}
