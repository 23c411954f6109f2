//! Order domain: the status lattice and order-number scheme.

pub mod lifecycle;

use chrono::{DateTime, Utc};

/// The eleven order states. Numeric values are a wire/storage contract and
/// never change; the public name for 7 is `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum OrderStatus {
    Pending = 0,
    Confirmed = 1,
    Charging = 2,
    Completed = 3,
    TimedOut = 4,
    Cancelled = 5,
    Failed = 6,
    Stopped = 7,
    Cancelling = 8,
    Stopping = 9,
    Interrupted = 10,
}

impl OrderStatus {
    /// The reservation set: at most one order per (device, port) may be in
    /// any of these states at a time.
    pub const ACTIVE: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Charging,
        OrderStatus::Cancelling,
        OrderStatus::Stopping,
        OrderStatus::Interrupted,
    ];

    pub const TERMINAL: [OrderStatus; 5] = [
        OrderStatus::Completed,
        OrderStatus::TimedOut,
        OrderStatus::Cancelled,
        OrderStatus::Failed,
        OrderStatus::Stopped,
    ];

    pub fn from_i16(v: i16) -> Option<OrderStatus> {
        match v {
            0 => Some(OrderStatus::Pending),
            1 => Some(OrderStatus::Confirmed),
            2 => Some(OrderStatus::Charging),
            3 => Some(OrderStatus::Completed),
            4 => Some(OrderStatus::TimedOut),
            5 => Some(OrderStatus::Cancelled),
            6 => Some(OrderStatus::Failed),
            7 => Some(OrderStatus::Stopped),
            8 => Some(OrderStatus::Cancelling),
            9 => Some(OrderStatus::Stopping),
            10 => Some(OrderStatus::Interrupted),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn label(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Charging => "charging",
            OrderStatus::Completed => "completed",
            OrderStatus::TimedOut => "timeout",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
            OrderStatus::Stopped => "stopped",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Stopping => "stopping",
            OrderStatus::Interrupted => "interrupted",
        }
    }

    /// Legal source states for a transition into `to`. Everything else is a
    /// contract violation and must be refused by the guarded update.
    pub fn legal_predecessors(to: OrderStatus) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match to {
            Pending => &[],
            Confirmed => &[Pending],
            Charging => &[Confirmed, Interrupted],
            Completed => &[Charging],
            // The confirmed→timeout edge covers orders that acked but never
            // began charging.
            TimedOut => &[Pending, Confirmed],
            Cancelled => &[Cancelling],
            Failed => &[Pending, Interrupted],
            Stopped => &[Stopping, Charging],
            Cancelling => &[Pending],
            Stopping => &[Charging],
            Interrupted => &[Confirmed, Charging],
        }
    }

    pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
        Self::legal_predecessors(to).contains(&from)
    }
}

/// Charge modes carried on the wire and in the order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChargeMode {
    ByDuration = 1,
    ByEnergy = 2,
    ByPower = 3,
    FullThenStop = 4,
}

impl ChargeMode {
    pub fn from_u8(v: u8) -> Option<ChargeMode> {
        match v {
            1 => Some(ChargeMode::ByDuration),
            2 => Some(ChargeMode::ByEnergy),
            3 => Some(ChargeMode::ByPower),
            4 => Some(ChargeMode::FullThenStop),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Order numbers: `THD<unix_seconds><port_no:03>`.
pub fn generate_order_no(now: DateTime<Utc>, port_no: u8) -> String {
    format!("THD{}{:03}", now.timestamp(), port_no)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn numeric_values_are_stable() {
        assert_eq!(OrderStatus::Pending.as_i16(), 0);
        assert_eq!(OrderStatus::Completed.as_i16(), 3);
        assert_eq!(OrderStatus::Stopped.as_i16(), 7);
        assert_eq!(OrderStatus::Interrupted.as_i16(), 10);
        for v in 0..=10 {
            assert_eq!(OrderStatus::from_i16(v).unwrap().as_i16(), v);
        }
        assert!(OrderStatus::from_i16(11).is_none());
        assert!(OrderStatus::from_i16(-1).is_none());
    }

    #[test]
    fn active_and_terminal_partition_all_states() {
        for v in 0..=10 {
            let s = OrderStatus::from_i16(v).unwrap();
            assert_ne!(s.is_active(), s.is_terminal(), "{s:?}");
        }
    }

    #[test]
    fn lattice_matches_the_contract() {
        use OrderStatus::*;
        let legal = [
            (Pending, Confirmed),
            (Confirmed, Charging),
            (Charging, Completed),
            (Charging, Stopping),
            (Stopping, Stopped),
            (Charging, Stopped),
            (Pending, Cancelling),
            (Cancelling, Cancelled),
            (Confirmed, Interrupted),
            (Charging, Interrupted),
            (Interrupted, Charging),
            (Interrupted, Failed),
            (Pending, TimedOut),
            (Confirmed, TimedOut),
            (Pending, Failed),
        ];
        for (from, to) in legal {
            assert!(OrderStatus::can_transition(from, to), "{from:?} -> {to:?}");
        }

        let illegal = [
            (Pending, Charging),
            (Pending, Completed),
            (Completed, Charging),
            (Stopped, Charging),
            (Cancelled, Pending),
            (Charging, Cancelling),
            (Interrupted, Completed),
            (TimedOut, Confirmed),
            (Confirmed, Stopping),
        ];
        for (from, to) in illegal {
            assert!(!OrderStatus::can_transition(from, to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for terminal in OrderStatus::TERMINAL {
            for v in 0..=10 {
                let to = OrderStatus::from_i16(v).unwrap();
                assert!(
                    !OrderStatus::can_transition(terminal, to),
                    "{terminal:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn order_no_shape() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let order_no = generate_order_no(t, 1);
        assert_eq!(order_no, format!("THD{}001", t.timestamp()));
        assert!(order_no.len() <= 32);
    }

    #[test]
    fn charge_mode_roundtrip() {
        for v in 1..=4 {
            assert_eq!(ChargeMode::from_u8(v).unwrap().as_u8(), v);
        }
        assert!(ChargeMode::from_u8(0).is_none());
        assert!(ChargeMode::from_u8(5).is_none());
    }
}
