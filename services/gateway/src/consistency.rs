//! Cross-component consistency evaluator.
//!
//! A pure read function combining device presence, port status bits and
//! order status into one business-facing verdict. Rules are evaluated in
//! order; the first match wins.

use bkv_protocol::port_status::PortState;

use crate::orders::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InconsistencyReason {
    OrderActiveButDeviceOffline,
    OrderActiveButPortNotCharging,
    OrderFinalButPortCharging,
}

impl InconsistencyReason {
    pub fn label(self) -> &'static str {
        match self {
            InconsistencyReason::OrderActiveButDeviceOffline => "order_active_but_device_offline",
            InconsistencyReason::OrderActiveButPortNotCharging => {
                "order_active_but_port_not_charging"
            }
            InconsistencyReason::OrderFinalButPortCharging => "order_final_but_port_charging",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Ok,
    Inconsistent(InconsistencyReason),
}

impl Consistency {
    pub fn label(self) -> &'static str {
        match self {
            Consistency::Ok => "ok",
            Consistency::Inconsistent(reason) => reason.label(),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Consistency::Ok
    }
}

pub fn evaluate(
    device_online: bool,
    port_state: PortState,
    order_status: OrderStatus,
) -> Consistency {
    if order_status.is_active() && !device_online {
        return Consistency::Inconsistent(InconsistencyReason::OrderActiveButDeviceOffline);
    }
    if order_status.is_active() && port_state != PortState::Charging {
        return Consistency::Inconsistent(InconsistencyReason::OrderActiveButPortNotCharging);
    }
    if order_status.is_terminal() && port_state == PortState::Charging {
        return Consistency::Inconsistent(InconsistencyReason::OrderFinalButPortCharging);
    }
    Consistency::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_device_wins_over_port_state() {
        let verdict = evaluate(false, PortState::Idle, OrderStatus::Charging);
        assert_eq!(
            verdict,
            Consistency::Inconsistent(InconsistencyReason::OrderActiveButDeviceOffline)
        );
    }

    #[test]
    fn active_order_on_a_non_charging_port() {
        let verdict = evaluate(true, PortState::Idle, OrderStatus::Charging);
        assert_eq!(
            verdict,
            Consistency::Inconsistent(InconsistencyReason::OrderActiveButPortNotCharging)
        );
        let verdict = evaluate(true, PortState::Fault, OrderStatus::Pending);
        assert_eq!(
            verdict,
            Consistency::Inconsistent(InconsistencyReason::OrderActiveButPortNotCharging)
        );
    }

    #[test]
    fn terminal_order_on_a_charging_port() {
        let verdict = evaluate(true, PortState::Charging, OrderStatus::Completed);
        assert_eq!(
            verdict,
            Consistency::Inconsistent(InconsistencyReason::OrderFinalButPortCharging)
        );
    }

    #[test]
    fn consistent_cases() {
        assert!(evaluate(true, PortState::Charging, OrderStatus::Charging).is_ok());
        assert!(evaluate(true, PortState::Idle, OrderStatus::Completed).is_ok());
        assert!(evaluate(false, PortState::Idle, OrderStatus::Stopped).is_ok());
        assert!(evaluate(false, PortState::Fault, OrderStatus::Cancelled).is_ok());
    }

    #[test]
    fn labels_are_the_api_contract() {
        assert_eq!(Consistency::Ok.label(), "ok");
        assert_eq!(
            Consistency::Inconsistent(InconsistencyReason::OrderActiveButDeviceOffline).label(),
            "order_active_but_device_offline"
        );
    }
}
