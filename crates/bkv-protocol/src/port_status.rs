//! Port status byte decode.
//!
//! The status byte is a bitmap: bit0 = online, bit3 = idle, bit7 = charging;
//! the remaining bits are reserved. Precedence is a contract, highest first:
//! bit7 set → charging; bit0 clear → fault; otherwise idle.

pub const BIT_ONLINE: u8 = 0x01;
pub const BIT_IDLE: u8 = 0x08;
pub const BIT_CHARGING: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Charging,
    Fault,
    Idle,
}

impl PortState {
    pub fn label(self) -> &'static str {
        match self {
            PortState::Charging => "charging",
            PortState::Fault => "fault",
            PortState::Idle => "idle",
        }
    }
}

/// Decode a raw status byte into the business-facing port state.
pub fn classify(status_bits: u8) -> PortState {
    if status_bits & BIT_CHARGING != 0 {
        PortState::Charging
    } else if status_bits & BIT_ONLINE == 0 {
        PortState::Fault
    } else {
        PortState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_boundaries() {
        assert_eq!(classify(0xFF), PortState::Charging);
        assert_eq!(classify(0x00), PortState::Fault);
        assert_eq!(classify(0x09), PortState::Idle);
        // Charging wins even when the online bit is clear.
        assert_eq!(classify(0x80), PortState::Charging);
    }

    #[test]
    fn online_without_idle_bit_is_still_idle() {
        assert_eq!(classify(0x01), PortState::Idle);
    }
}
