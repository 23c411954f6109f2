//! Command codes and their classification.

pub const HEARTBEAT: u16 = 0x0000;
pub const REGISTER: u16 = 0x0001;
pub const NETWORK_CONFIG: u16 = 0x0005;
pub const CONTROL: u16 = 0x0015;
pub const SETTLEMENT: u16 = 0x0016;
pub const ALARM: u16 = 0x0017;
pub const PARAM_SET: u16 = 0x0019;
pub const OTA_PUSH: u16 = 0x001A;
pub const OTA_PROGRESS: u16 = 0x001B;
pub const QUERY_SOCKET: u16 = 0x001D;
pub const STATUS_REPORT: u16 = 0x1000;

/// Commands whose arrival counts as proof of life for the device.
pub fn is_heartbeat_bearing(command: u16) -> bool {
    matches!(command, HEARTBEAT | STATUS_REPORT | REGISTER)
}

/// Short name for logs and metric labels.
pub fn name(command: u16) -> &'static str {
    match command {
        HEARTBEAT => "heartbeat",
        REGISTER => "register",
        NETWORK_CONFIG => "network_config",
        CONTROL => "control",
        SETTLEMENT => "settlement",
        ALARM => "alarm",
        PARAM_SET => "param_set",
        OTA_PUSH => "ota_push",
        OTA_PROGRESS => "ota_progress",
        QUERY_SOCKET => "query_socket",
        STATUS_REPORT => "status_report",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_bearing_commands() {
        assert!(is_heartbeat_bearing(HEARTBEAT));
        assert!(is_heartbeat_bearing(STATUS_REPORT));
        assert!(is_heartbeat_bearing(REGISTER));
        assert!(!is_heartbeat_bearing(CONTROL));
        assert!(!is_heartbeat_bearing(SETTLEMENT));
        assert!(!is_heartbeat_bearing(0x7777));
    }
}
