//! Business-number derivation.
//!
//! Devices echo a 16-bit token in control acknowledgements and settlement
//! frames. The token is derived deterministically from the order number and
//! must never be zero (zero is the unassigned marker on the wire).

use sha2::{Digest, Sha256};

/// Derive the 16-bit business number for an order number.
pub fn business_no(order_no: &str) -> u16 {
    let digest = Sha256::digest(order_no.as_bytes());
    let n = u16::from_be_bytes([digest[0], digest[1]]);
    if n == 0 { 0x0001 } else { n }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(business_no("THD1700000000001"), business_no("THD1700000000001"));
    }

    #[test]
    fn different_orders_rarely_collide() {
        assert_ne!(business_no("THD1700000000001"), business_no("THD1700000000002"));
    }

    #[test]
    fn never_zero() {
        for i in 0..2000 {
            assert_ne!(business_no(&format!("THD{i}")), 0);
        }
    }
}
