//! Disk provider adapters
//!
//! - Simulated: in-memory disks and attachments with per-node LUN
//!   allocation, used in standalone mode and by the test fixtures

pub mod simulated;

pub use simulated::{SimulatedConfig, SimulatedProvisioner};

/// Bytes per GiB; providers allocate whole GiB
pub const GIB: i64 = 1 << 30;

/// Round a byte count up to whole GiB, at least one
pub fn round_up_gib(bytes: i64) -> i64 {
    let gib = (bytes.max(1) + GIB - 1) / GIB;
    gib * GIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_gib() {
        assert_eq!(round_up_gib(0), GIB);
        assert_eq!(round_up_gib(1), GIB);
        assert_eq!(round_up_gib(GIB), GIB);
        assert_eq!(round_up_gib(GIB + 1), 2 * GIB);
    }
}
