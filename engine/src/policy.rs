use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::key::RegisterKey;

/// Session-wide choice of what an enabled override writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideMode {
    /// Overrides are inert; every write passes through.
    #[default]
    Off,
    /// Write the record's override value.
    Static,
    /// Write a fresh pseudo-random value on every intercepted write.
    RandomPerUpdate,
    /// Write a pseudo-random value that holds for one wall-clock second,
    /// then jumps. Useful for spotting which register moves what on screen
    /// without touching the camera between seconds.
    RandomPerSecond,
}

/// Pseudo-random 16-bit value for the per-second mode, a multiplicative hash
/// over the current second and the key fields. Deterministic within a second
/// and cheap enough for the write path; nothing about it is cryptographic.
#[must_use]
pub fn per_second_value(second: u32, key: RegisterKey) -> u16 {
    let k = second
        .wrapping_mul(123)
        .wrapping_add(u32::from(key.reg()).wrapping_mul(456))
        .wrapping_add(u32::from(key.dst()).wrapping_mul(789))
        .wrapping_add(key.context().wrapping_mul(357));
    (k.wrapping_mul(2_654_435_769) >> 16) as u16
}

/// Picks the replacement value for a record whose override is enabled, or
/// `None` when the firmware's own value should go through. Runs outside the
/// store's critical section; nothing here may block.
#[must_use]
pub fn resolve(
    mode: OverrideMode,
    override_value: i32,
    key: RegisterKey,
    second: u32,
) -> Option<i32> {
    match mode {
        OverrideMode::Off => None,
        OverrideMode::Static => Some(override_value),
        OverrideMode::RandomPerUpdate => Some(rand::thread_rng().gen_range(i32::MIN..=i32::MAX)),
        OverrideMode::RandomPerSecond => Some(i32::from(per_second_value(second, key))),
    }
}
