//! Reconnect delay policy
//!
//! The first attempt after a connection is lost happens immediately. Later
//! attempts wait `100ms * 2^(attempt - 1)`, capped at 30 seconds, with up to
//! 20% jitter in either direction so a fleet of clients does not reconnect in
//! lockstep after a broker restart.

use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_millis(100);
pub const MAX_DELAY: Duration = Duration::from_secs(30);
pub const JITTER: f64 = 0.2;

/// Delay before reconnect attempt number `attempt` (0-based)
pub fn exponential_backoff(attempt: u32) -> Duration {
    let base = capped_delay(attempt);
    if base.is_zero() {
        return base;
    }
    let factor = 1.0 + JITTER * (rand::random::<f64>() * 2.0 - 1.0);
    base.mul_f64(factor)
}

/// The un-jittered delay for `attempt`
pub fn capped_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    // 2^9 * 100ms already exceeds the cap
    let exponent = (attempt - 1).min(16);
    BASE_DELAY.saturating_mul(1u32 << exponent).min(MAX_DELAY)
}
