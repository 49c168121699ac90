use std::time::Duration;

/// Delay before retry number `retry_count` (1-based): `base * 2^(retry_count - 1)`.
pub fn exponential_delay(base: Duration, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent)
}

/// Delay before health-check attempt `attempt + 1`: `base * attempt`.
pub fn linear_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.max(1))
}
