use rand::Rng;
use std::time::Duration;

/// Exponential backoff for the `attempt`-th retry (1-based), capped at `max`, with the upper
/// half randomised so concurrent retries spread out.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let raw = base.saturating_mul(1u32 << exp).min(max);
    let half = raw / 2;
    let jitter_ms = half.as_millis() as u64;
    if jitter_ms == 0 {
        return raw;
    }
    half + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
