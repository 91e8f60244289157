use std::time::Duration;

use rand::Rng;

/// Default exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms,
/// with ±20% jitter. Used for transient durability errors only; tool
/// side effects are never retried on a timer.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << attempt.saturating_sub(1).min(8));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// Truncate to at most `max` characters on a char boundary, appending an
/// ellipsis marker when anything was dropped.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("…");
    out
}
