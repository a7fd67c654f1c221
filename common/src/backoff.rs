use std::time::Duration;

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub fn full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1);

    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/// Fixed linear backoff: `base * attempts`, no jitter. Used for pod creation
/// retries, where a predictable cadence matters more than contention
/// avoidance across replicas (there's only ever one active replica).
pub fn linear(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(attempts.max(1))
}

/// Applies up to `pct` percent of symmetric jitter around `d`. Used for
/// periodic work (e.g. the status logger) that wants to avoid lockstep
/// across process restarts without needing full exponential backoff.
pub fn jittered(d: Duration, pct: f64) -> Duration {
    let ms = d.as_millis() as f64;
    let spread = ms * pct.clamp(0.0, 1.0);
    let offset = rand::random_range(-spread..=spread);
    Duration::from_millis((ms + offset).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jitter_respects_cap() {
        let cap = Duration::from_secs(10);
        for attempt in 0..20 {
            let d = full_jitter(Duration::from_millis(250), cap, attempt);
            assert!(d <= cap);
        }
    }

    #[test]
    fn linear_scales_with_attempts() {
        let base = Duration::from_millis(250);
        assert_eq!(linear(base, 1), Duration::from_millis(250));
        assert_eq!(linear(base, 4), Duration::from_millis(1000));
    }

    #[test]
    fn jittered_stays_within_bounds() {
        let d = Duration::from_secs(1);
        for _ in 0..20 {
            let j = jittered(d, 0.2);
            assert!(j >= Duration::from_millis(800));
            assert!(j <= Duration::from_millis(1200));
        }
    }
}
