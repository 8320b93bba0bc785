use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

/// Exponential backoff with jitter (spec §4.5):
/// `delay = min(backoff_max, base * 2^attempt) * (1 + U[0, jitter_ratio])`
///
/// `attempt` is the post-increment attempts count (1 on the first retry
/// after the initial attempt failed, per spec §4.5).
pub fn backoff_delay_seconds(
    attempt: i32,
    base_seconds: f64,
    max_seconds: f64,
    jitter_ratio: f64,
) -> f64 {
    let exp = base_seconds * 2f64.powi(attempt.max(0));
    let capped = exp.min(max_seconds);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..=jitter_ratio.max(0.0));
    capped * (1.0 + jitter)
}

pub fn next_retry_at(
    now: DateTime<Utc>,
    attempt: i32,
    base_seconds: f64,
    max_seconds: f64,
    jitter_ratio: f64,
) -> DateTime<Utc> {
    let delay = backoff_delay_seconds(attempt, base_seconds, max_seconds, jitter_ratio);
    now + ChronoDuration::milliseconds((delay * 1000.0) as i64)
}

/// Whether a job that just failed its `attempts`-th try should be retried
/// or routed to the DLQ. A job that was cancelled is never retried
/// regardless of attempts remaining.
pub fn should_retry(attempts: i32, max_attempts: i32, was_cancelled: bool) -> bool {
    !was_cancelled && attempts < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_respects_cap() {
        let d0 = backoff_delay_seconds(0, 1.0, 3600.0, 0.0);
        let d1 = backoff_delay_seconds(1, 1.0, 3600.0, 0.0);
        let d2 = backoff_delay_seconds(2, 1.0, 3600.0, 0.0);
        assert_eq!(d0, 1.0);
        assert_eq!(d1, 2.0);
        assert_eq!(d2, 4.0);

        let capped = backoff_delay_seconds(20, 1.0, 3600.0, 0.0);
        assert_eq!(capped, 3600.0);
    }

    #[test]
    fn jitter_never_reduces_delay_below_base() {
        for attempt in 0..5 {
            let d = backoff_delay_seconds(attempt, 2.0, 3600.0, 0.5);
            let floor = 2.0 * 2f64.powi(attempt);
            assert!(d >= floor.min(3600.0));
        }
    }

    #[test]
    fn retry_stops_at_max_attempts() {
        assert!(should_retry(1, 3, false));
        assert!(should_retry(2, 3, false));
        assert!(!should_retry(3, 3, false));
    }

    #[test]
    fn cancelled_jobs_never_retry() {
        assert!(!should_retry(1, 5, true));
    }
}
