use std::time::Duration;

use crate::Instant;

/// Time remaining until a value updated at `updated_at` becomes stale, zero
/// if it already is.
pub(crate) fn time_until_stale(updated_at: Instant, stale_time: Duration) -> Duration {
    stale_time.saturating_sub(updated_at.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_stale() {
        let past = Instant(Duration::from_secs(0));
        assert_eq!(time_until_stale(past, Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn not_yet_stale() {
        let now = Instant::now();
        let remaining = time_until_stale(now, Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }
}
