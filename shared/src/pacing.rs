//! Frame rate pacing.

use std::time::Duration;

/// Longest interval any rate paces to.
pub const MAX_FRAME_INTERVAL: Duration = Duration::from_secs(3600);

/// Nominal interval between frames for `rate` frames per second.
///
/// Non-positive or non-finite rates yield a zero interval (unpaced). Very
/// small rates clamp to [`MAX_FRAME_INTERVAL`].
pub fn frame_interval(rate: f32) -> Duration {
    if !rate.is_finite() || rate <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(1.0 / rate as f64)
        .map_or(MAX_FRAME_INTERVAL, |interval| interval.min(MAX_FRAME_INTERVAL))
}

/// Time left to sleep after spending `elapsed` on one iteration.
///
/// Saturates at zero when the iteration already took longer than the
/// target interval.
pub fn pacing_delay(rate: f32, elapsed: Duration) -> Duration {
    frame_interval(rate).saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_delay_subtracts_work_time() {
        let delay = pacing_delay(10.0, Duration::from_millis(30));
        assert_eq!(delay, Duration::from_millis(70));
    }

    #[test]
    fn test_pacing_delay_saturates() {
        assert_eq!(
            pacing_delay(10.0, Duration::from_millis(250)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_unpaced_rates() {
        assert_eq!(frame_interval(0.0), Duration::ZERO);
        assert_eq!(frame_interval(-5.0), Duration::ZERO);
        assert_eq!(frame_interval(f32::NAN), Duration::ZERO);
        assert_eq!(pacing_delay(0.0, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_frame_interval_fractional_rate() {
        let interval = frame_interval(0.5);
        assert_eq!(interval, Duration::from_secs(2));
    }

    #[test]
    fn test_tiny_rates_clamp() {
        assert_eq!(frame_interval(1e-30), MAX_FRAME_INTERVAL);
        assert_eq!(frame_interval(f32::MIN_POSITIVE), MAX_FRAME_INTERVAL);
        assert_eq!(frame_interval(1e-4), MAX_FRAME_INTERVAL);
        assert_eq!(
            pacing_delay(1e-30, Duration::from_secs(1)),
            MAX_FRAME_INTERVAL - Duration::from_secs(1)
        );
    }
}
