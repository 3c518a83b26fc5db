use std::time::Duration;

use rand::Rng;

use crate::config::BackoffSection;

/// Decorrelated-jitter backoff applied between rate-limited attempts.
///
/// The first delay is drawn from `[base, 2·base]`; every later one from
/// `[base, 3·previous]`. Both are clamped to `cap`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffState {
    base: f64,
    cap: f64,
    previous: Option<f64>,
}

impl BackoffState {
    pub fn new(base_seconds: f64, cap_seconds: f64) -> Self {
        Self {
            base: base_seconds,
            cap: cap_seconds.max(base_seconds),
            previous: None,
        }
    }

    pub fn from_config(section: &BackoffSection) -> Self {
        Self::new(section.base_seconds, section.cap_seconds)
    }

    /// Seconds slept before the last rate-limited retry, if any.
    pub fn previous(&self) -> Option<f64> {
        self.previous
    }

    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let seconds = match self.previous {
            None => self.base + rng.gen::<f64>() * self.base,
            Some(previous) => {
                let upper = previous * 3.0;
                if upper > self.base {
                    rng.gen_range(self.base..upper)
                } else {
                    self.base
                }
            }
        }
        .min(self.cap);
        self.previous = Some(seconds);
        Duration::from_secs_f64(seconds)
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Fixed jitter window slept after outcomes that are not rate limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoolOff {
    low: f64,
    high: f64,
}

impl CoolOff {
    pub fn new(low_seconds: f64, high_seconds: f64) -> Self {
        Self {
            low: low_seconds.min(high_seconds),
            high: low_seconds.max(high_seconds),
        }
    }

    pub fn from_config(section: &BackoffSection) -> Self {
        let [low, high] = section.cooloff_seconds;
        Self::new(low, high)
    }

    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.high <= self.low {
            return Duration::from_secs_f64(self.low);
        }
        Duration::from_secs_f64(rng.gen_range(self.low..=self.high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn delays_follow_the_decorrelated_recurrence() {
        for seed in 0..32 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut backoff = BackoffState::new(5.0, 600.0);

            let first = backoff.next_delay(&mut rng).as_secs_f64();
            assert!((5.0..=10.0).contains(&first), "first delay {first}");

            let mut previous = first;
            for _ in 0..20 {
                let delay = backoff.next_delay(&mut rng).as_secs_f64();
                assert!(delay >= 5.0, "delay {delay} below base");
                assert!(delay <= (previous * 3.0).min(600.0) + 1e-9, "delay {delay} after {previous}");
                previous = delay;
            }
        }
    }

    #[test]
    fn cap_bounds_every_delay() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let mut backoff = BackoffState::new(8.0, 10.0);
        for _ in 0..50 {
            assert!(backoff.next_delay(&mut rng) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn reset_restarts_from_the_first_window() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut backoff = BackoffState::new(5.0, 600.0);
        for _ in 0..6 {
            backoff.next_delay(&mut rng);
        }
        backoff.reset();
        assert_eq!(backoff.previous(), None);
        let delay = backoff.next_delay(&mut rng).as_secs_f64();
        assert!((5.0..=10.0).contains(&delay));
    }

    #[test]
    fn cooloff_stays_inside_its_window() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let cooloff = CoolOff::new(1.0, 2.5);
        for _ in 0..64 {
            let delay = cooloff.next_delay(&mut rng).as_secs_f64();
            assert!((1.0..=2.5).contains(&delay));
        }
        assert_eq!(CoolOff::new(0.0, 0.0).next_delay(&mut rng), Duration::ZERO);
    }
}
