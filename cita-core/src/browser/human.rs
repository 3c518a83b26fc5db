use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::sleep;

use crate::config::HumanSection;

/// Randomised pauses that keep interactions from firing at machine cadence.
#[derive(Debug, Clone)]
pub struct HumanPacer {
    config: HumanSection,
}

impl HumanPacer {
    pub fn new(config: HumanSection) -> Self {
        Self { config }
    }

    /// Pause between two field interactions.
    pub async fn pause(&self) {
        sleep(self.random_duration(self.config.pause_ms)).await;
    }

    /// Short pause after clearing an input and before typing into it.
    pub async fn keystroke_pause(&self) {
        sleep(self.random_duration(self.config.keystroke_pause_ms)).await;
    }

    /// Dwell on a control before committing the click.
    pub async fn hover(&self) {
        if self.config.hover_ms > 0 {
            sleep(Duration::from_millis(self.config.hover_ms)).await;
        }
    }

    fn random_duration(&self, bounds: [u64; 2]) -> Duration {
        let lower = bounds[0].min(bounds[1]);
        let upper = bounds[0].max(bounds[1]);
        Duration::from_millis(thread_rng().gen_range(lower..=upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_duration_tolerates_reversed_bounds() {
        let pacer = HumanPacer::new(HumanSection {
            pause_ms: [900, 100],
            keystroke_pause_ms: [0, 0],
            hover_ms: 0,
        });
        for _ in 0..32 {
            let delay = pacer.random_duration([900, 100]);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(900));
        }
        assert_eq!(pacer.random_duration([0, 0]), Duration::ZERO);
    }
}
