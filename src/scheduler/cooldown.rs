use std::time::Duration;

use crate::orchestrator::DetectionPolicy;

/// Platform-wide cool-down after detections.
///
/// The n-th consecutive detection waits `min(base * 2^(n-1), ceiling)`.
/// A successful submission resets the streak.
#[derive(Debug, Clone)]
pub struct CoolDownTracker {
    base: Duration,
    ceiling: Duration,
    streak: u32,
}

impl CoolDownTracker {
    pub fn new(policy: DetectionPolicy) -> Self {
        Self {
            base: policy.cooldown_base,
            ceiling: policy.cooldown_ceiling,
            streak: 0,
        }
    }

    /// Count a detection and return how long the platform should cool down.
    pub fn record_detection(&mut self) -> Duration {
        self.streak = self.streak.saturating_add(1);
        let factor = 2u32.saturating_pow(self.streak - 1);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}
