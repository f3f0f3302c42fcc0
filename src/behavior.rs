//! Randomized interaction timing.
//!
//! [`BehaviorSimulator`] turns an [`ActionKind`] into a [`TimingPlan`]: a
//! sequence of delays and motions an adapter replays while it drives a page.
//! The simulator is stateless; all variation comes from the random source, so
//! two plans for the same action are never meant to be equal.
//!
//! # Distributions
//!
//! - **Keystrokes**: log-normal (mostly quick, occasionally slow), clamped
//! - **Reading**: words-per-minute drawn uniformly, scaled by a jitter factor
//! - **Scrolling**: bursts of steps separated by pauses
//! - **Pointer paths**: short random walks with per-point delays

use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, LogNormal};
use serde::{Deserialize, Serialize};

/// Tuning knobs for the simulator. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_keystroke_mean_ms")]
    pub keystroke_mean_ms: f64,
    #[serde(default = "default_keystroke_stddev_ms")]
    pub keystroke_stddev_ms: f64,
    #[serde(default = "default_keystroke_min_ms")]
    pub keystroke_min_ms: f64,
    #[serde(default = "default_keystroke_max_ms")]
    pub keystroke_max_ms: f64,
    /// Chance that a keystroke is followed by a longer "thinking" pause.
    #[serde(default = "default_thinking_pause_probability")]
    pub thinking_pause_probability: f64,
    #[serde(default = "default_min_pause_ms")]
    pub min_pause_ms: f64,
    #[serde(default = "default_max_pause_ms")]
    pub max_pause_ms: f64,
    #[serde(default = "default_wpm_min")]
    pub wpm_min: f64,
    #[serde(default = "default_wpm_max")]
    pub wpm_max: f64,
    #[serde(default = "default_max_reading_ms")]
    pub max_reading_ms: f64,
    #[serde(default = "default_warmup_min_ms")]
    pub warmup_min_ms: f64,
    #[serde(default = "default_warmup_max_ms")]
    pub warmup_max_ms: f64,
}

fn default_keystroke_mean_ms() -> f64 {
    120.0
}

fn default_keystroke_stddev_ms() -> f64 {
    45.0
}

fn default_keystroke_min_ms() -> f64 {
    40.0
}

fn default_keystroke_max_ms() -> f64 {
    450.0
}

fn default_thinking_pause_probability() -> f64 {
    0.08
}

fn default_min_pause_ms() -> f64 {
    150.0
}

fn default_max_pause_ms() -> f64 {
    2_500.0
}

fn default_wpm_min() -> f64 {
    200.0
}

fn default_wpm_max() -> f64 {
    300.0
}

fn default_max_reading_ms() -> f64 {
    45_000.0
}

fn default_warmup_min_ms() -> f64 {
    500.0
}

fn default_warmup_max_ms() -> f64 {
    2_000.0
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            keystroke_mean_ms: default_keystroke_mean_ms(),
            keystroke_stddev_ms: default_keystroke_stddev_ms(),
            keystroke_min_ms: default_keystroke_min_ms(),
            keystroke_max_ms: default_keystroke_max_ms(),
            thinking_pause_probability: default_thinking_pause_probability(),
            min_pause_ms: default_min_pause_ms(),
            max_pause_ms: default_max_pause_ms(),
            wpm_min: default_wpm_min(),
            wpm_max: default_wpm_max(),
            max_reading_ms: default_max_reading_ms(),
            warmup_min_ms: default_warmup_min_ms(),
            warmup_max_ms: default_warmup_max_ms(),
        }
    }
}

impl BehaviorConfig {
    /// Zero-delay configuration for offline runs.
    pub fn instant() -> Self {
        Self {
            keystroke_min_ms: 0.0,
            keystroke_max_ms: 0.0,
            min_pause_ms: 0.0,
            max_pause_ms: 0.0,
            max_reading_ms: 0.0,
            warmup_min_ms: 0.0,
            warmup_max_ms: 0.0,
            ..Self::default()
        }
    }

    /// Smallest and largest delay any plan may contain.
    pub fn delay_bounds(&self) -> (Duration, Duration) {
        let lo = self.keystroke_min_ms.min(self.min_pause_ms);
        let hi = self
            .keystroke_max_ms
            .max(self.max_pause_ms)
            .max(self.max_reading_ms);
        (ms(lo), ms(hi))
    }

    pub fn validate(&self) -> Result<(), String> {
        let ranges = [
            ("keystroke", self.keystroke_min_ms, self.keystroke_max_ms),
            ("pause", self.min_pause_ms, self.max_pause_ms),
            ("wpm", self.wpm_min, self.wpm_max),
            ("warmup", self.warmup_min_ms, self.warmup_max_ms),
        ];
        for (name, lo, hi) in ranges {
            if !(lo >= 0.0 && lo <= hi) {
                return Err(format!("behavior {name} range is invalid: {lo}..{hi}"));
            }
        }
        if self.wpm_min <= 0.0 {
            return Err("behavior wpm_min must be positive".into());
        }
        if self.keystroke_mean_ms <= 0.0 || self.keystroke_stddev_ms <= 0.0 {
            return Err("keystroke mean and stddev must be positive".into());
        }
        if self.max_reading_ms < self.min_pause_ms {
            return Err("max_reading_ms must be at least min_pause_ms".into());
        }
        if !(0.0..=1.0).contains(&self.thinking_pause_probability) {
            return Err("thinking_pause_probability must be within [0, 1]".into());
        }
        Ok(())
    }
}

/// Form field category, used to pick a hesitation range before typing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Name,
    Email,
    Phone,
    Experience,
    Salary,
    CoverLetter,
    #[default]
    Other,
}

impl FieldKind {
    // Hesitation range in milliseconds.
    fn hesitation_ms(self) -> (f64, f64) {
        match self {
            FieldKind::Name => (100.0, 500.0),
            FieldKind::Email => (200.0, 800.0),
            FieldKind::Phone => (300.0, 1_000.0),
            FieldKind::Experience => (500.0, 2_000.0),
            FieldKind::Salary => (1_000.0, 3_000.0),
            FieldKind::CoverLetter => (2_000.0, 8_000.0),
            FieldKind::Other => (200.0, 1_000.0),
        }
    }
}

/// What the adapter is about to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Navigate,
    Type { chars: usize, field: FieldKind },
    Scroll { distance_px: u32 },
    Click,
    Idle { content_chars: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Motion {
    Settle,
    Hesitate,
    Keystroke,
    ThinkingPause,
    Scroll { dy: i32 },
    PointerMove { dx: i32, dy: i32 },
    Click,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanStep {
    pub delay: Duration,
    pub motion: Motion,
}

/// A replayable sequence of timed motions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimingPlan {
    pub action: ActionKind,
    pub steps: Vec<PlanStep>,
}

impl TimingPlan {
    pub fn total(&self) -> Duration {
        self.steps.iter().map(|s| s.delay).sum()
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.steps.iter().map(|s| s.delay)
    }

    /// Sleep through every step on the async runtime.
    pub async fn perform(&self) {
        for step in &self.steps {
            tokio::time::sleep(step.delay).await;
        }
    }
}

/// Pure generator of [`TimingPlan`]s.
#[derive(Debug, Clone)]
pub struct BehaviorSimulator {
    config: BehaviorConfig,
    // None only for degenerate parameters; falls back to uniform.
    keystrokes: Option<LogNormal<f64>>,
}

impl BehaviorSimulator {
    pub fn new(config: BehaviorConfig) -> Self {
        // mean = exp(mu + sigma^2/2), var = (exp(sigma^2) - 1) * exp(2mu + sigma^2)
        let mean = config.keystroke_mean_ms.max(1.0);
        let variance = (config.keystroke_stddev_ms * config.keystroke_stddev_ms).max(0.1);
        let sigma_sq = (1.0 + variance / (mean * mean)).ln();
        let mu = mean.ln() - sigma_sq / 2.0;
        let keystrokes = LogNormal::new(mu, sigma_sq.sqrt()).ok();
        Self { config, keystrokes }
    }

    pub fn config(&self) -> &BehaviorConfig {
        &self.config
    }

    /// Plan an action using the thread-local random source.
    pub fn plan(&self, action: ActionKind) -> TimingPlan {
        self.plan_with(&mut rand::rng(), action)
    }

    pub fn plan_with<R: Rng + ?Sized>(&self, rng: &mut R, action: ActionKind) -> TimingPlan {
        let steps = match action {
            ActionKind::Navigate => self.navigate(rng),
            ActionKind::Type { chars, field } => self.typing(rng, chars, field),
            ActionKind::Scroll { distance_px } => self.scrolling(rng, distance_px),
            ActionKind::Click => self.click(rng),
            ActionKind::Idle { content_chars } => self.reading(rng, content_chars),
        };
        TimingPlan { action, steps }
    }

    /// Jittered delay applied when a new session is brought up.
    pub fn warmup_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        uniform_ms(rng, self.config.warmup_min_ms, self.config.warmup_max_ms)
    }

    fn pause<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        uniform_ms(rng, self.config.min_pause_ms, self.config.max_pause_ms)
    }

    fn short_pause<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let span = self.config.max_pause_ms - self.config.min_pause_ms;
        let hi = self.config.min_pause_ms + span * 0.25;
        uniform_ms(rng, self.config.min_pause_ms, hi)
    }

    fn flat_keystroke<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        uniform_ms(rng, self.config.keystroke_min_ms, self.config.keystroke_max_ms)
    }

    fn keystroke<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match &self.keystrokes {
            Some(dist) => {
                let raw = dist.sample(rng);
                ms(raw.clamp(self.config.keystroke_min_ms, self.config.keystroke_max_ms))
            }
            None => self.flat_keystroke(rng),
        }
    }

    fn pointer_path<R: Rng + ?Sized>(&self, rng: &mut R, steps: &mut Vec<PlanStep>, spread: i32) {
        let points = rng.random_range(3..=10);
        for _ in 0..points {
            steps.push(PlanStep {
                delay: self.flat_keystroke(rng),
                motion: Motion::PointerMove {
                    dx: rng.random_range(-spread..=spread),
                    dy: rng.random_range(-spread..=spread),
                },
            });
        }
    }

    fn navigate<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<PlanStep> {
        let mut steps = vec![PlanStep {
            delay: self.pause(rng),
            motion: Motion::Settle,
        }];
        let drifts = rng.random_range(1..=3);
        for _ in 0..drifts {
            steps.push(PlanStep {
                delay: self.short_pause(rng),
                motion: Motion::PointerMove {
                    dx: rng.random_range(-50..=50),
                    dy: rng.random_range(-30..=30),
                },
            });
        }
        steps
    }

    fn typing<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        chars: usize,
        field: FieldKind,
    ) -> Vec<PlanStep> {
        let (lo, hi) = field.hesitation_ms();
        let lo = lo.clamp(self.config.min_pause_ms, self.config.max_pause_ms);
        let hi = hi.clamp(lo, self.config.max_pause_ms);
        let mut steps = Vec::with_capacity(chars + 4);
        steps.push(PlanStep {
            delay: uniform_ms(rng, lo, hi),
            motion: Motion::Hesitate,
        });
        // Always at least one keystroke so the plan carries keystroke jitter.
        for _ in 0..chars.max(1) {
            steps.push(PlanStep {
                delay: self.keystroke(rng),
                motion: Motion::Keystroke,
            });
            if rng.random_bool(self.config.thinking_pause_probability) {
                steps.push(PlanStep {
                    delay: self.pause(rng),
                    motion: Motion::ThinkingPause,
                });
            }
        }
        steps
    }

    fn scrolling<R: Rng + ?Sized>(&self, rng: &mut R, distance_px: u32) -> Vec<PlanStep> {
        let mut steps = Vec::new();
        let mut remaining = i64::from(distance_px.max(1));
        while remaining > 0 {
            let burst = rng.random_range(2..=8);
            for _ in 0..burst {
                let down = rng.random_bool(0.8);
                let amount: i32 = if down {
                    rng.random_range(80..=300)
                } else {
                    -rng.random_range(50..=150)
                };
                remaining -= i64::from(amount);
                steps.push(PlanStep {
                    delay: self.flat_keystroke(rng),
                    motion: Motion::Scroll { dy: amount },
                });
                if remaining <= 0 {
                    break;
                }
            }
            steps.push(PlanStep {
                delay: self.pause(rng),
                motion: Motion::Read,
            });
        }
        steps
    }

    fn click<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<PlanStep> {
        let mut steps = Vec::new();
        self.pointer_path(rng, &mut steps, 200);
        steps.push(PlanStep {
            delay: self.short_pause(rng),
            motion: Motion::Hesitate,
        });
        steps.push(PlanStep {
            delay: self.flat_keystroke(rng),
            motion: Motion::Click,
        });
        steps
    }

    fn reading<R: Rng + ?Sized>(&self, rng: &mut R, content_chars: usize) -> Vec<PlanStep> {
        let words = (content_chars as f64 / 5.0).max(1.0);
        let wpm = rng.random_range(self.config.wpm_min..=self.config.wpm_max);
        let jitter = rng.random_range(0.7..=1.5);
        let total_ms = (words / wpm * 60_000.0 * jitter)
            .clamp(self.config.min_pause_ms, self.config.max_reading_ms);

        // Split into reading chunks separated by small scrolls.
        let chunks = ((total_ms / self.config.max_pause_ms.max(1.0)).ceil() as usize).max(1);
        let mut steps = Vec::with_capacity(chunks * 2);
        let mut left = total_ms;
        for i in 0..chunks {
            let share = if i + 1 == chunks {
                left
            } else {
                let even = left / (chunks - i) as f64;
                (even * rng.random_range(0.8..=1.2)).min(left)
            };
            left -= share;
            steps.push(PlanStep {
                delay: ms(share.clamp(self.config.min_pause_ms, self.config.max_reading_ms)),
                motion: Motion::Read,
            });
            if i + 1 < chunks {
                steps.push(PlanStep {
                    delay: self.flat_keystroke(rng),
                    motion: Motion::Scroll {
                        dy: rng.random_range(100..=300),
                    },
                });
            }
        }
        steps.push(PlanStep {
            delay: self.short_pause(rng),
            motion: Motion::PointerMove {
                dx: rng.random_range(-50..=50),
                dy: rng.random_range(-30..=30),
            },
        });
        steps
    }
}

impl Default for BehaviorSimulator {
    fn default() -> Self {
        Self::new(BehaviorConfig::default())
    }
}

fn ms(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0) / 1000.0)
}

fn uniform_ms<R: Rng + ?Sized>(rng: &mut R, lo: f64, hi: f64) -> Duration {
    if hi <= lo {
        return ms(lo);
    }
    ms(rng.random_range(lo..=hi))
}
