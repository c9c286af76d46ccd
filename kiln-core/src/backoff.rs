//! Bounded exponential backoff with jitter, as an explicit state machine.
//!
//! The machine never sleeps on its own. Callers feed it the elapsed time and
//! get back either the next delay or `Exhausted`, which keeps cancellation
//! and testing in the caller's hands.
//!
//! ```text
//! Waiting(attempt, next_delay) ── next_step(elapsed) ──→ Wait(delay) ↺
//!                                       │
//!                               budget spent
//!                                       ↓
//!                                  Exhausted
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor applied after every retry.
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay.
    pub max: Duration,
    /// Relative jitter, e.g. 0.05 for ±5%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            multiplier: 1.5,
            max: Duration::from_secs(1),
            jitter: 0.05,
        }
    }
}

impl BackoffPolicy {
    /// A fixed-interval policy without jitter.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            multiplier: 1.0,
            max: interval,
            jitter: 0.0,
        }
    }

    /// Start a backoff run bounded by `budget`, seeded from the OS.
    pub fn start(&self, budget: Duration) -> Backoff {
        Backoff::new(self.clone(), budget, StdRng::from_os_rng())
    }

    /// Start a backoff run with a deterministic jitter sequence.
    pub fn start_seeded(&self, budget: Duration, seed: u64) -> Backoff {
        Backoff::new(self.clone(), budget, StdRng::seed_from_u64(seed))
    }
}

/// Outcome of asking the machine what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep for this long, then try again.
    Wait(Duration),
    /// The budget is spent; stop retrying.
    Exhausted,
}

/// One in-progress backoff run.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    budget: Duration,
    attempt: u32,
    next_delay: Duration,
    rng: StdRng,
}

impl Backoff {
    fn new(policy: BackoffPolicy, budget: Duration, rng: StdRng) -> Self {
        let next_delay = policy.initial.min(policy.max);
        Self {
            policy,
            budget,
            attempt: 0,
            next_delay,
            rng,
        }
    }

    /// Number of waits handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Total budget for this run.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Un-jittered delay the next `Wait` will be based on.
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Advance the machine given the time already spent in this run.
    ///
    /// A returned wait never extends past the budget.
    pub fn next_step(&mut self, elapsed: Duration) -> BackoffStep {
        let Some(remaining) = self.budget.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
            return BackoffStep::Exhausted;
        };

        let delay = self.jittered(self.next_delay).min(remaining);

        let grown = scale(self.next_delay, self.policy.multiplier.max(1.0));
        self.next_delay = grown.min(self.policy.max);
        self.attempt += 1;

        BackoffStep::Wait(delay)
    }

    fn jittered(&mut self, delay: Duration) -> Duration {
        // NaN would pass the clamp and poison the sampled range.
        let jitter = if self.policy.jitter.is_finite() {
            self.policy.jitter.clamp(0.0, 0.99)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + self.rng.random_range(-jitter..=jitter);
        scale(delay, factor)
    }
}

/// Scale a duration in integer nanoseconds so repeated growth stays exact.
fn scale(delay: Duration, factor: f64) -> Duration {
    let nanos = (delay.as_nanos() as f64 * factor).round();
    Duration::from_nanos(nanos.min(u64::MAX as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = no_jitter().start(Duration::from_secs(60));
        let mut delays = Vec::new();
        for _ in 0..6 {
            match backoff.next_step(Duration::ZERO) {
                BackoffStep::Wait(d) => delays.push(d.as_millis()),
                BackoffStep::Exhausted => panic!("budget should not be exhausted"),
            }
        }
        assert_eq!(delays, vec![200, 300, 450, 675, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_exhausted_when_budget_spent() {
        let mut backoff = no_jitter().start(Duration::from_secs(1));
        assert_eq!(
            backoff.next_step(Duration::from_secs(1)),
            BackoffStep::Exhausted
        );
        assert_eq!(
            backoff.next_step(Duration::from_secs(5)),
            BackoffStep::Exhausted
        );
    }

    #[test]
    fn test_wait_clamped_to_remaining_budget() {
        let mut backoff = no_jitter().start(Duration::from_millis(250));
        assert_eq!(
            backoff.next_step(Duration::from_millis(100)),
            BackoffStep::Wait(Duration::from_millis(150))
        );
    }

    #[test]
    fn test_non_finite_jitter_is_ignored() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = BackoffPolicy {
                jitter,
                ..BackoffPolicy::default()
            };
            let mut backoff = policy.start_seeded(Duration::from_secs(60), 3);
            assert_eq!(
                backoff.next_step(Duration::ZERO),
                BackoffStep::Wait(Duration::from_millis(200))
            );
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        let mut backoff = policy.start_seeded(Duration::from_secs(600), 7);
        for _ in 0..50 {
            let base = backoff.next_delay();
            match backoff.next_step(Duration::ZERO) {
                BackoffStep::Wait(d) => {
                    let (d, base) = (d.as_nanos() as f64, base.as_nanos() as f64);
                    assert!(d >= base * 0.95 - 1.0 && d <= base * 1.05 + 1.0);
                }
                BackoffStep::Exhausted => panic!("budget should not be exhausted"),
            }
        }
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let policy = BackoffPolicy::default();
        let mut a = policy.start_seeded(Duration::from_secs(10), 42);
        let mut b = policy.start_seeded(Duration::from_secs(10), 42);
        for _ in 0..5 {
            assert_eq!(a.next_step(Duration::ZERO), b.next_step(Duration::ZERO));
        }
    }

    #[test]
    fn test_fixed_policy() {
        let mut backoff = BackoffPolicy::fixed(Duration::from_millis(50)).start(Duration::from_secs(1));
        for _ in 0..3 {
            assert_eq!(
                backoff.next_step(Duration::ZERO),
                BackoffStep::Wait(Duration::from_millis(50))
            );
        }
    }
}
