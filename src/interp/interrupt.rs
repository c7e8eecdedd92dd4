//! Cooperative interruption of an interpretation session.
//!
//! The interpreter polls a policy between transitions; a policy never
//! unwinds or signals, it only answers whether the session should stop.

use std::time::{Duration, Instant};

use super::Configuration;

/// Decides whether an interpretation session should stop.
pub trait InterruptPolicy {
    /// Polled once per transition with the number of transitions
    /// performed so far.
    fn is_interrupted(&mut self, transitions: u64) -> bool;
}

/// Never interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl InterruptPolicy for Never {
    fn is_interrupted(&mut self, _transitions: u64) -> bool {
        false
    }
}

/// Interrupts after a fixed number of transitions.
#[derive(Debug, Clone, Copy)]
pub struct StepBudget {
    budget: u64,
}

impl StepBudget {
    /// A budget of exactly `budget` transitions.
    #[must_use]
    pub const fn new(budget: u64) -> Self {
        Self { budget }
    }

    /// The budget derived from the evaluation factor and the number of
    /// instructions of the interpreted method.
    #[must_use]
    pub fn from_factor(factor: f64, instruction_count: usize) -> Self {
        let budget = (factor * instruction_count as f64).max(1.0) as u64;
        Self { budget }
    }
}

impl InterruptPolicy for StepBudget {
    fn is_interrupted(&mut self, transitions: u64) -> bool {
        transitions >= self.budget
    }
}

/// Interrupts when the wall clock budget is exhausted. The clock is read
/// only every 1000 transitions to amortize its cost.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    limit: Duration,
    started: Option<Instant>,
    exhausted: bool,
}

impl TimeBudget {
    /// The poll interval in transitions.
    const POLL_INTERVAL: u64 = 1000;

    /// A budget of the given wall clock duration, starting at the first
    /// poll.
    #[must_use]
    pub const fn new(limit: Duration) -> Self {
        Self {
            limit,
            started: None,
            exhausted: false,
        }
    }
}

impl InterruptPolicy for TimeBudget {
    fn is_interrupted(&mut self, transitions: u64) -> bool {
        if self.exhausted {
            return true;
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        if transitions % Self::POLL_INTERVAL == 0 {
            self.exhausted = started.elapsed() > self.limit;
        }
        self.exhausted
    }
}

/// Interrupts when either of two policies does. Both policies are always
/// polled, so a clock-based policy keeps its bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct Either<A, B>(pub A, pub B);

impl<A: InterruptPolicy, B: InterruptPolicy> InterruptPolicy for Either<A, B> {
    fn is_interrupted(&mut self, transitions: u64) -> bool {
        let first = self.0.is_interrupted(transitions);
        let second = self.1.is_interrupted(transitions);
        first || second
    }
}

impl InterruptPolicy for Box<dyn InterruptPolicy> {
    fn is_interrupted(&mut self, transitions: u64) -> bool {
        (**self).is_interrupted(transitions)
    }
}

/// The policy a configuration implies for a method with
/// `instruction_count` instructions.
#[must_use]
pub fn policy_for(config: &Configuration, instruction_count: usize) -> Box<dyn InterruptPolicy> {
    let steps = StepBudget::from_factor(config.max_evaluation_factor, instruction_count);
    match config.max_evaluation_time {
        Some(limit) => Box::new(Either(steps, TimeBudget::new(limit))),
        None => Box::new(steps),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn step_budget_interrupts_at_the_boundary() {
        let mut policy = StepBudget::new(3);
        assert!(!policy.is_interrupted(0));
        assert!(!policy.is_interrupted(2));
        assert!(policy.is_interrupted(3));
        assert!(policy.is_interrupted(4));
    }

    #[test]
    fn factor_scales_with_the_instruction_count() {
        let mut policy = StepBudget::from_factor(1.0, 2000);
        assert!(!policy.is_interrupted(1999));
        assert!(policy.is_interrupted(2000));
    }

    #[test]
    fn zero_length_time_budget_interrupts_on_poll() {
        let mut policy = TimeBudget::new(Duration::ZERO);
        // The first poll starts the clock.
        policy.is_interrupted(0);
        std::thread::sleep(Duration::from_millis(1));
        assert!(policy.is_interrupted(1000));
        // Once exhausted the policy stays exhausted.
        assert!(policy.is_interrupted(1001));
    }

    #[test]
    fn either_combines_policies() {
        let mut policy = Either(StepBudget::new(5), Never);
        assert!(!policy.is_interrupted(4));
        assert!(policy.is_interrupted(5));
    }
}
