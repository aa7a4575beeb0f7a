//! The per-iteration fallback ladder over search-direction strategies.
//!
//! Transitions are a pure function of the current rung, so each rule can be
//! tested on its own; [`FallbackState`] merely applies them.

use crate::direction::FallbackLevel;
use crate::options::Options;

/// What happens after a failure at the current rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to a higher level.
    Escalated(FallbackLevel),
    /// Draw another random direction; `attempt` counts from 1.
    RetryRandom { attempt: usize },
    /// Every permitted strategy failed in this iteration.
    Exhausted,
}

/// First rung of an iteration.
///
/// Without steering the steering rungs are skipped, unless the permitted range
/// holds nothing else. In that case levels 0 and 1 compute their steering-free
/// counterparts and the ladder starts at `min` as usual.
pub fn initial_level(min: usize, max: usize, steering_engaged: bool) -> FallbackLevel {
    let start = if skips_steering_rungs(max, steering_engaged) {
        min.max(2)
    } else {
        min
    };
    FallbackLevel::from_index(start).unwrap_or(FallbackLevel::Random)
}

fn skips_steering_rungs(max: usize, steering_engaged: bool) -> bool {
    !steering_engaged && max >= 2
}

/// The transition table.
pub fn transition(
    current: FallbackLevel,
    random_attempts: usize,
    max: usize,
    max_random_attempts: usize,
    steering_engaged: bool,
) -> Transition {
    if current == FallbackLevel::Random {
        return if random_attempts < max_random_attempts {
            Transition::RetryRandom {
                attempt: random_attempts + 1,
            }
        } else {
            Transition::Exhausted
        };
    }
    let mut next = current.index() + 1;
    if skips_steering_rungs(max, steering_engaged) {
        next = next.max(2);
    }
    match FallbackLevel::from_index(next) {
        Some(level) if next <= max => Transition::Escalated(level),
        _ => Transition::Exhausted,
    }
}

/// Fallback position within one outer iteration.
#[derive(Debug, Clone)]
pub struct FallbackState {
    level: FallbackLevel,
    random_attempts: usize,
    max: usize,
    max_random_attempts: usize,
    steering_engaged: bool,
    exhausted: bool,
}

impl FallbackState {
    /// Starts the ladder for a new outer iteration.
    pub fn reset(options: &Options, steering_engaged: bool) -> Self {
        let level = initial_level(
            options.min_fallback_level,
            options.max_fallback_level,
            steering_engaged,
        );
        Self {
            level,
            random_attempts: usize::from(level == FallbackLevel::Random),
            max: options.max_fallback_level,
            max_random_attempts: options.max_random_attempts,
            steering_engaged,
            exhausted: false,
        }
    }

    pub fn level(&self) -> FallbackLevel {
        self.level
    }

    pub fn random_attempts(&self) -> usize {
        self.random_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Records a failure at the current level and moves on.
    pub fn escalate(&mut self) -> Transition {
        if self.exhausted {
            return Transition::Exhausted;
        }
        let step = transition(
            self.level,
            self.random_attempts,
            self.max,
            self.max_random_attempts,
            self.steering_engaged,
        );
        match step {
            Transition::Escalated(level) => {
                log::warn!("[Fallback] escalating from level {} to {}", self.level, level);
                self.level = level;
                if level == FallbackLevel::Random {
                    self.random_attempts = 1;
                }
            }
            Transition::RetryRandom { attempt } => {
                log::debug!(
                    "[Fallback] random direction attempt {}/{}",
                    attempt,
                    self.max_random_attempts
                );
                self.random_attempts = attempt;
            }
            Transition::Exhausted => {
                log::warn!("[Fallback] all permitted levels failed at level {}", self.level);
                self.exhausted = true;
            }
        }
        step
    }
}

#[cfg(test)]
mod tests {
    use super::{FallbackState, Transition, initial_level, transition};
    use crate::direction::FallbackLevel;
    use crate::options::Options;
    use spectral::prelude::*;

    #[test]
    fn initial_level_respects_steering() {
        assert_eq!(initial_level(0, 3, true), FallbackLevel::Steering);
        assert_eq!(initial_level(1, 3, true), FallbackLevel::SteeringIdentity);
        assert_eq!(initial_level(0, 3, false), FallbackLevel::QuasiNewton);
        assert_eq!(initial_level(3, 4, false), FallbackLevel::SteepestDescent);
        // Nothing above the steering rungs is allowed: start at min, where
        // level 0 computes the quasi-Newton direction.
        assert_eq!(initial_level(0, 1, false), FallbackLevel::Steering);
        assert_eq!(initial_level(1, 1, false), FallbackLevel::SteeringIdentity);
        assert_eq!(initial_level(0, 0, false), FallbackLevel::Steering);
    }

    #[test]
    fn escalation_walks_the_ladder() {
        assert_eq!(
            transition(FallbackLevel::Steering, 0, 4, 5, true),
            Transition::Escalated(FallbackLevel::SteeringIdentity)
        );
        assert_eq!(
            transition(FallbackLevel::SteepestDescent, 0, 4, 5, true),
            Transition::Escalated(FallbackLevel::Random)
        );
        assert_eq!(
            transition(FallbackLevel::SteepestDescent, 0, 3, 5, true),
            Transition::Exhausted
        );
        assert_eq!(
            transition(FallbackLevel::Steering, 0, 0, 5, true),
            Transition::Exhausted
        );
    }

    #[test]
    fn unsteered_escalation_skips_steering_rungs() {
        assert_eq!(
            transition(FallbackLevel::Steering, 0, 4, 5, false),
            Transition::Escalated(FallbackLevel::QuasiNewton)
        );
        // Below level 2 the ladder walks 0 -> 1 as usual.
        assert_eq!(
            transition(FallbackLevel::Steering, 0, 1, 5, false),
            Transition::Escalated(FallbackLevel::SteeringIdentity)
        );
        assert_eq!(
            transition(FallbackLevel::SteeringIdentity, 0, 1, 5, false),
            Transition::Exhausted
        );
    }

    #[test]
    fn random_level_retries_then_exhausts() {
        assert_eq!(
            transition(FallbackLevel::Random, 1, 4, 3, false),
            Transition::RetryRandom { attempt: 2 }
        );
        assert_eq!(
            transition(FallbackLevel::Random, 3, 4, 3, false),
            Transition::Exhausted
        );
    }

    #[test]
    fn state_never_exceeds_max_and_counts_random_attempts() {
        let opts = Options::default()
            .with_fallback_levels(1, 4)
            .with_max_random_attempts(2);
        let mut state = FallbackState::reset(&opts, true);
        assert_eq!(state.level(), FallbackLevel::SteeringIdentity);
        let mut seen = vec![state.level()];
        while state.escalate() != Transition::Exhausted {
            seen.push(state.level());
            assert_that(&state.level().index()).is_less_than_or_equal_to(4);
        }
        assert_eq!(
            seen,
            vec![
                FallbackLevel::SteeringIdentity,
                FallbackLevel::QuasiNewton,
                FallbackLevel::SteepestDescent,
                FallbackLevel::Random,
                FallbackLevel::Random,
            ]
        );
        assert_that(&state.random_attempts()).is_equal_to(2);
        assert!(state.is_exhausted());
        assert_eq!(state.escalate(), Transition::Exhausted);
    }

    #[test]
    fn levels_are_monotone_within_an_iteration() {
        let opts = Options::default().with_fallback_levels(0, 4);
        for engaged in [true, false] {
            let mut state = FallbackState::reset(&opts, engaged);
            let mut previous = state.level();
            while state.escalate() != Transition::Exhausted {
                assert!(state.level() >= previous);
                previous = state.level();
            }
        }
    }
}
