//! Line searches on the penalty function.
//!
//! The default search enforces the weak Wolfe conditions by bracketing: a
//! failed sufficient-decrease test shrinks the upper end of the bracket, a
//! failed curvature test raises the lower end, and the step is bisected once
//! both ends are known or doubled while the upper end is still open. The weak
//! conditions (rather than strong Wolfe) are what make the search usable on
//! nonsmooth functions.

use crate::options::Options;
use crate::penalty::Iterate;
use ndarray::Array1;

/// The outcome of one function evaluation requested by a line search.
#[derive(Debug, Clone)]
pub enum Lookup {
    Evaluated(Iterate),
    /// The evaluation was unusable (malformed output); treated like an infinite value.
    Rejected,
    /// A run-level budget was exhausted before evaluating.
    Stopped,
}

/// A point evaluated along the search direction.
#[derive(Debug, Clone)]
pub struct Trial {
    pub step: f64,
    pub iterate: Iterate,
}

#[derive(Debug, Clone)]
pub struct LineSearchOutcome {
    pub step: f64,
    pub iterate: Iterate,
    pub evaluations: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LineSearchError {
    #[error("no step violating sufficient decrease was found after {evaluations} evaluations; the penalty may be unbounded below")]
    NotBracketed {
        evaluations: usize,
        last: Option<Box<Trial>>,
    },
    #[error("the curvature condition could not be satisfied inside the bracket after {evaluations} evaluations")]
    WolfeNotSatisfied {
        evaluations: usize,
        last: Option<Box<Trial>>,
    },
    #[error("backtracking did not find sufficient decrease after {evaluations} evaluations")]
    ArmijoNotSatisfied {
        evaluations: usize,
        last: Option<Box<Trial>>,
    },
    #[error("no acceptable step along a non-descent direction after {evaluations} evaluations")]
    NonDescent {
        evaluations: usize,
        last: Option<Box<Trial>>,
    },
    #[error("evaluation budget exhausted after {evaluations} line search evaluations")]
    BudgetExhausted {
        evaluations: usize,
        last: Option<Box<Trial>>,
    },
}

impl LineSearchError {
    pub fn evaluations(&self) -> usize {
        match self {
            Self::NotBracketed { evaluations, .. }
            | Self::WolfeNotSatisfied { evaluations, .. }
            | Self::ArmijoNotSatisfied { evaluations, .. }
            | Self::NonDescent { evaluations, .. }
            | Self::BudgetExhausted { evaluations, .. } => *evaluations,
        }
    }

    /// The trial point kept by the failed search, if it evaluated anything finite.
    pub fn into_trial(self) -> Option<Trial> {
        match self {
            Self::NotBracketed { last, .. }
            | Self::WolfeNotSatisfied { last, .. }
            | Self::ArmijoNotSatisfied { last, .. }
            | Self::NonDescent { last, .. }
            | Self::BudgetExhausted { last, .. } => last.map(|b| *b),
        }
    }
}

// Keeps the finite trial with the lowest penalty value.
#[derive(Default)]
struct TrialBest {
    best: Option<Trial>,
}

impl TrialBest {
    fn consider(&mut self, step: f64, iterate: &Iterate) {
        if !is_usable(iterate) {
            return;
        }
        let better = self
            .best
            .as_ref()
            .is_none_or(|b| iterate.penalty < b.iterate.penalty);
        if better {
            self.best = Some(Trial {
                step,
                iterate: iterate.clone(),
            });
        }
    }

    fn take(self) -> Option<Box<Trial>> {
        self.best.map(Box::new)
    }
}

fn is_usable(iterate: &Iterate) -> bool {
    iterate.penalty.is_finite() && iterate.penalty_grad.iter().all(|v| v.is_finite())
}

fn bisection_limit(dnorm: f64) -> usize {
    30usize.max((1e5 * dnorm).log2().round().max(0.0) as usize)
}

fn expansion_limit(dnorm: f64) -> usize {
    10usize.max((1e5 / dnorm).log2().round().max(0.0) as usize)
}

// Evaluation cap for one search: the global cap, tightened for uphill directions.
fn evaluation_cap(options: &Options, gtd0: f64) -> usize {
    let cap = options.linesearch_maxit.unwrap_or(usize::MAX);
    if gtd0 >= 0.0 {
        cap.min(options.linesearch_nondescent_maxit)
    } else {
        cap
    }
}

/// Searches along `d` from `start` for a step satisfying the weak Wolfe conditions
/// on `φ(·; mu)`.
///
/// `oracle` evaluates the problem at a point; the iterate it returns is
/// re-weighted to `mu` here. `gtd0` is the directional derivative at `start`.
pub fn weak_wolfe<F>(
    oracle: &mut F,
    start: &Iterate,
    d: &Array1<f64>,
    gtd0: f64,
    mu: f64,
    options: &Options,
) -> Result<LineSearchOutcome, LineSearchError>
where
    F: FnMut(&Array1<f64>) -> Lookup,
{
    let c1 = options.wolfe1;
    let c2 = options.wolfe2;
    let phi0 = start.penalty_at(mu);
    let dnorm = d.dot(d).sqrt();
    let nbisect_max = bisection_limit(dnorm);
    let nexpand_max = expansion_limit(dnorm);
    let cap = evaluation_cap(options, gtd0);

    let mut alpha = 0.0f64;
    let mut beta = f64::INFINITY;
    let mut t = options.init_step_size;
    let mut nbisect = 0usize;
    let mut nexpand = 0usize;
    let mut evaluations = 0usize;
    let mut best = TrialBest::default();

    while evaluations < cap && nbisect <= nbisect_max && nexpand <= nexpand_max {
        let x = &start.x + &(d * t);
        let trial = match oracle(&x) {
            Lookup::Evaluated(mut iterate) => {
                iterate.set_penalty_parameter(mu);
                Some(iterate)
            }
            Lookup::Rejected => None,
            Lookup::Stopped => {
                return Err(LineSearchError::BudgetExhausted {
                    evaluations,
                    last: best.take(),
                });
            }
        };
        evaluations += 1;

        let accepted = match &trial {
            Some(iterate) if is_usable(iterate) => {
                best.consider(t, iterate);
                if iterate.penalty > phi0 + c1 * t * gtd0 {
                    beta = t;
                    false
                } else if iterate.penalty_grad.dot(d) <= c2 * gtd0 {
                    alpha = t;
                    false
                } else {
                    true
                }
            }
            _ => {
                beta = t;
                false
            }
        };

        if accepted && let Some(iterate) = trial {
            log::debug!(
                "[Wolfe] accepted t = {:.3e} after {} evaluations (φ: {:.6e} -> {:.6e})",
                t,
                evaluations,
                phi0,
                iterate.penalty
            );
            return Ok(LineSearchOutcome {
                step: t,
                iterate,
                evaluations,
            });
        }

        if beta.is_finite() {
            t = 0.5 * (alpha + beta);
            nbisect += 1;
        } else {
            t = 2.0 * alpha;
            nexpand += 1;
        }
    }

    let last = best.take();
    if gtd0 >= 0.0 {
        log::debug!(
            "[Wolfe] no acceptable step along a non-descent direction (gᵀd = {:.3e})",
            gtd0
        );
        Err(LineSearchError::NonDescent { evaluations, last })
    } else if beta.is_infinite() {
        log::warn!(
            "[Wolfe] failed to bracket a step after {} evaluations (t = {:.3e})",
            evaluations,
            t
        );
        Err(LineSearchError::NotBracketed { evaluations, last })
    } else {
        log::warn!(
            "[Wolfe] bracket [{:.3e}, {:.3e}] did not yield a weak Wolfe step after {} evaluations",
            alpha,
            beta,
            evaluations
        );
        Err(LineSearchError::WolfeNotSatisfied { evaluations, last })
    }
}

/// Armijo-only backtracking: halve the step until sufficient decrease holds.
///
/// With `search_direction_rescaling` the direction is normalized to unit length
/// first; the returned step refers to the normalized direction.
pub fn backtracking<F>(
    oracle: &mut F,
    start: &Iterate,
    d: &Array1<f64>,
    gtd0: f64,
    mu: f64,
    options: &Options,
) -> Result<LineSearchOutcome, LineSearchError>
where
    F: FnMut(&Array1<f64>) -> Lookup,
{
    let dnorm = d.dot(d).sqrt();
    let (direction, slope) = if options.search_direction_rescaling && dnorm > 0.0 {
        (d / dnorm, gtd0 / dnorm)
    } else {
        (d.clone(), gtd0)
    };
    let phi0 = start.penalty_at(mu);
    let max_halvings = bisection_limit(direction.dot(&direction).sqrt());
    let cap = evaluation_cap(options, gtd0).min(max_halvings + 1);

    let mut t = options.init_step_size;
    let mut evaluations = 0usize;
    let mut best = TrialBest::default();
    while evaluations < cap {
        let x = &start.x + &(&direction * t);
        let looked_up = oracle(&x);
        if let Lookup::Stopped = looked_up {
            return Err(LineSearchError::BudgetExhausted {
                evaluations,
                last: best.take(),
            });
        }
        evaluations += 1;
        if let Lookup::Evaluated(mut iterate) = looked_up {
            iterate.set_penalty_parameter(mu);
            best.consider(t, &iterate);
            if is_usable(&iterate) && iterate.penalty <= phi0 + options.wolfe1 * t * slope {
                log::debug!(
                    "[Backtracking] accepted t = {:.3e} after {} evaluations",
                    t,
                    evaluations
                );
                return Ok(LineSearchOutcome {
                    step: t,
                    iterate,
                    evaluations,
                });
            }
        }
        t *= 0.5;
    }
    if gtd0 >= 0.0 {
        return Err(LineSearchError::NonDescent {
            evaluations,
            last: best.take(),
        });
    }
    log::warn!(
        "[Backtracking] no sufficient decrease after {} evaluations",
        evaluations
    );
    Err(LineSearchError::ArmijoNotSatisfied {
        evaluations,
        last: best.take(),
    })
}

/// Runs the line search selected by `options`.
pub fn search<F>(
    oracle: &mut F,
    start: &Iterate,
    d: &Array1<f64>,
    gtd0: f64,
    mu: f64,
    options: &Options,
) -> Result<LineSearchOutcome, LineSearchError>
where
    F: FnMut(&Array1<f64>) -> Lookup,
{
    if options.is_backtrack_linesearch {
        backtracking(oracle, start, d, gtd0, mu, options)
    } else {
        weak_wolfe(oracle, start, d, gtd0, mu, options)
    }
}

#[cfg(test)]
mod tests {
    use super::{LineSearchError, Lookup, backtracking, search, weak_wolfe};
    use crate::options::Options;
    use crate::penalty::{Evaluation, Iterate};
    use ndarray::{Array1, array};
    use spectral::prelude::*;

    fn half_square(x: &Array1<f64>) -> Lookup {
        Lookup::Evaluated(Iterate::new(
            x.clone(),
            Evaluation::unconstrained(0.5 * x.dot(x), x.clone()),
            1.0,
        ))
    }

    fn start() -> Iterate {
        match half_square(&array![1.0, 0.0]) {
            Lookup::Evaluated(it) => it,
            _ => unreachable!(),
        }
    }

    #[test]
    fn unit_step_is_accepted_on_exact_newton_direction() {
        let d = array![-1.0, 0.0];
        let out = weak_wolfe(&mut half_square, &start(), &d, -1.0, 1.0, &Options::default())
            .unwrap();
        assert_that!(&out.step).is_close_to(1.0, 1e-15);
        assert_that(&out.evaluations).is_equal_to(1);
    }

    #[test]
    fn short_direction_is_expanded() {
        // Curvature fails at t = 1, 2, 4 and holds at t = 8 (x0 = 0.2).
        let d = array![-0.1, 0.0];
        let out = weak_wolfe(&mut half_square, &start(), &d, -0.1, 1.0, &Options::default())
            .unwrap();
        assert_that!(&out.step).is_close_to(8.0, 1e-15);
        assert_that(&out.evaluations).is_equal_to(4);
        assert_that!(&out.iterate.x[0]).is_close_to(0.2, 1e-12);
    }

    #[test]
    fn long_direction_is_bisected() {
        let d = array![-3.0, 0.0];
        let out = weak_wolfe(&mut half_square, &start(), &d, -3.0, 1.0, &Options::default())
            .unwrap();
        assert_that!(&out.step).is_close_to(0.5, 1e-15);
        assert_that(&out.evaluations).is_equal_to(2);
    }

    #[test]
    fn unbounded_penalty_is_not_bracketed() {
        let mut linear = |x: &Array1<f64>| {
            Lookup::Evaluated(Iterate::new(
                x.clone(),
                Evaluation::unconstrained(-x[0], array![-1.0, 0.0]),
                1.0,
            ))
        };
        let from = Iterate::new(
            array![0.0, 0.0],
            Evaluation::unconstrained(0.0, array![-1.0, 0.0]),
            1.0,
        );
        let d = array![1.0, 0.0];
        let err = weak_wolfe(&mut linear, &from, &d, -1.0, 1.0, &Options::default()).unwrap_err();
        assert!(matches!(err, LineSearchError::NotBracketed { .. }));
        let trial = err.into_trial().unwrap();
        assert_that!(&trial.step).is_greater_than(1000.0);
    }

    #[test]
    fn evaluation_cap_classifies_the_failure() {
        let capped = Options::default().with_linesearch_maxit(1);
        let err = weak_wolfe(
            &mut half_square,
            &start(),
            &array![-3.0, 0.0],
            -3.0,
            1.0,
            &capped,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LineSearchError::WolfeNotSatisfied { evaluations: 1, .. }
        ));
        let err = weak_wolfe(
            &mut half_square,
            &start(),
            &array![-0.1, 0.0],
            -0.1,
            1.0,
            &capped,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LineSearchError::NotBracketed { evaluations: 1, .. }
        ));
    }

    #[test]
    fn uphill_direction_is_searched_only_when_allowed() {
        let d = array![1.0, 0.0];
        let strict = Options::default();
        let err = weak_wolfe(&mut half_square, &start(), &d, 1.0, 1.0, &strict).unwrap_err();
        assert_that(&err.evaluations()).is_equal_to(0);

        let lenient = Options::default().with_linesearch_nondescent_maxit(2);
        let err = weak_wolfe(&mut half_square, &start(), &d, 1.0, 1.0, &lenient).unwrap_err();
        assert_that(&err.evaluations()).is_equal_to(2);
        // Running out along an uphill direction is not a bracketing failure.
        assert!(matches!(
            err,
            LineSearchError::NonDescent { evaluations: 2, .. }
        ));

        let backtrack = lenient.with_backtracking(true, false);
        let err = backtracking(&mut half_square, &start(), &d, 1.0, 1.0, &backtrack).unwrap_err();
        assert!(matches!(err, LineSearchError::NonDescent { .. }));
    }

    #[test]
    fn non_finite_values_shrink_the_step() {
        let mut guarded = |x: &Array1<f64>| {
            if x[0] < 0.0 {
                Lookup::Evaluated(Iterate::new(
                    x.clone(),
                    Evaluation::unconstrained(f64::NAN, x.clone()),
                    1.0,
                ))
            } else {
                half_square(x)
            }
        };
        let d = array![-3.0, 0.0];
        let out = weak_wolfe(&mut guarded, &start(), &d, -3.0, 1.0, &Options::default()).unwrap();
        assert_that!(&out.step).is_close_to(0.25, 1e-15);
        assert_that(&out.evaluations).is_equal_to(3);
    }

    #[test]
    fn budget_stop_is_reported() {
        let mut calls = 0;
        let mut limited = |x: &Array1<f64>| {
            calls += 1;
            if calls > 1 { Lookup::Stopped } else { half_square(x) }
        };
        let d = array![-0.1, 0.0];
        let err = weak_wolfe(&mut limited, &start(), &d, -0.1, 1.0, &Options::default())
            .unwrap_err();
        assert!(matches!(
            err,
            LineSearchError::BudgetExhausted { evaluations: 1, .. }
        ));
        assert_that!(&err.into_trial().unwrap().step).is_close_to(1.0, 1e-15);
    }

    #[test]
    fn backtracking_halves_until_sufficient_decrease() {
        let d = array![-3.0, 0.0];
        let opts = Options::default().with_backtracking(true, false);
        let out = backtracking(&mut half_square, &start(), &d, -3.0, 1.0, &opts).unwrap();
        assert_that!(&out.step).is_close_to(0.5, 1e-15);

        // With rescaling the unit direction reaches the minimizer in one step.
        let opts = Options::default().with_backtracking(true, true);
        let out = search(&mut half_square, &start(), &d, -3.0, 1.0, &opts).unwrap();
        assert_that!(&out.step).is_close_to(1.0, 1e-15);
        assert_that!(&out.iterate.x[0]).is_close_to(0.0, 1e-15);
    }

    #[test]
    fn backtracking_ignores_curvature() {
        // Weak Wolfe would expand here; backtracking accepts the first decrease.
        let d = array![-0.1, 0.0];
        let opts = Options::default().with_backtracking(true, false);
        let out = search(&mut half_square, &start(), &d, -0.1, 1.0, &opts).unwrap();
        assert_that!(&out.step).is_close_to(1.0, 1e-15);
    }

    #[test]
    fn penalty_is_evaluated_at_the_requested_mu() {
        // With mu = 0.5 the same point has half the penalty value.
        let d = array![-1.0, 0.0];
        let out = weak_wolfe(&mut half_square, &start(), &d, -0.5, 0.5, &Options::default())
            .unwrap();
        assert_that!(&out.iterate.mu).is_close_to(0.5, 1e-15);
        assert_that!(&out.iterate.penalty).is_close_to(0.0, 1e-15);
    }
}
