//! The BFGS-SQP outer loop.
//!
//! Each iteration regularizes the BFGS matrix, measures stationarity, checks the
//! stopping tests, then walks the fallback ladder until some direction admits
//! an acceptable line search step. Accepted steps feed the BFGS update and the
//! stationarity bundle.

use crate::direction::{DirectionContext, DirectionError, FallbackLevel, SearchDirection};
use crate::fallback::{FallbackState, Transition};
use crate::hessian::{BfgsUpdate, HessianApprox, regularize};
use crate::line_search::{self, LineSearchError, Lookup, Trial};
use crate::options::{Options, OptionsError};
use crate::penalty::{Evaluation, Iterate};
use crate::qp::{ClarabelQp, QpSolver};
use crate::stationarity::{GradientBundle, Stationarity};
use crate::steering;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::time::{Duration, Instant};

/// Why the solver stopped. The numeric codes are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationCode {
    /// Stationarity measure at most `opt_tol` at a feasible iterate.
    Converged,
    /// Relative penalty decrease at most `rel_tol` at a feasible iterate.
    RelativeTolerance,
    /// Feasible iterate with `f <= fvalquit`.
    TargetReached,
    MaxIterations,
    TimeLimit,
    /// Every fallback level failed; the line search bracketed a step but could
    /// not satisfy the curvature condition. The iterate is feasible.
    LineSearchFailedFeasible,
    /// As [`TerminationCode::LineSearchFailedFeasible`] at an infeasible iterate.
    LineSearchFailedInfeasible,
    /// Every fallback level failed to bracket a step, even after shrinking μ.
    LineSearchUnbounded,
    /// No fallback level produced a usable descent direction.
    NoDescentDirection,
    EvaluationLimit,
    /// The QP solver failed and no later fallback level was permitted.
    QpFailure,
}

impl TerminationCode {
    pub fn code(self) -> u8 {
        match self {
            Self::Converged => 0,
            Self::RelativeTolerance => 1,
            Self::TargetReached => 2,
            Self::MaxIterations => 4,
            Self::TimeLimit => 5,
            Self::LineSearchFailedFeasible => 6,
            Self::LineSearchFailedInfeasible => 7,
            Self::LineSearchUnbounded => 8,
            Self::NoDescentDirection => 9,
            Self::EvaluationLimit => 10,
            Self::QpFailure => 12,
        }
    }

    /// Stopping tests that certify the final iterate.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Converged | Self::RelativeTolerance | Self::TargetReached
        )
    }

    /// The fallback ladder was exhausted in the final iteration.
    pub fn is_total_failure(self) -> bool {
        matches!(
            self,
            Self::LineSearchFailedFeasible
                | Self::LineSearchFailedInfeasible
                | Self::LineSearchUnbounded
                | Self::NoDescentDirection
                | Self::QpFailure
        )
    }
}

impl fmt::Display for TerminationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Converged => "converged to a stationary feasible point",
            Self::RelativeTolerance => "relative decrease below tolerance",
            Self::TargetReached => "objective target reached",
            Self::MaxIterations => "iteration limit reached",
            Self::TimeLimit => "time limit reached",
            Self::LineSearchFailedFeasible => "line search failed at a feasible point",
            Self::LineSearchFailedInfeasible => "line search failed at an infeasible point",
            Self::LineSearchUnbounded => "line search could not bracket a step",
            Self::NoDescentDirection => "no descent direction found",
            Self::EvaluationLimit => "function evaluation limit reached",
            Self::QpFailure => "QP solver failed",
        };
        write!(f, "{} (code {})", text, self.code())
    }
}

/// How an iterate was reached from its predecessor.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub fallback_level: FallbackLevel,
    /// Whether steering was engaged at the previous iterate.
    pub steering_engaged: bool,
    pub step_size: f64,
    /// The step was forced after every fallback level failed.
    pub forced: bool,
    pub linesearch_evaluations: usize,
    /// Number of μ reductions triggered by line search bracketing failures.
    pub linesearch_reattempts: usize,
    pub bfgs_update: BfgsUpdate,
    /// Penalty parameter in force after the step.
    pub mu: f64,
}

/// One entry of the iteration history.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: usize,
    pub iterate: Iterate,
    pub stationarity: Stationarity,
    /// `None` for the initial point.
    pub step: Option<StepInfo>,
}

#[derive(Debug, Clone)]
pub struct SolverResult {
    pub termination: TerminationCode,
    pub final_iterate: Iterate,
    pub stationarity: Stationarity,
    pub iterations: usize,
    pub function_evaluations: usize,
    /// One record per iterate, the initial point included.
    pub history: Vec<IterationRecord>,
    /// Feasible iterate with the lowest objective, if any iterate was feasible.
    pub best_feasible: Option<Iterate>,
    /// Iterate with the smallest violation (ties broken by objective).
    pub most_feasible: Iterate,
    pub mu: f64,
    pub elapsed: Duration,
}

impl SolverResult {
    pub fn x(&self) -> &Array1<f64> {
        &self.final_iterate.x
    }
}

/// Errors that prevent the solver from iterating at all.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("invalid options: {0}")]
    InvalidOptions(#[from] OptionsError),
    #[error("the initial point is empty")]
    EmptyInitialPoint,
    #[error("the objective or constraints are not finite at the initial point")]
    NonFiniteInitialPoint,
    #[error("evaluation at the initial point has inconsistent dimensions for {n} variables")]
    DimensionMismatch { n: usize },
}

/// A BFGS-SQP solver for `min f(x)` subject to `ci(x) <= 0` and `ce(x) = 0`.
///
/// `obj_fn` returns the objective, the constraints and their (sub)gradients at
/// a point. The problem shape (number of constraints) is fixed by the
/// evaluation at `x0`.
pub struct BfgsSqp<ObjFn> {
    x0: Array1<f64>,
    obj_fn: ObjFn,
    options: Options,
    qp: Box<dyn QpSolver>,
}

impl<ObjFn> BfgsSqp<ObjFn>
where
    ObjFn: FnMut(&Array1<f64>) -> Evaluation,
{
    pub fn new(x0: Array1<f64>, obj_fn: ObjFn) -> Self {
        Self {
            x0,
            obj_fn,
            options: Options::default(),
            qp: Box::new(ClarabelQp::default()),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Replaces the QP solver used by steering and the stationarity measure.
    pub fn with_qp_solver(mut self, qp: Box<dyn QpSolver>) -> Self {
        self.qp = qp;
        self
    }

    pub fn run(&mut self) -> Result<SolverResult, SolverError> {
        let options = self.options.clone().validate()?;
        let n = self.x0.len();
        if n == 0 {
            return Err(SolverError::EmptyInitialPoint);
        }
        let qp: &dyn QpSolver = self.qp.as_ref();

        let eval0 = (self.obj_fn)(&self.x0);
        if !eval0.has_shape(n) {
            return Err(SolverError::DimensionMismatch { n });
        }
        if !eval0.is_finite() || self.x0.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFiniteInitialPoint);
        }
        let shape = (eval0.ci.len(), eval0.ce.len());
        let mut budget = Budget::new(&options);
        budget.evaluations = 1;
        let mut oracle = Oracle {
            obj_fn: &mut self.obj_fn,
            budget: &mut budget,
            n,
            shape,
        };

        let mut current = Iterate::new(self.x0.clone(), eval0, options.mu0);
        let mut hessian = HessianApprox::identity(n, options.scale_h0, options.bfgs_damping);
        let mut bundle = GradientBundle::new(options.bundle_size(n));
        bundle.push(&current);
        let mut tracker = Tracker::new(&current, &options);
        let mut rng = ChaCha8Rng::seed_from_u64(options.random_seed);
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut pending_step: Option<StepInfo> = None;

        log::info!(
            "[BFGS-SQP] starting: n = {}, {} inequalities, {} equalities, mu0 = {:.3e}",
            n,
            shape.0,
            shape.1,
            options.mu0
        );

        let mut k = 0usize;
        let (termination, stationarity) = loop {
            // The regularized matrix may borrow H, so it lives only until the
            // iteration has produced its step.
            let (accepted, steering_engaged) = {
                let h_reg = regularize(
                    hessian.matrix(),
                    options.regularize_threshold,
                    options.regularize_max_eigenvalues,
                );
                let stationarity = bundle.measure(&current, &h_reg, options.evaldist, qp);
                history.push(IterationRecord {
                    iteration: k,
                    iterate: current.clone(),
                    stationarity,
                    step: pending_step.take(),
                });
                log::debug!(
                    "[BFGS-SQP] iter {:4}: f = {:.6e}, tv = {:.3e}, mu = {:.3e}, stationarity = {:.3e}",
                    k,
                    current.f,
                    current.tv(),
                    current.mu,
                    stationarity.value
                );

                if let Some(code) = stopping_test(&current, &stationarity, &history, k, &options) {
                    break (code, stationarity);
                }
                if let Some(code) = oracle.budget.exhausted() {
                    break (code, stationarity);
                }

                let steering_engaged = steering::is_engaged(&current, options.steering_ineq_margin);
                let ctx = IterationContext {
                    options: &options,
                    qp,
                    hessian: hessian.matrix(),
                    hessian_reg: &h_reg,
                    steering_engaged,
                    first: k == 0,
                };
                match ctx.run(&mut current, &mut oracle, &mut rng) {
                    IterationOutcome::Accepted(accepted) => (*accepted, steering_engaged),
                    IterationOutcome::Stopped(code) => break (code, stationarity),
                }
            };

            let Accepted {
                iterate: mut next,
                direction,
                step,
                evaluations,
                reattempts,
                forced,
            } = accepted;
            next.set_penalty_parameter(current.mu);
            let s = &next.x - &current.x;
            let y = &next.penalty_grad - &current.penalty_grad;
            let bfgs_update = hessian.update(&s, &y);
            if !bfgs_update.was_applied() {
                log::debug!("[BFGS-SQP] iter {:4}: BFGS update skipped ({:?})", k, bfgs_update);
            }

            pending_step = Some(StepInfo {
                fallback_level: direction.level,
                steering_engaged,
                step_size: step,
                forced,
                linesearch_evaluations: evaluations,
                linesearch_reattempts: reattempts,
                bfgs_update,
                mu: next.mu,
            });
            bundle.push(&next);
            tracker.consider(&next);
            current = next;
            k += 1;
        };

        let function_evaluations = oracle.budget.evaluations;
        let elapsed = oracle.budget.started.elapsed();
        if termination.is_success() {
            log::info!(
                "[BFGS-SQP] {} after {} iterations ({} evaluations): f = {:.6e}, tv = {:.3e}",
                termination,
                k,
                function_evaluations,
                current.f,
                current.tv()
            );
        } else {
            log::warn!(
                "[BFGS-SQP] stopped: {} after {} iterations ({} evaluations): f = {:.6e}, tv = {:.3e}, stationarity = {:.3e}",
                termination,
                k,
                function_evaluations,
                current.f,
                current.tv(),
                stationarity.value
            );
        }

        let (best_feasible, most_feasible) = tracker.into_parts();
        Ok(SolverResult {
            termination,
            mu: current.mu,
            final_iterate: current,
            stationarity,
            iterations: k,
            function_evaluations,
            history,
            best_feasible,
            most_feasible,
            elapsed,
        })
    }
}

// Stopping tests on the freshly recorded iterate, in order 0, 2, 1, 4.
fn stopping_test(
    current: &Iterate,
    stationarity: &Stationarity,
    history: &[IterationRecord],
    k: usize,
    options: &Options,
) -> Option<TerminationCode> {
    let feasible = current.is_feasible(options.viol_ineq_tol, options.viol_eq_tol);
    if feasible && stationarity.value <= options.opt_tol {
        return Some(TerminationCode::Converged);
    }
    if feasible && current.f <= options.fvalquit {
        return Some(TerminationCode::TargetReached);
    }
    if feasible
        && options.rel_tol > 0.0
        && k > 0
        && let Some(previous) = history.get(k - 1)
    {
        let before = previous.iterate.penalty_at(current.mu);
        let decrease = (before - current.penalty).abs();
        if decrease <= options.rel_tol * before.abs().max(f64::EPSILON) {
            return Some(TerminationCode::RelativeTolerance);
        }
    }
    if k >= options.maxit {
        return Some(TerminationCode::MaxIterations);
    }
    None
}

struct Budget {
    started: Instant,
    max_clock_time: Option<Duration>,
    max_evaluations: Option<usize>,
    evaluations: usize,
}

impl Budget {
    fn new(options: &Options) -> Self {
        Self {
            started: Instant::now(),
            max_clock_time: options.max_clock_time,
            max_evaluations: options.max_function_evaluations,
            evaluations: 0,
        }
    }

    fn exhausted(&self) -> Option<TerminationCode> {
        if let Some(limit) = self.max_clock_time
            && self.started.elapsed() >= limit
        {
            return Some(TerminationCode::TimeLimit);
        }
        if let Some(limit) = self.max_evaluations
            && self.evaluations >= limit
        {
            return Some(TerminationCode::EvaluationLimit);
        }
        None
    }
}

// Counts evaluations, enforces the budgets and screens malformed output.
struct Oracle<'a, ObjFn> {
    obj_fn: &'a mut ObjFn,
    budget: &'a mut Budget,
    n: usize,
    shape: (usize, usize),
}

impl<ObjFn> Oracle<'_, ObjFn>
where
    ObjFn: FnMut(&Array1<f64>) -> Evaluation,
{
    fn look_up(&mut self, x: &Array1<f64>) -> Lookup {
        if self.budget.exhausted().is_some() {
            return Lookup::Stopped;
        }
        let eval = (self.obj_fn)(x);
        self.budget.evaluations += 1;
        if !eval.has_shape(self.n) || (eval.ci.len(), eval.ce.len()) != self.shape {
            log::warn!("[BFGS-SQP] evaluation with inconsistent dimensions rejected");
            return Lookup::Rejected;
        }
        if !eval.is_finite() {
            return Lookup::Rejected;
        }
        Lookup::Evaluated(Iterate::new(x.clone(), eval, 1.0))
    }

    fn stop_code(&self) -> TerminationCode {
        self.budget
            .exhausted()
            .unwrap_or(TerminationCode::EvaluationLimit)
    }
}

// Best feasible and most feasible iterates seen so far.
struct Tracker {
    viol_ineq_tol: f64,
    viol_eq_tol: f64,
    best_feasible: Option<Iterate>,
    most_feasible: Iterate,
}

impl Tracker {
    fn new(first: &Iterate, options: &Options) -> Self {
        let mut tracker = Self {
            viol_ineq_tol: options.viol_ineq_tol,
            viol_eq_tol: options.viol_eq_tol,
            best_feasible: None,
            most_feasible: first.clone(),
        };
        tracker.consider(first);
        tracker
    }

    fn consider(&mut self, iterate: &Iterate) {
        if iterate.is_feasible(self.viol_ineq_tol, self.viol_eq_tol)
            && self
                .best_feasible
                .as_ref()
                .is_none_or(|best| iterate.f < best.f)
        {
            self.best_feasible = Some(iterate.clone());
        }
        let tv = iterate.tv();
        let most = &self.most_feasible;
        if tv < most.tv() || (tv == most.tv() && iterate.f < most.f) {
            self.most_feasible = iterate.clone();
        }
    }

    fn into_parts(self) -> (Option<Iterate>, Iterate) {
        (self.best_feasible, self.most_feasible)
    }
}

// Cause of the most recent failure on the fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Qp,
    NoDescent,
    Unbounded,
    Wolfe,
}

impl Failure {
    fn termination(self, feasible: bool) -> TerminationCode {
        match self {
            Failure::Qp => TerminationCode::QpFailure,
            Failure::NoDescent => TerminationCode::NoDescentDirection,
            Failure::Unbounded => TerminationCode::LineSearchUnbounded,
            Failure::Wolfe if feasible => TerminationCode::LineSearchFailedFeasible,
            Failure::Wolfe => TerminationCode::LineSearchFailedInfeasible,
        }
    }
}

struct Accepted {
    iterate: Iterate,
    direction: SearchDirection,
    step: f64,
    evaluations: usize,
    reattempts: usize,
    forced: bool,
}

enum IterationOutcome {
    Accepted(Box<Accepted>),
    Stopped(TerminationCode),
}

// Read-only inputs of one outer iteration.
struct IterationContext<'a> {
    options: &'a Options,
    qp: &'a dyn QpSolver,
    hessian: &'a Array2<f64>,
    hessian_reg: &'a Array2<f64>,
    steering_engaged: bool,
    first: bool,
}

impl IterationContext<'_> {
    fn direction(
        &self,
        current: &Iterate,
        level: FallbackLevel,
        rng: &mut ChaCha8Rng,
    ) -> Result<SearchDirection, DirectionError> {
        DirectionContext {
            iterate: current,
            hessian: self.hessian,
            hessian_reg: self.hessian_reg,
            options: self.options,
            qp: self.qp,
            steering_engaged: self.steering_engaged,
        }
        .compute(level, current.mu, rng)
    }

    // Walks the fallback ladder once. `current` is only re-weighted (μ may
    // shrink); the returned iterate is the candidate for the next iteration.
    fn run<ObjFn>(
        &self,
        current: &mut Iterate,
        oracle: &mut Oracle<'_, ObjFn>,
        rng: &mut ChaCha8Rng,
    ) -> IterationOutcome
    where
        ObjFn: FnMut(&Array1<f64>) -> Evaluation,
    {
        let options = self.options;
        let (max_reattempts, reattempt_c_mu) = if self.first {
            (options.linesearch_reattempts_x0, options.linesearch_c_mu_x0)
        } else {
            (options.linesearch_reattempts, options.linesearch_c_mu)
        };
        let mut fallback = FallbackState::reset(options, self.steering_engaged);
        let mut failure: Failure;
        let mut last_direction: Option<SearchDirection> = None;
        let mut last_trial: Option<Trial> = None;
        let mut evaluations = 0usize;
        let mut reattempts = 0usize;

        loop {
            let level = fallback.level();
            let mut computed = self.direction(current, level, rng);
            let mut level_reattempts = 0usize;
            loop {
                let direction = match computed {
                    Ok(direction) => direction,
                    Err(DirectionError::Qp(err)) => {
                        log::warn!("[Fallback] level {} QP failure: {}", level, err);
                        failure = Failure::Qp;
                        break;
                    }
                    Err(DirectionError::NonDescent { direction, .. }) => {
                        last_direction = Some(*direction);
                        last_trial = None;
                        failure = Failure::NoDescent;
                        break;
                    }
                    Err(DirectionError::Degenerate) => {
                        log::debug!("[Fallback] level {} produced a degenerate direction", level);
                        failure = Failure::NoDescent;
                        break;
                    }
                };
                if direction.mu < current.mu {
                    log::debug!(
                        "[Steering] mu lowered from {:.3e} to {:.3e}",
                        current.mu,
                        direction.mu
                    );
                    current.set_penalty_parameter(direction.mu);
                }

                let searched = line_search::search(
                    &mut |x: &Array1<f64>| oracle.look_up(x),
                    current,
                    &direction.d,
                    direction.gtd,
                    current.mu,
                    options,
                );
                let err = match searched {
                    Ok(outcome) => {
                        return IterationOutcome::Accepted(Box::new(Accepted {
                            iterate: outcome.iterate,
                            direction,
                            step: outcome.step,
                            evaluations: evaluations + outcome.evaluations,
                            reattempts,
                            forced: false,
                        }));
                    }
                    Err(err) => err,
                };

                evaluations += err.evaluations();
                let budget_stop = matches!(err, LineSearchError::BudgetExhausted { .. });
                let non_descent = matches!(err, LineSearchError::NonDescent { .. });
                let bracketed = !matches!(err, LineSearchError::NotBracketed { .. });
                last_trial = err.into_trial();
                last_direction = Some(direction);
                if budget_stop {
                    return IterationOutcome::Stopped(oracle.stop_code());
                }
                if !bracketed && current.is_constrained() && level_reattempts < max_reattempts {
                    level_reattempts += 1;
                    reattempts += 1;
                    let mu = current.mu * reattempt_c_mu;
                    log::debug!(
                        "[Wolfe] bracketing failed at level {}; reattempt {}/{} with mu = {:.3e}",
                        level,
                        level_reattempts,
                        max_reattempts,
                        mu
                    );
                    current.set_penalty_parameter(mu);
                    computed = self.direction(current, level, rng);
                    continue;
                }
                failure = if non_descent {
                    Failure::NoDescent
                } else if bracketed {
                    Failure::Wolfe
                } else {
                    Failure::Unbounded
                };
                break;
            }

            if fallback.escalate() == Transition::Exhausted {
                break;
            }
        }

        let code = failure.termination(
            current.is_feasible(options.viol_ineq_tol, options.viol_eq_tol),
        );
        if !options.disable_terminationcode_6 {
            return IterationOutcome::Stopped(code);
        }
        let Some(direction) = last_direction else {
            log::warn!("[BFGS-SQP] no direction to force a step along");
            return IterationOutcome::Stopped(code);
        };

        let (step, iterate) = match last_trial {
            Some(trial) => (trial.step, trial.iterate),
            None => {
                let t = options.init_step_size;
                let x = &current.x + &(&direction.d * t);
                match oracle.look_up(&x) {
                    Lookup::Evaluated(iterate) => {
                        evaluations += 1;
                        (t, iterate)
                    }
                    Lookup::Rejected => return IterationOutcome::Stopped(code),
                    Lookup::Stopped => return IterationOutcome::Stopped(oracle.stop_code()),
                }
            }
        };
        log::warn!(
            "[BFGS-SQP] forcing a step of t = {:.3e} along the level {} direction",
            step,
            direction.level
        );
        IterationOutcome::Accepted(Box::new(Accepted {
            iterate,
            direction,
            step,
            evaluations,
            reattempts,
            forced: true,
        }))
    }
}
