//! Solver configuration.
//!
//! [`Options`] is an immutable snapshot consumed by every component of the solver.
//! It is built with `Default` plus `with_*` builder methods and checked once by
//! [`Options::validate`] before the solver loop starts.

use std::time::Duration;

/// An error describing an option value outside of its admissible range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptionsError {
    #[error("option `{name}` = {value} is out of range; expected {expected}")]
    OutOfRange {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error(
        "fallback range is empty: min_fallback_level ({min}) must not exceed max_fallback_level ({max})"
    )]
    EmptyFallbackRange { min: usize, max: usize },
    #[error("wolfe2 ({wolfe2}) must be at least wolfe1 ({wolfe1})")]
    WolfeOrdering { wolfe1: f64, wolfe2: f64 },
}

/// Configuration for the BFGS-SQP solver.
///
/// Every field has the default listed on its builder method. Fields are public so
/// that a configuration can also be written as a struct literal with
/// `..Options::default()`.
#[derive(Debug, Clone)]
pub struct Options {
    // Standard parameters
    pub mu0: f64,
    pub opt_tol: f64,
    pub rel_tol: f64,
    pub viol_ineq_tol: f64,
    pub viol_eq_tol: f64,
    pub maxit: usize,
    pub fvalquit: f64,
    pub max_clock_time: Option<Duration>,
    pub max_function_evaluations: Option<usize>,
    pub ngrad: Option<usize>,
    pub evaldist: f64,
    pub scale_h0: bool,
    pub bfgs_damping: f64,
    pub random_seed: u64,

    // Search direction strategies
    pub min_fallback_level: usize,
    pub max_fallback_level: usize,
    pub max_random_attempts: usize,

    // Steering
    pub steering_l1_model: bool,
    pub steering_ineq_margin: f64,
    pub steering_maxit: usize,
    pub steering_c_viol: f64,
    pub steering_c_mu: f64,

    // QP regularization
    pub regularize_threshold: f64,
    pub regularize_max_eigenvalues: bool,

    // Line search
    pub wolfe1: f64,
    pub wolfe2: f64,
    pub linesearch_nondescent_maxit: usize,
    pub linesearch_reattempts: usize,
    pub linesearch_reattempts_x0: usize,
    pub linesearch_c_mu: f64,
    pub linesearch_c_mu_x0: f64,
    pub init_step_size: f64,
    pub linesearch_maxit: Option<usize>,
    pub is_backtrack_linesearch: bool,
    pub search_direction_rescaling: bool,
    pub disable_terminationcode_6: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mu0: 1.0,
            opt_tol: 1e-8,
            rel_tol: 0.0,
            viol_ineq_tol: 0.0,
            viol_eq_tol: 1e-6,
            maxit: 1000,
            fvalquit: f64::NEG_INFINITY,
            max_clock_time: None,
            max_function_evaluations: None,
            ngrad: None,
            evaldist: 1e-4,
            scale_h0: true,
            bfgs_damping: 1e-4,
            random_seed: 0x5EED_B0F5_0000_0001,
            min_fallback_level: 0,
            max_fallback_level: 3,
            max_random_attempts: 5,
            steering_l1_model: true,
            steering_ineq_margin: 1e-6,
            steering_maxit: 10,
            steering_c_viol: 0.1,
            steering_c_mu: 0.9,
            regularize_threshold: f64::INFINITY,
            regularize_max_eigenvalues: false,
            wolfe1: 1e-4,
            wolfe2: 0.5,
            linesearch_nondescent_maxit: 0,
            linesearch_reattempts: 10,
            linesearch_reattempts_x0: 30,
            linesearch_c_mu: 0.5,
            linesearch_c_mu_x0: 0.5,
            init_step_size: 1.0,
            linesearch_maxit: None,
            is_backtrack_linesearch: false,
            search_direction_rescaling: false,
            disable_terminationcode_6: false,
        }
    }
}

fn out_of_range(name: &'static str, value: impl ToString, expected: &'static str) -> OptionsError {
    OptionsError::OutOfRange {
        name,
        value: value.to_string(),
        expected,
    }
}

fn in_open_unit(v: f64) -> bool {
    v > 0.0 && v < 1.0
}

impl Options {
    /// Checks every option against its admissible range.
    ///
    /// Returns the options unchanged on success so that validation can be chained
    /// onto a builder expression.
    pub fn validate(self) -> Result<Self, OptionsError> {
        if !(self.mu0.is_finite() && self.mu0 > 0.0) {
            return Err(out_of_range("mu0", self.mu0, "a positive finite real"));
        }
        if !(self.opt_tol >= 0.0) {
            return Err(out_of_range("opt_tol", self.opt_tol, "a non-negative real"));
        }
        if !(self.rel_tol >= 0.0) {
            return Err(out_of_range("rel_tol", self.rel_tol, "a non-negative real"));
        }
        if !(self.viol_ineq_tol >= 0.0) {
            return Err(out_of_range(
                "viol_ineq_tol",
                self.viol_ineq_tol,
                "a non-negative real",
            ));
        }
        if !(self.viol_eq_tol >= 0.0) {
            return Err(out_of_range(
                "viol_eq_tol",
                self.viol_eq_tol,
                "a non-negative real",
            ));
        }
        if self.fvalquit.is_nan() {
            return Err(out_of_range("fvalquit", self.fvalquit, "a real or -inf"));
        }
        if self.ngrad == Some(0) {
            return Err(out_of_range("ngrad", 0, "a positive integer"));
        }
        if !(self.evaldist >= 0.0) {
            return Err(out_of_range("evaldist", self.evaldist, "a non-negative real"));
        }
        if !(self.bfgs_damping >= 0.0 && self.bfgs_damping <= 1.0) {
            return Err(out_of_range("bfgs_damping", self.bfgs_damping, "a real in [0,1]"));
        }
        if self.min_fallback_level > 4 {
            return Err(out_of_range(
                "min_fallback_level",
                self.min_fallback_level,
                "an integer in [0,4]",
            ));
        }
        if self.max_fallback_level > 4 {
            return Err(out_of_range(
                "max_fallback_level",
                self.max_fallback_level,
                "an integer in [0,4]",
            ));
        }
        if self.min_fallback_level > self.max_fallback_level {
            return Err(OptionsError::EmptyFallbackRange {
                min: self.min_fallback_level,
                max: self.max_fallback_level,
            });
        }
        if self.max_random_attempts == 0 {
            return Err(out_of_range("max_random_attempts", 0, "a positive integer"));
        }
        if !(self.steering_ineq_margin >= 0.0) {
            return Err(out_of_range(
                "steering_ineq_margin",
                self.steering_ineq_margin,
                "a non-negative real or inf",
            ));
        }
        if !in_open_unit(self.steering_c_viol) {
            return Err(out_of_range(
                "steering_c_viol",
                self.steering_c_viol,
                "a real in (0,1)",
            ));
        }
        if !in_open_unit(self.steering_c_mu) {
            return Err(out_of_range(
                "steering_c_mu",
                self.steering_c_mu,
                "a real in (0,1)",
            ));
        }
        if !(self.regularize_threshold >= 1.0) {
            return Err(out_of_range(
                "regularize_threshold",
                self.regularize_threshold,
                "a real >= 1 or inf",
            ));
        }
        if !(self.wolfe1 > 0.0 && self.wolfe1 <= 0.5) {
            return Err(out_of_range("wolfe1", self.wolfe1, "a real in (0,0.5]"));
        }
        if !(self.wolfe2 < 1.0) {
            return Err(out_of_range("wolfe2", self.wolfe2, "a real in [wolfe1,1)"));
        }
        if self.wolfe2 < self.wolfe1 {
            return Err(OptionsError::WolfeOrdering {
                wolfe1: self.wolfe1,
                wolfe2: self.wolfe2,
            });
        }
        if self.linesearch_reattempts == 0 {
            return Err(out_of_range("linesearch_reattempts", 0, "a positive integer"));
        }
        if self.linesearch_reattempts_x0 == 0 {
            return Err(out_of_range(
                "linesearch_reattempts_x0",
                0,
                "a positive integer",
            ));
        }
        if !in_open_unit(self.linesearch_c_mu) {
            return Err(out_of_range(
                "linesearch_c_mu",
                self.linesearch_c_mu,
                "a real in (0,1)",
            ));
        }
        if !in_open_unit(self.linesearch_c_mu_x0) {
            return Err(out_of_range(
                "linesearch_c_mu_x0",
                self.linesearch_c_mu_x0,
                "a real in (0,1)",
            ));
        }
        if !(self.init_step_size.is_finite() && self.init_step_size > 0.0) {
            return Err(out_of_range(
                "init_step_size",
                self.init_step_size,
                "a positive finite real",
            ));
        }
        if self.linesearch_maxit == Some(0) {
            return Err(out_of_range("linesearch_maxit", 0, "a positive integer or inf"));
        }
        Ok(self)
    }

    /// Number of stationarity bundle samples for a problem with `n` variables.
    pub(crate) fn bundle_size(&self, n: usize) -> usize {
        self.ngrad
            .unwrap_or_else(|| 100.min(2 * n).min(n + 10))
            .max(1)
    }

    /// Sets the initial penalty parameter (default: 1).
    pub fn with_mu0(mut self, mu0: f64) -> Self {
        self.mu0 = mu0;
        self
    }

    /// Sets the stationarity tolerance (default: 1e-8).
    pub fn with_opt_tol(mut self, opt_tol: f64) -> Self {
        self.opt_tol = opt_tol;
        self
    }

    /// Sets the relative-decrease tolerance; zero disables the test (default: 0).
    pub fn with_rel_tol(mut self, rel_tol: f64) -> Self {
        self.rel_tol = rel_tol;
        self
    }

    /// Sets the feasibility tolerances for inequality and equality constraints
    /// (defaults: 0 and 1e-6).
    pub fn with_violation_tolerances(mut self, ineq: f64, eq: f64) -> Self {
        self.viol_ineq_tol = ineq;
        self.viol_eq_tol = eq;
        self
    }

    /// Sets the maximum number of iterations (default: 1000).
    pub fn with_maxit(mut self, maxit: usize) -> Self {
        self.maxit = maxit;
        self
    }

    /// Stops once a feasible iterate has objective value at or below `fvalquit`.
    pub fn with_fvalquit(mut self, fvalquit: f64) -> Self {
        self.fvalquit = fvalquit;
        self
    }

    /// Bounds the wall-clock time of a run; checked between evaluations.
    pub fn with_max_clock_time(mut self, limit: Duration) -> Self {
        self.max_clock_time = Some(limit);
        self
    }

    /// Bounds the total number of objective/constraint evaluations of a run.
    pub fn with_max_function_evaluations(mut self, limit: usize) -> Self {
        self.max_function_evaluations = Some(limit);
        self
    }

    /// Sets the number of recent gradients used in the stationarity measure and
    /// the radius inside which they are considered.
    pub fn with_stationarity_bundle(mut self, ngrad: usize, evaldist: f64) -> Self {
        self.ngrad = Some(ngrad);
        self.evaldist = evaldist;
        self
    }

    /// Configures the BFGS update: initial scaling and damping threshold.
    pub fn with_bfgs(mut self, scale_h0: bool, damping: f64) -> Self {
        self.scale_h0 = scale_h0;
        self.bfgs_damping = damping;
        self
    }

    /// Sets the seed used to draw random search directions.
    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Bounds the search-direction fallback range (defaults: 0 and 3).
    pub fn with_fallback_levels(mut self, min: usize, max: usize) -> Self {
        self.min_fallback_level = min;
        self.max_fallback_level = max;
        self
    }

    /// Sets the number of random directions tried at the last fallback level (default: 5).
    pub fn with_max_random_attempts(mut self, attempts: usize) -> Self {
        self.max_random_attempts = attempts;
        self
    }

    /// Chooses the 1-norm (default) or the infinity-norm violation model for steering.
    pub fn with_steering_l1_model(mut self, l1: bool) -> Self {
        self.steering_l1_model = l1;
        self
    }

    /// Sets the inequality margin that enables steering (default: 1e-6).
    pub fn with_steering_ineq_margin(mut self, margin: f64) -> Self {
        self.steering_ineq_margin = margin;
        self
    }

    /// Configures the steering penalty-shrinking loop (defaults: 10, 0.1, 0.9).
    pub fn with_steering(mut self, maxit: usize, c_viol: f64, c_mu: f64) -> Self {
        self.steering_maxit = maxit;
        self.steering_c_viol = c_viol;
        self.steering_c_mu = c_mu;
        self
    }

    /// Caps the condition number of H inside the QPs; `f64::INFINITY` disables it.
    pub fn with_regularization(mut self, threshold: f64, max_eigenvalues: bool) -> Self {
        self.regularize_threshold = threshold;
        self.regularize_max_eigenvalues = max_eigenvalues;
        self
    }

    /// Sets the weak Wolfe parameters (defaults: 1e-4 and 0.5).
    pub fn with_wolfe(mut self, wolfe1: f64, wolfe2: f64) -> Self {
        self.wolfe1 = wolfe1;
        self.wolfe2 = wolfe2;
        self
    }

    /// Allows up to `maxit` line search evaluations along non-descent directions (default: 0).
    pub fn with_linesearch_nondescent_maxit(mut self, maxit: usize) -> Self {
        self.linesearch_nondescent_maxit = maxit;
        self
    }

    /// Configures the penalty-shrinking line search reattempts for later iterations.
    pub fn with_linesearch_reattempts(mut self, reattempts: usize, c_mu: f64) -> Self {
        self.linesearch_reattempts = reattempts;
        self.linesearch_c_mu = c_mu;
        self
    }

    /// Configures the penalty-shrinking line search reattempts for the first iteration.
    pub fn with_linesearch_reattempts_x0(mut self, reattempts: usize, c_mu: f64) -> Self {
        self.linesearch_reattempts_x0 = reattempts;
        self.linesearch_c_mu_x0 = c_mu;
        self
    }

    /// Sets the first trial step of every line search (default: 1).
    pub fn with_init_step_size(mut self, t: f64) -> Self {
        self.init_step_size = t;
        self
    }

    /// Caps the evaluations of a single line search (default: unbounded).
    pub fn with_linesearch_maxit(mut self, maxit: usize) -> Self {
        self.linesearch_maxit = Some(maxit);
        self
    }

    /// Switches to an Armijo-only backtracking line search, optionally with
    /// unit-norm directions.
    pub fn with_backtracking(mut self, enable: bool, rescale_direction: bool) -> Self {
        self.is_backtrack_linesearch = enable;
        self.search_direction_rescaling = rescale_direction;
        self
    }

    /// Forces a movement instead of stopping when every fallback level failed.
    pub fn with_disable_terminationcode_6(mut self, disable: bool) -> Self {
        self.disable_terminationcode_6 = disable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Options, OptionsError};
    use spectral::prelude::*;

    #[test]
    fn defaults_are_valid() {
        let opts = Options::default().validate();
        assert!(opts.is_ok());
        let opts = opts.unwrap();
        assert_that(&opts.max_fallback_level).is_equal_to(3);
        assert!(opts.regularize_threshold.is_infinite());
        assert!(opts.linesearch_maxit.is_none());
    }

    #[test]
    fn inverted_fallback_range_is_rejected() {
        let err = Options::default()
            .with_fallback_levels(3, 1)
            .validate()
            .unwrap_err();
        assert_eq!(err, OptionsError::EmptyFallbackRange { min: 3, max: 1 });
    }

    #[test]
    fn wolfe_parameters_are_checked() {
        assert!(Options::default().with_wolfe(0.6, 0.9).validate().is_err());
        assert!(matches!(
            Options::default().with_wolfe(0.3, 0.2).validate(),
            Err(OptionsError::WolfeOrdering { .. })
        ));
        assert!(Options::default().with_wolfe(0.3, 0.3).validate().is_ok());
    }

    #[test]
    fn regularization_threshold_below_one_is_rejected() {
        let err = Options::default()
            .with_regularization(0.5, false)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("regularize_threshold"));
        assert!(
            Options::default()
                .with_regularization(1.0, true)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn infinite_margin_is_accepted() {
        assert!(
            Options::default()
                .with_steering_ineq_margin(f64::INFINITY)
                .validate()
                .is_ok()
        );
        assert!(
            Options::default()
                .with_steering_ineq_margin(-1.0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn default_bundle_size_follows_dimension() {
        let opts = Options::default();
        assert_that(&opts.bundle_size(2)).is_equal_to(4);
        assert_that(&opts.bundle_size(20)).is_equal_to(30);
        assert_that(&opts.bundle_size(500)).is_equal_to(100);
        assert_that(&opts.clone().with_stationarity_bundle(7, 1e-3).bundle_size(500)).is_equal_to(7);
    }
}
