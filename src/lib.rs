//! A BFGS-SQP solver for nonsmooth, nonconvex, constrained optimization.
//!
//! The solver minimizes `f(x)` subject to inequality constraints `ci(x) <= 0` and
//! equality constraints `ce(x) = 0`, where `f`, `ci` and `ce` may be nonsmooth
//! (e.g. contain `max` or `abs`) as long as they are differentiable almost
//! everywhere. Constraints are handled through the exact penalty function
//! `φ(x; μ) = μ f(x) + Σ max(ci, 0) + Σ |ce|`, minimized by a BFGS method with a
//! weak Wolfe line search. Near the constraints the direction is "steered"
//! toward feasibility by a small QP, lowering μ when needed.
//!
//! # Features
//! - Five-level search-direction ladder: steering with the BFGS matrix, steering
//!   with the identity, quasi-Newton, steepest descent and random directions.
//!   The ladder is reset every iteration and bounded by
//!   `with_fallback_levels(min, max)`.
//! - Steering only near the constraints (`with_steering_ineq_margin`), always
//!   with equality constraints, never without constraints.
//! - Weak Wolfe line search suited to nonsmooth functions, or Armijo-only
//!   backtracking (`with_backtracking`). Bracketing failures on constrained
//!   problems shrink μ and retry.
//! - Damped BFGS updates with initial scaling; curvature failures leave H untouched.
//! - Optional condition-number cap on H inside the QPs (`with_regularization`).
//! - Stationarity measured over a bundle of nearby gradients, so convergence is
//!   detected at kinks where no single gradient vanishes.
//! - Pluggable QP solver (`with_qp_solver`); by default the Clarabel interior-point
//!   solver with an active-set polish.
//! - Iteration, wall-clock and evaluation budgets; a full iteration history and the
//!   best feasible / most feasible iterates in the result.
//!
//! ## Defaults (key settings)
//! - `mu0 = 1`, `opt_tol = 1e-8`, `viol_ineq_tol = 0`, `viol_eq_tol = 1e-6`, `maxit = 1000`.
//! - Fallback levels 0 to 3, 5 random attempts when level 4 is allowed.
//! - Steering: 1-norm model, margin 1e-6, at most 10 shrinks by 0.9 to reach 10% of the
//!   reference violation reduction.
//! - Line search: `wolfe1 = 1e-4`, `wolfe2 = 0.5`, initial step 1, 10 μ-halving reattempts
//!   (30 on the first iteration).
//! - No regularization (`regularize_threshold = ∞`).
//!
//! # Example
//!
//! Minimize `x0² + x1²` subject to `x0 >= 1`.
//!
//! ```
//! use bfgs_sqp::{BfgsSqp, Evaluation, Options};
//! use ndarray::{array, Array1, Array2};
//!
//! let problem = |x: &Array1<f64>| {
//!     Evaluation::unconstrained(x.dot(x), x * 2.0).with_inequalities(
//!         array![1.0 - x[0]],
//!         Array2::from_shape_vec((2, 1), vec![-1.0, 0.0]).unwrap(),
//!     )
//! };
//!
//! let result = BfgsSqp::new(array![3.0, 1.0], problem)
//!     .with_options(Options::default().with_maxit(200))
//!     .run()
//!     .expect("options are valid and the start point is finite");
//!
//! println!(
//!     "{} after {} iterations: x = {}, f = {:.6}",
//!     result.termination, result.iterations, result.x(), result.final_iterate.f
//! );
//! assert!((result.x()[0] - 1.0).abs() < 1e-2);
//! assert!(result.x()[1].abs() < 1e-2);
//! ```

pub mod direction;
pub mod fallback;
pub mod hessian;
pub mod line_search;
pub mod options;
pub mod penalty;
pub mod qp;
pub mod solver;
pub mod stationarity;
pub mod steering;

pub use direction::{FallbackLevel, SearchDirection};
pub use hessian::{BfgsUpdate, HessianApprox};
pub use options::{Options, OptionsError};
pub use penalty::{Evaluation, Iterate};
pub use qp::{ClarabelQp, QpConstraints, QpError, QpSolver, QuadraticProgram};
pub use solver::{
    BfgsSqp, IterationRecord, SolverError, SolverResult, StepInfo, TerminationCode,
};
pub use stationarity::Stationarity;
