//! Search directions for the five fallback levels.
//!
//! Each level trades model quality for robustness: steering with the current
//! curvature, steering with the identity, a plain quasi-Newton step on the
//! penalty function, steepest descent, and finally a random direction.

use crate::options::Options;
use crate::penalty::Iterate;
use crate::qp::{QpError, QpSolver};
use crate::steering;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::fmt;

/// A rung of the search-direction ladder, ordered from most to least informed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FallbackLevel {
    /// Steering QP using the (regularized) BFGS matrix.
    Steering,
    /// Steering QP using the identity in place of the BFGS matrix.
    SteeringIdentity,
    /// `-H ∇φ`
    QuasiNewton,
    /// `-∇φ`
    SteepestDescent,
    /// A uniformly random direction, sign-corrected to descend when possible.
    Random,
}

impl FallbackLevel {
    pub const ALL: [FallbackLevel; 5] = [
        FallbackLevel::Steering,
        FallbackLevel::SteeringIdentity,
        FallbackLevel::QuasiNewton,
        FallbackLevel::SteepestDescent,
        FallbackLevel::Random,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Whether this level solves a steering QP when steering is engaged.
    pub fn uses_steering(self) -> bool {
        matches!(self, Self::Steering | Self::SteeringIdentity)
    }
}

impl fmt::Display for FallbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Steering => "steering",
            Self::SteeringIdentity => "steering (identity)",
            Self::QuasiNewton => "quasi-Newton",
            Self::SteepestDescent => "steepest descent",
            Self::Random => "random",
        };
        write!(f, "{} ({})", self.index(), name)
    }
}

/// A direction produced at some fallback level.
#[derive(Debug, Clone)]
pub struct SearchDirection {
    pub d: Array1<f64>,
    pub level: FallbackLevel,
    /// Penalty parameter the direction was computed for; steering may lower it.
    pub mu: f64,
    /// Predicted violation reduction, when the direction came from steering.
    pub predicted_reduction: Option<f64>,
    /// Directional derivative of the penalty function at `mu`.
    pub gtd: f64,
    pub steering_engaged: bool,
}

impl SearchDirection {
    pub fn is_descent(&self) -> bool {
        self.gtd < 0.0
    }

    pub fn norm(&self) -> f64 {
        self.d.dot(&self.d).sqrt()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectionError {
    #[error("steering QP failed: {0}")]
    Qp(#[from] QpError),
    #[error("direction is not a descent direction (gᵀd = {gtd:.3e})")]
    NonDescent { gtd: f64, direction: Box<SearchDirection> },
    #[error("direction is zero or not finite")]
    Degenerate,
}

/// Everything a direction computation reads for one iterate.
///
/// The solver owns all of it; the context only borrows for the duration of a
/// call.
pub struct DirectionContext<'a> {
    pub iterate: &'a Iterate,
    pub hessian: &'a Array2<f64>,
    /// `hessian` with its condition number capped; used inside QPs.
    pub hessian_reg: &'a Array2<f64>,
    pub options: &'a Options,
    pub qp: &'a dyn QpSolver,
    pub steering_engaged: bool,
}

impl DirectionContext<'_> {
    /// Computes the direction for `level` at penalty parameter `mu`.
    ///
    /// When steering is not engaged, the steering levels compute their
    /// steering-free counterparts (quasi-Newton and steepest descent).
    /// A direction along which the penalty does not descend is an error unless
    /// non-descent line searches are allowed.
    pub fn compute(
        &self,
        level: FallbackLevel,
        mu: f64,
        rng: &mut ChaCha8Rng,
    ) -> Result<SearchDirection, DirectionError> {
        let mut predicted_reduction = None;
        let mut mu_out = mu;
        let mut d = match level {
            FallbackLevel::Steering | FallbackLevel::SteeringIdentity if self.steering_engaged => {
                let identity;
                let h = if level == FallbackLevel::Steering {
                    self.hessian_reg
                } else {
                    identity = Array2::<f64>::eye(self.iterate.dim());
                    &identity
                };
                let outcome = steering::steer(self.iterate, h, mu, self.options, self.qp)?;
                predicted_reduction = Some(outcome.predicted_reduction);
                mu_out = outcome.mu;
                outcome.direction
            }
            FallbackLevel::Steering | FallbackLevel::QuasiNewton => {
                -self.hessian.dot(&self.iterate.penalty_gradient_at(mu))
            }
            FallbackLevel::SteeringIdentity | FallbackLevel::SteepestDescent => {
                -self.iterate.penalty_gradient_at(mu)
            }
            FallbackLevel::Random => {
                Array1::from_shape_fn(self.iterate.dim(), |_| rng.gen_range(-1.0..=1.0))
            }
        };

        if d.iter().any(|v| !v.is_finite()) || d.iter().all(|v| *v == 0.0) {
            return Err(DirectionError::Degenerate);
        }

        let grad = self.iterate.penalty_gradient_at(mu_out);
        let mut gtd = grad.dot(&d);
        if level == FallbackLevel::Random && gtd > 0.0 {
            d.mapv_inplace(|v| -v);
            gtd = -gtd;
        }

        let direction = SearchDirection {
            d,
            level,
            mu: mu_out,
            predicted_reduction,
            gtd,
            steering_engaged: self.steering_engaged,
        };
        if !direction.is_descent() && self.options.linesearch_nondescent_maxit == 0 {
            log::debug!(
                "[Fallback] level {} produced a non-descent direction (gᵀd = {:.3e})",
                level,
                gtd
            );
            return Err(DirectionError::NonDescent {
                gtd,
                direction: Box::new(direction),
            });
        }
        Ok(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectionContext, DirectionError, FallbackLevel};
    use crate::options::Options;
    use crate::penalty::{Evaluation, Iterate};
    use crate::qp::{ClarabelQp, QpError, QpSolver, QuadraticProgram};
    use ndarray::{Array1, Array2, array};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use spectral::prelude::*;

    struct FailingQp;

    impl QpSolver for FailingQp {
        fn solve(&self, _qp: &QuadraticProgram) -> Result<Array1<f64>, QpError> {
            Err(QpError::Infeasible)
        }
    }

    fn bowl_iterate() -> Iterate {
        // f = x0^2 + 2 x1^2 at (1, 1)
        Iterate::new(
            array![1.0, 1.0],
            Evaluation::unconstrained(3.0, array![2.0, 4.0]),
            1.0,
        )
    }

    fn context<'a>(
        iterate: &'a Iterate,
        h: &'a Array2<f64>,
        options: &'a Options,
        qp: &'a dyn QpSolver,
        steering_engaged: bool,
    ) -> DirectionContext<'a> {
        DirectionContext {
            iterate,
            hessian: h,
            hessian_reg: h,
            options,
            qp,
            steering_engaged,
        }
    }

    #[test]
    fn level_indices_round_trip() {
        for level in FallbackLevel::ALL {
            assert_eq!(FallbackLevel::from_index(level.index()), Some(level));
        }
        assert_eq!(FallbackLevel::from_index(5), None);
        assert!(FallbackLevel::Steering < FallbackLevel::Random);
    }

    #[test]
    fn quasi_newton_direction_uses_h() {
        let it = bowl_iterate();
        let h = Array2::from_diag(&array![0.5, 0.25]);
        let opts = Options::default();
        let qp = ClarabelQp::default();
        let ctx = context(&it, &h, &opts, &qp, false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dir = ctx.compute(FallbackLevel::QuasiNewton, 1.0, &mut rng).unwrap();
        assert_that!(&dir.d[0]).is_close_to(-1.0, 1e-15);
        assert_that!(&dir.d[1]).is_close_to(-1.0, 1e-15);
        assert_that!(&dir.gtd).is_close_to(-6.0, 1e-15);
        assert!(dir.is_descent());
        assert!(dir.predicted_reduction.is_none());
    }

    #[test]
    fn steering_levels_degrade_without_steering() {
        let it = bowl_iterate();
        let h = Array2::from_diag(&array![0.5, 0.25]);
        let opts = Options::default();
        let ctx = context(&it, &h, &opts, &FailingQp, false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        // No QP is touched, so the failing solver never matters.
        let l0 = ctx.compute(FallbackLevel::Steering, 1.0, &mut rng).unwrap();
        assert_that!(&l0.d[1]).is_close_to(-1.0, 1e-15);
        let l1 = ctx.compute(FallbackLevel::SteeringIdentity, 1.0, &mut rng).unwrap();
        assert_that!(&l1.d[0]).is_close_to(-2.0, 1e-15);
        assert_that!(&l1.d[1]).is_close_to(-4.0, 1e-15);
    }

    #[test]
    fn steering_qp_failure_is_reported() {
        let eval = Evaluation::unconstrained(0.0, array![1.0, 0.0]).with_equalities(
            array![0.5],
            Array2::from_shape_vec((2, 1), vec![1.0, 1.0]).unwrap(),
        );
        let it = Iterate::new(array![0.0, 0.0], eval, 1.0);
        let h = Array2::eye(2);
        let opts = Options::default();
        let ctx = context(&it, &h, &opts, &FailingQp, true);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = ctx.compute(FallbackLevel::Steering, 1.0, &mut rng).unwrap_err();
        assert!(matches!(err, DirectionError::Qp(QpError::Infeasible)));
        // The quasi-Newton level does not depend on the QP.
        assert!(ctx.compute(FallbackLevel::QuasiNewton, 1.0, &mut rng).is_ok());
    }

    #[test]
    fn random_direction_is_sign_corrected() {
        let it = bowl_iterate();
        let h = Array2::eye(2);
        let opts = Options::default();
        let qp = ClarabelQp::default();
        let ctx = context(&it, &h, &opts, &qp, false);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..20 {
            let dir = ctx.compute(FallbackLevel::Random, 1.0, &mut rng).unwrap();
            assert!(dir.is_descent());
            assert!(dir.d.iter().all(|v| v.abs() <= 1.0));
        }
    }

    #[test]
    fn random_directions_are_reproducible() {
        let it = bowl_iterate();
        let h = Array2::eye(2);
        let opts = Options::default();
        let qp = ClarabelQp::default();
        let ctx = context(&it, &h, &opts, &qp, false);
        let a = ctx
            .compute(FallbackLevel::Random, 1.0, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        let b = ctx
            .compute(FallbackLevel::Random, 1.0, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        assert_eq!(a.d, b.d);
    }

    #[test]
    fn non_descent_is_rejected_unless_allowed() {
        let it = bowl_iterate();
        // An indefinite H flips the quasi-Newton step uphill.
        let h = Array2::from_diag(&array![-1.0, -1.0]);
        let qp = ClarabelQp::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let strict = Options::default();
        let ctx = context(&it, &h, &strict, &qp, false);
        let err = ctx.compute(FallbackLevel::QuasiNewton, 1.0, &mut rng).unwrap_err();
        assert!(matches!(err, DirectionError::NonDescent { gtd, .. } if gtd > 0.0));

        let lenient = Options::default().with_linesearch_nondescent_maxit(3);
        let ctx = context(&it, &h, &lenient, &qp, false);
        let dir = ctx.compute(FallbackLevel::QuasiNewton, 1.0, &mut rng).unwrap();
        assert!(!dir.is_descent());
    }

    #[test]
    fn zero_gradient_is_degenerate() {
        let it = Iterate::new(
            array![0.0, 0.0],
            Evaluation::unconstrained(0.0, array![0.0, 0.0]),
            1.0,
        );
        let h = Array2::eye(2);
        let opts = Options::default();
        let qp = ClarabelQp::default();
        let ctx = context(&it, &h, &opts, &qp, false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(matches!(
            ctx.compute(FallbackLevel::SteepestDescent, 1.0, &mut rng),
            Err(DirectionError::Degenerate)
        ));
    }
}
