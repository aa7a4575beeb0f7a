//! Steering: biasing the search direction toward feasibility.
//!
//! Steering solves the dual of the penalty QP model and lowers the penalty
//! parameter until the direction is predicted to remove a fixed fraction of the
//! violation that a pure feasibility direction would remove.

use crate::options::Options;
use crate::penalty::Iterate;
use crate::qp::{QpConstraints, QpError, QpSolver, QuadraticProgram};
use ndarray::{Array1, Array2};

/// Decides whether steering is used at this iterate.
///
/// Unconstrained problems never steer. Any equality constraint makes steering
/// unconditional, as does an infinite margin. Otherwise steering is engaged once
/// some inequality satisfies `cᵢ >= -margin`.
pub fn is_engaged(iterate: &Iterate, margin: f64) -> bool {
    if !iterate.is_constrained() {
        return false;
    }
    if iterate.n_eq() > 0 || margin.is_infinite() {
        return true;
    }
    iterate.ci.iter().any(|&c| c >= -margin)
}

/// Result of a steering computation.
#[derive(Debug, Clone)]
pub struct SteeringOutcome {
    pub direction: Array1<f64>,
    /// Penalty parameter that produced `direction`; never above the input.
    pub mu: f64,
    pub predicted_reduction: f64,
    /// Reduction predicted for the pure feasibility direction (μ = 0).
    pub reference_reduction: f64,
    pub shrinks: usize,
    /// Whether the target fraction of the reference reduction was met.
    pub adequate: bool,
}

// The pieces of the steering QP that do not depend on μ.
struct SteeringModel<'a> {
    iterate: &'a Iterate,
    c: Array1<f64>,
    h_jac: Array2<f64>,
    dual_hessian: Array2<f64>,
    h_fgrad: Array1<f64>,
    jt_h_fgrad: Array1<f64>,
    lower: Array1<f64>,
    upper: Array1<f64>,
    l1: bool,
}

impl<'a> SteeringModel<'a> {
    fn new(iterate: &'a Iterate, h: &Array2<f64>, l1: bool) -> Self {
        let jac = iterate.stacked_jacobian();
        let h_jac = h.dot(&jac);
        let mut dual_hessian = jac.t().dot(&h_jac);
        crate::hessian::symmetrize(&mut dual_hessian);
        let h_fgrad = h.dot(&iterate.f_grad);
        let jt_h_fgrad = jac.t().dot(&h_fgrad);
        let m = jac.ncols();
        let mut lower = Array1::<f64>::zeros(m);
        for k in iterate.n_ineq()..m {
            lower[k] = -1.0;
        }
        Self {
            iterate,
            c: iterate.stacked_constraints(),
            h_jac,
            dual_hessian,
            h_fgrad,
            jt_h_fgrad,
            lower,
            upper: Array1::ones(m),
            l1,
        }
    }

    fn direction(&self, mu: f64, qp: &dyn QpSolver) -> Result<Array1<f64>, QpError> {
        let program = QuadraticProgram {
            hessian: self.dual_hessian.clone(),
            linear: &self.jt_h_fgrad * mu - &self.c,
            constraints: QpConstraints::Box {
                lower: self.lower.clone(),
                upper: self.upper.clone(),
            },
        };
        let y = qp.solve(&program)?;
        let d = -(&self.h_fgrad * mu + self.h_jac.dot(&y));
        if d.iter().any(|v| !v.is_finite()) {
            return Err(QpError::NonFiniteData);
        }
        Ok(d)
    }

    fn predicted_reduction(&self, d: &Array1<f64>) -> f64 {
        self.iterate.violation(self.l1) - self.iterate.linearized_violation(d, self.l1)
    }
}

/// Computes a steered direction at `iterate` using the curvature matrix `h`.
///
/// `mu` is shrunk by `steering_c_mu` until the predicted violation reduction
/// reaches `steering_c_viol` times the reference, at most `steering_maxit` times.
/// When the cap is hit the direction with the largest predicted reduction is
/// returned. A QP failure aborts steering and is reported to the caller.
pub fn steer(
    iterate: &Iterate,
    h: &Array2<f64>,
    mu: f64,
    options: &Options,
    qp: &dyn QpSolver,
) -> Result<SteeringOutcome, QpError> {
    let model = SteeringModel::new(iterate, h, options.steering_l1_model);
    let reference = model.direction(0.0, qp)?;
    let reference_reduction = model.predicted_reduction(&reference);
    let target = options.steering_c_viol * reference_reduction;

    let mut mu_k = mu;
    let mut best: Option<SteeringOutcome> = None;
    for shrinks in 0..=options.steering_maxit {
        let d = model.direction(mu_k, qp)?;
        let reduction = model.predicted_reduction(&d);
        if reduction >= target {
            return Ok(SteeringOutcome {
                direction: d,
                mu: mu_k,
                predicted_reduction: reduction,
                reference_reduction,
                shrinks,
                adequate: true,
            });
        }
        let improves = best
            .as_ref()
            .is_none_or(|b| reduction > b.predicted_reduction);
        if improves {
            best = Some(SteeringOutcome {
                direction: d,
                mu: mu_k,
                predicted_reduction: reduction,
                reference_reduction,
                shrinks,
                adequate: false,
            });
        }
        if shrinks < options.steering_maxit {
            mu_k *= options.steering_c_mu;
        }
    }

    match best {
        Some(outcome) => {
            log::warn!(
                "[Steering] predicted reduction {:.3e} below target {:.3e} after {} shrinks; keeping best direction (mu = {:.3e})",
                outcome.predicted_reduction,
                target,
                options.steering_maxit,
                outcome.mu
            );
            Ok(outcome)
        }
        None => Err(QpError::Unsolved {
            status: String::from("no steering direction"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{is_engaged, steer};
    use crate::options::Options;
    use crate::penalty::{Evaluation, Iterate};
    use crate::qp::ClarabelQp;
    use ndarray::{Array1, Array2, array};
    use spectral::prelude::*;

    // f = x0, c = 1 - x0 <= 0, evaluated at x.
    fn halfplane(x: Array1<f64>, mu: f64) -> Iterate {
        let c = 1.0 - x[0];
        let eval = Evaluation::unconstrained(x[0], array![1.0, 0.0]).with_inequalities(
            array![c],
            Array2::from_shape_vec((2, 1), vec![-1.0, 0.0]).unwrap(),
        );
        Iterate::new(x, eval, mu)
    }

    #[test]
    fn unconstrained_never_steers() {
        let it = Iterate::new(
            array![1.0, 2.0],
            Evaluation::unconstrained(5.0, array![2.0, 4.0]),
            1.0,
        );
        assert!(!is_engaged(&it, f64::INFINITY));
        assert!(!is_engaged(&it, 0.0));
    }

    #[test]
    fn inequality_margin_controls_engagement() {
        // c = 1 - 1.5 = -0.5
        let it = halfplane(array![1.5, 0.0], 1.0);
        assert!(!is_engaged(&it, 0.0));
        assert!(!is_engaged(&it, 0.4));
        assert!(is_engaged(&it, 0.5));
        assert!(is_engaged(&it, f64::INFINITY));
        // Exactly active
        assert!(is_engaged(&halfplane(array![1.0, 0.0], 1.0), 0.0));
    }

    #[test]
    fn equalities_always_steer() {
        let eval = Evaluation::unconstrained(0.0, array![0.0, 0.0]).with_equalities(
            array![0.0],
            Array2::from_shape_vec((2, 1), vec![1.0, 1.0]).unwrap(),
        );
        let it = Iterate::new(array![0.0, 0.0], eval, 1.0);
        assert!(is_engaged(&it, 0.0));
    }

    #[test]
    fn steering_shrinks_mu_until_violation_progress() {
        // At x = 0 the reference direction removes the whole unit violation and
        // the μ-direction removes 1 - μ of it, so μ must fall below 0.9.
        let it = halfplane(array![0.0, 0.0], 1.0);
        let out = steer(
            &it,
            &Array2::eye(2),
            1.0,
            &Options::default(),
            &ClarabelQp::default(),
        )
        .unwrap();
        assert!(out.adequate);
        assert_that!(&out.reference_reduction).is_close_to(1.0, 1e-10);
        assert_that(&out.shrinks).is_equal_to(2);
        assert_that!(&out.mu).is_close_to(0.81, 1e-12);
        assert_that!(&out.direction[0]).is_close_to(0.19, 1e-9);
        assert_that!(&out.direction[1]).is_close_to(0.0, 1e-12);
    }

    #[test]
    fn capped_steering_keeps_best_direction() {
        let it = halfplane(array![0.0, 0.0], 1.0);
        let opts = Options::default().with_steering(0, 0.1, 0.9);
        let out = steer(&it, &Array2::eye(2), 1.0, &opts, &ClarabelQp::default())
            .unwrap();
        assert!(!out.adequate);
        assert_that!(&out.mu).is_close_to(1.0, 1e-15);
    }

    #[test]
    fn feasible_point_keeps_mu() {
        // Far inside the feasible region nothing needs to be removed.
        let it = halfplane(array![3.0, 0.0], 0.5);
        let out = steer(
            &it,
            &Array2::eye(2),
            0.5,
            &Options::default(),
            &ClarabelQp::default(),
        )
        .unwrap();
        assert!(out.adequate);
        assert_that!(&out.mu).is_close_to(0.5, 1e-15);
        assert_that!(&out.direction[0]).is_close_to(-0.5, 1e-9);
    }
}
