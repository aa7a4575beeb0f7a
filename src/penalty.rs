//! Problem evaluations, iterates and the exact penalty function.
//!
//! The solver minimizes the penalty function
//! `φ(x; μ) = μ f(x) + Σ max(cᵢ(x), 0) + Σ |cₑ(x)|`,
//! whose minimizers coincide with those of the constrained problem once μ is
//! small enough. Only the objective part depends on μ, so an [`Iterate`] can be
//! re-weighted without calling back into user code.

use ndarray::{Array1, Array2};

/// Values and (sub)gradients returned by the user at a point.
///
/// Jacobians are stored column-wise: `ci_grad` has shape `n x m_i` and column
/// `j` is the gradient of inequality `j`. Inequalities are feasible when
/// `ci <= 0`.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub f: f64,
    pub f_grad: Array1<f64>,
    pub ci: Array1<f64>,
    pub ci_grad: Array2<f64>,
    pub ce: Array1<f64>,
    pub ce_grad: Array2<f64>,
}

impl Evaluation {
    /// An evaluation of a problem without constraints.
    pub fn unconstrained(f: f64, f_grad: Array1<f64>) -> Self {
        let n = f_grad.len();
        Self {
            f,
            f_grad,
            ci: Array1::zeros(0),
            ci_grad: Array2::zeros((n, 0)),
            ce: Array1::zeros(0),
            ce_grad: Array2::zeros((n, 0)),
        }
    }

    /// Attaches inequality constraint values and their Jacobian (`n x m_i`).
    pub fn with_inequalities(mut self, ci: Array1<f64>, ci_grad: Array2<f64>) -> Self {
        self.ci = ci;
        self.ci_grad = ci_grad;
        self
    }

    /// Attaches equality constraint values and their Jacobian (`n x m_e`).
    pub fn with_equalities(mut self, ce: Array1<f64>, ce_grad: Array2<f64>) -> Self {
        self.ce = ce;
        self.ce_grad = ce_grad;
        self
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.f.is_finite()
            && self.f_grad.iter().all(|v| v.is_finite())
            && self.ci.iter().all(|v| v.is_finite())
            && self.ci_grad.iter().all(|v| v.is_finite())
            && self.ce.iter().all(|v| v.is_finite())
            && self.ce_grad.iter().all(|v| v.is_finite())
    }

    pub(crate) fn has_shape(&self, n: usize) -> bool {
        self.f_grad.len() == n
            && self.ci_grad.nrows() == n
            && self.ci_grad.ncols() == self.ci.len()
            && self.ce_grad.nrows() == n
            && self.ce_grad.ncols() == self.ce.len()
    }
}

/// Total violation in the 1-norm: `Σ max(cᵢ, 0) + Σ |cₑ|`.
pub fn violation_l1(ci: &Array1<f64>, ce: &Array1<f64>) -> f64 {
    ci.iter().map(|v| v.max(0.0)).sum::<f64>() + ce.iter().map(|v| v.abs()).sum::<f64>()
}

/// Total violation in the infinity norm: `max(max(cᵢ, 0), |cₑ|)`.
pub fn violation_linf(ci: &Array1<f64>, ce: &Array1<f64>) -> f64 {
    let vi = ci.iter().fold(0.0f64, |acc, v| acc.max(*v));
    ce.iter().fold(vi, |acc, v| acc.max(v.abs()))
}

/// A point together with everything the solver knows about it.
///
/// Recorded iterates are never mutated; the solver re-weights its own working
/// copy when the penalty parameter changes.
#[derive(Debug, Clone)]
pub struct Iterate {
    pub x: Array1<f64>,
    pub f: f64,
    pub f_grad: Array1<f64>,
    pub ci: Array1<f64>,
    pub ci_grad: Array2<f64>,
    pub ce: Array1<f64>,
    pub ce_grad: Array2<f64>,
    /// Penalty parameter the penalty fields were computed with.
    pub mu: f64,
    /// Value of the penalty function at `mu`.
    pub penalty: f64,
    /// Gradient of the penalty function at `mu`.
    pub penalty_grad: Array1<f64>,
    /// Largest inequality violation.
    pub tvi: f64,
    /// Largest equality violation.
    pub tve: f64,
    /// 1-norm of the total violation.
    pub tv_l1: f64,
    violation_grad: Array1<f64>,
}

impl Iterate {
    pub fn new(x: Array1<f64>, eval: Evaluation, mu: f64) -> Self {
        let n = x.len();
        let mut violation_grad = Array1::<f64>::zeros(n);
        for (j, &c) in eval.ci.iter().enumerate() {
            if c > 0.0 {
                violation_grad += &eval.ci_grad.column(j);
            }
        }
        for (j, &c) in eval.ce.iter().enumerate() {
            if c > 0.0 {
                violation_grad += &eval.ce_grad.column(j);
            } else if c < 0.0 {
                violation_grad -= &eval.ce_grad.column(j);
            }
        }
        let tvi = eval.ci.iter().fold(0.0f64, |acc, v| acc.max(*v));
        let tve = eval.ce.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
        let tv_l1 = violation_l1(&eval.ci, &eval.ce);
        let penalty = mu * eval.f + tv_l1;
        let penalty_grad = &eval.f_grad * mu + &violation_grad;
        Self {
            x,
            f: eval.f,
            f_grad: eval.f_grad,
            ci: eval.ci,
            ci_grad: eval.ci_grad,
            ce: eval.ce,
            ce_grad: eval.ce_grad,
            mu,
            penalty,
            penalty_grad,
            tvi,
            tve,
            tv_l1,
            violation_grad,
        }
    }

    pub fn dim(&self) -> usize {
        self.x.len()
    }

    pub fn n_ineq(&self) -> usize {
        self.ci.len()
    }

    pub fn n_eq(&self) -> usize {
        self.ce.len()
    }

    pub fn is_constrained(&self) -> bool {
        self.n_ineq() + self.n_eq() > 0
    }

    /// Largest violation over all constraints.
    pub fn tv(&self) -> f64 {
        self.tvi.max(self.tve)
    }

    pub fn is_feasible(&self, viol_ineq_tol: f64, viol_eq_tol: f64) -> bool {
        self.tvi <= viol_ineq_tol && self.tve <= viol_eq_tol
    }

    /// Penalty value at another penalty parameter.
    pub fn penalty_at(&self, mu: f64) -> f64 {
        mu * self.f + self.tv_l1
    }

    /// Penalty gradient at another penalty parameter.
    pub fn penalty_gradient_at(&self, mu: f64) -> Array1<f64> {
        &self.f_grad * mu + &self.violation_grad
    }

    /// Re-weights the penalty fields for a new penalty parameter.
    pub fn set_penalty_parameter(&mut self, mu: f64) {
        self.mu = mu;
        self.penalty = self.penalty_at(mu);
        self.penalty_grad = self.penalty_gradient_at(mu);
    }

    /// All constraint values stacked as `[ci; ce]`.
    pub(crate) fn stacked_constraints(&self) -> Array1<f64> {
        let mut c = Array1::<f64>::zeros(self.n_ineq() + self.n_eq());
        c.slice_mut(ndarray::s![..self.n_ineq()]).assign(&self.ci);
        c.slice_mut(ndarray::s![self.n_ineq()..]).assign(&self.ce);
        c
    }

    /// All constraint gradients stacked column-wise as `[ci_grad ce_grad]`.
    pub(crate) fn stacked_jacobian(&self) -> Array2<f64> {
        let n = self.dim();
        let mut j = Array2::<f64>::zeros((n, self.n_ineq() + self.n_eq()));
        j.slice_mut(ndarray::s![.., ..self.n_ineq()])
            .assign(&self.ci_grad);
        j.slice_mut(ndarray::s![.., self.n_ineq()..])
            .assign(&self.ce_grad);
        j
    }

    /// Violation of the constraints linearized at this point, evaluated at `x + d`.
    pub fn linearized_violation(&self, d: &Array1<f64>, l1: bool) -> f64 {
        let ci_lin = &self.ci + &self.ci_grad.t().dot(d);
        let ce_lin = &self.ce + &self.ce_grad.t().dot(d);
        if l1 {
            violation_l1(&ci_lin, &ce_lin)
        } else {
            violation_linf(&ci_lin, &ce_lin)
        }
    }

    /// Violation of the constraints at this point in the chosen model.
    pub fn violation(&self, l1: bool) -> f64 {
        if l1 { self.tv_l1 } else { self.tv() }
    }
}

#[cfg(test)]
mod tests {
    use super::{Evaluation, Iterate, violation_l1, violation_linf};
    use ndarray::{Array2, array};
    use spectral::prelude::*;

    fn one_of_each() -> Iterate {
        // f = x0 + x1, ci = [x0 - 1, -x1], ce = [x0 * x1 - 2]
        let x = array![2.0, 3.0];
        let eval = Evaluation::unconstrained(5.0, array![1.0, 1.0])
            .with_inequalities(
                array![1.0, -3.0],
                Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, -1.0]).unwrap(),
            )
            .with_equalities(
                array![4.0],
                Array2::from_shape_vec((2, 1), vec![3.0, 2.0]).unwrap(),
            );
        Iterate::new(x, eval, 0.5)
    }

    #[test]
    fn violation_measures() {
        let ci = array![1.0, -3.0, 0.5];
        let ce = array![-2.0];
        assert_that!(&violation_l1(&ci, &ce)).is_close_to(3.5, 1e-15);
        assert_that!(&violation_linf(&ci, &ce)).is_close_to(2.0, 1e-15);
    }

    #[test]
    fn penalty_combines_objective_and_violation() {
        let it = one_of_each();
        assert_that!(&it.tv_l1).is_close_to(5.0, 1e-15);
        assert_that!(&it.penalty).is_close_to(0.5 * 5.0 + 5.0, 1e-15);
        // 0.5 * [1, 1] + column 0 of ci_grad + column 0 of ce_grad
        assert_that!(&it.penalty_grad[0]).is_close_to(0.5 + 1.0 + 3.0, 1e-15);
        assert_that!(&it.penalty_grad[1]).is_close_to(0.5 + 0.0 + 2.0, 1e-15);
        assert!(!it.is_feasible(0.0, 1e-6));
        assert_that!(&it.tv()).is_close_to(4.0, 1e-15);
    }

    #[test]
    fn reweighting_only_touches_objective_part() {
        let mut it = one_of_each();
        it.set_penalty_parameter(0.1);
        assert_that!(&it.penalty).is_close_to(0.1 * 5.0 + 5.0, 1e-15);
        assert_that!(&it.penalty_grad[0]).is_close_to(0.1 + 4.0, 1e-15);
        assert_that!(&it.penalty_grad[1]).is_close_to(0.1 + 2.0, 1e-15);
    }

    #[test]
    fn linearized_violation_at_zero_step_matches_violation() {
        let it = one_of_each();
        let zero = array![0.0, 0.0];
        assert_that!(&it.linearized_violation(&zero, true)).is_close_to(it.tv_l1, 1e-15);
        assert_that!(&it.linearized_violation(&zero, false)).is_close_to(it.tv(), 1e-15);
        // Moving along -x0 reduces both the first inequality and the equality.
        let d = array![-1.0, 0.0];
        assert_that!(&it.linearized_violation(&d, true)).is_close_to(1.0, 1e-15);
    }

    #[test]
    fn stacked_views_keep_order() {
        let it = one_of_each();
        let c = it.stacked_constraints();
        assert_eq!(c.to_vec(), vec![1.0, -3.0, 4.0]);
        let j = it.stacked_jacobian();
        assert_eq!(j.shape(), &[2, 3]);
        assert_that!(&j[[0, 2]]).is_close_to(3.0, 1e-15);
    }
}
