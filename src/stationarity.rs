//! Approximate stationarity from a bundle of nearby gradients.
//!
//! At a kink of a nonsmooth function no single gradient vanishes, but a convex
//! combination of gradients sampled close to the point does. The measure is the
//! norm of the smallest such combination, in the metric of the regularized
//! BFGS matrix.

use crate::penalty::Iterate;
use crate::qp::{QpConstraints, QpSolver, QuadraticProgram};
use ndarray::{Array1, Array2};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct Sample {
    x: Array1<f64>,
    f_grad: Array1<f64>,
    violation_grad: Array1<f64>,
}

impl Sample {
    fn penalty_gradient(&self, mu: f64) -> Array1<f64> {
        &self.f_grad * mu + &self.violation_grad
    }
}

/// The stationarity measure and how it was obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stationarity {
    pub value: f64,
    /// Number of gradients that entered the combination.
    pub samples: usize,
    /// The QP failed and only the current gradient was used.
    pub qp_failed: bool,
}

/// The most recent accepted gradients, oldest first.
#[derive(Debug, Clone)]
pub struct GradientBundle {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl GradientBundle {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Adds the gradients of an accepted iterate, evicting the oldest sample when full.
    pub fn push(&mut self, iterate: &Iterate) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            x: iterate.x.clone(),
            f_grad: iterate.f_grad.clone(),
            violation_grad: iterate.penalty_gradient_at(0.0),
        });
    }

    /// Computes the measure at `current` using samples within `evaldist` of it.
    ///
    /// Gradients are re-weighted to the current penalty parameter. The current
    /// point always contributes, whether or not it was pushed.
    pub fn measure(
        &self,
        current: &Iterate,
        h_reg: &Array2<f64>,
        evaldist: f64,
        qp: &dyn QpSolver,
    ) -> Stationarity {
        let mu = current.mu;
        let mut columns: Vec<Array1<f64>> = vec![current.penalty_grad.clone()];
        for sample in &self.samples {
            let diff = &sample.x - &current.x;
            let dist = diff.dot(&diff).sqrt();
            if dist <= evaldist && dist > 0.0 {
                columns.push(sample.penalty_gradient(mu));
            }
        }

        let single = || {
            let hg = h_reg.dot(&current.penalty_grad);
            hg.dot(&hg).sqrt()
        };
        if columns.len() == 1 {
            return Stationarity {
                value: single(),
                samples: 1,
                qp_failed: false,
            };
        }

        let n = current.dim();
        let p = columns.len();
        let mut g = Array2::<f64>::zeros((n, p));
        for (j, col) in columns.iter().enumerate() {
            g.column_mut(j).assign(col);
        }
        let hg = h_reg.dot(&g);
        let mut hessian = g.t().dot(&hg);
        crate::hessian::symmetrize(&mut hessian);
        let program = QuadraticProgram {
            hessian,
            linear: Array1::zeros(p),
            constraints: QpConstraints::Simplex,
        };
        match qp.solve(&program) {
            Ok(lambda) => {
                // The current gradient alone is a vertex of the simplex, so the
                // combination can never be worse than it.
                let d = hg.dot(&lambda);
                Stationarity {
                    value: d.dot(&d).sqrt().min(single()),
                    samples: p,
                    qp_failed: false,
                }
            }
            Err(err) => {
                log::warn!(
                    "[BFGS-SQP] stationarity QP failed ({}); using the current gradient only",
                    err
                );
                Stationarity {
                    value: single(),
                    samples: 1,
                    qp_failed: true,
                }
            }
        }
    }
}
