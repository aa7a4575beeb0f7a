//! Inverse-Hessian approximation: BFGS updates and condition-number regularization.

use nalgebra::DMatrix;
use nalgebra::linalg::SymmetricEigen;
use ndarray::{Array1, Array2};
use std::borrow::Cow;

/// Outcome of one BFGS update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BfgsUpdate {
    /// The secant pair was used as is.
    Applied,
    /// The step was damped toward `H y` before updating.
    Damped,
    /// `sᵀy` was not positive; H is unchanged.
    SkippedCurvature,
    /// The pair or the result contained non-finite values; H is unchanged.
    SkippedNonFinite,
}

impl BfgsUpdate {
    pub fn was_applied(self) -> bool {
        matches!(self, BfgsUpdate::Applied | BfgsUpdate::Damped)
    }
}

/// The persisted inverse-Hessian approximation of the penalty function.
#[derive(Debug, Clone)]
pub struct HessianApprox {
    h: Array2<f64>,
    scale_h0: bool,
    damping: f64,
    applied: usize,
    skipped: usize,
}

impl HessianApprox {
    /// Starts from the identity.
    pub fn identity(n: usize, scale_h0: bool, damping: f64) -> Self {
        Self {
            h: Array2::eye(n),
            scale_h0,
            damping: damping.clamp(0.0, 1.0),
            applied: 0,
            skipped: 0,
        }
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.h
    }

    pub fn updates_applied(&self) -> usize {
        self.applied
    }

    pub fn updates_skipped(&self) -> usize {
        self.skipped
    }

    /// Applies the inverse BFGS update for the secant pair `(s, y)`.
    ///
    /// The pair is rejected, leaving H untouched, unless `sᵀy > 0`. Accepted
    /// pairs with weak curvature (`sᵀy < damping · yᵀHy`) are damped by moving
    /// `s` toward `H y`.
    pub fn update(&mut self, s: &Array1<f64>, y: &Array1<f64>) -> BfgsUpdate {
        let n = self.h.nrows();
        if s.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            self.skipped += 1;
            return BfgsUpdate::SkippedNonFinite;
        }
        let sty = s.dot(y);
        let scale = s.dot(s).sqrt() * y.dot(y).sqrt();
        if !(sty > f64::EPSILON * scale) {
            self.skipped += 1;
            log::debug!("[BFGS] update skipped: sᵀy = {:.3e} <= 0", sty);
            return BfgsUpdate::SkippedCurvature;
        }

        let mut h = if self.scale_h0 && self.applied == 0 {
            let yty = y.dot(y);
            &self.h * (sty / yty)
        } else {
            self.h.clone()
        };

        let mut status = BfgsUpdate::Applied;
        let hy = h.dot(y);
        let yhy = y.dot(&hy);
        let mut s_used = s.clone();
        let mut sty_used = sty;
        if self.damping > 0.0 && sty < self.damping * yhy {
            let theta = (1.0 - self.damping) * yhy / (yhy - sty);
            s_used = s * theta + &hy * (1.0 - theta);
            sty_used = s_used.dot(y);
            status = BfgsUpdate::Damped;
        }

        // H+ = H + ((sᵀy + yᵀHy) / (sᵀy)²) s sᵀ - (H y sᵀ + s yᵀ H) / sᵀy
        let rho = 1.0 / sty_used;
        let coeff = (sty_used + yhy) * rho * rho;
        for i in 0..n {
            for j in 0..n {
                h[[i, j]] += coeff * s_used[i] * s_used[j]
                    - rho * (hy[i] * s_used[j] + s_used[i] * hy[j]);
            }
        }
        symmetrize(&mut h);

        if h.iter().any(|v| !v.is_finite()) {
            self.skipped += 1;
            return BfgsUpdate::SkippedNonFinite;
        }
        self.h = h;
        self.applied += 1;
        status
    }
}

/// Makes a square matrix exactly symmetric by averaging it with its transpose.
pub fn symmetrize(a: &mut Array2<f64>) {
    let n = a.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let v = 0.5 * (a[[i, j]] + a[[j, i]]);
            a[[i, j]] = v;
            a[[j, i]] = v;
        }
    }
}

/// Symmetric eigen-decomposition `a = V diag(λ) Vᵀ`, computed by nalgebra.
pub fn symmetric_eigen(a: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    let m = DMatrix::<f64>::from_fn(n, n, |i, j| 0.5 * (a[[i, j]] + a[[j, i]]));
    let eig = SymmetricEigen::new(m);
    let values = Array1::from_iter(eig.eigenvalues.iter().copied());
    let vectors = Array2::from_shape_fn((n, n), |(i, j)| eig.eigenvectors[(i, j)]);
    (values, vectors)
}

/// Ratio of the largest to the smallest eigenvalue magnitude.
pub fn condition_number(a: &Array2<f64>) -> f64 {
    let n = a.nrows();
    let m = DMatrix::<f64>::from_fn(n, n, |i, j| 0.5 * (a[[i, j]] + a[[j, i]]));
    let values = Array1::from_iter(m.symmetric_eigenvalues().iter().copied());
    magnitude_ratio(&values)
}

fn magnitude_ratio(values: &Array1<f64>) -> f64 {
    let max_abs = values.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let min_abs = values.iter().fold(f64::INFINITY, |acc, v| acc.min(v.abs()));
    if values.is_empty() {
        1.0
    } else if min_abs == 0.0 {
        f64::INFINITY
    } else {
        max_abs / min_abs
    }
}

/// Returns a copy of `h` whose condition number does not exceed `threshold`.
///
/// With an infinite threshold `h` is returned as is, without an eigen-decomposition.
/// By default the smallest-magnitude eigenvalues are raised to `λ_max / threshold`;
/// with `lower_max_eigenvalues` the largest magnitudes are lowered to
/// `threshold · |λ|_min` instead, keeping their sign, unless some eigenvalue is exactly zero, in which
/// case raising is used for this call. The stored approximation is never touched.
pub fn regularize(
    h: &Array2<f64>,
    threshold: f64,
    lower_max_eigenvalues: bool,
) -> Cow<'_, Array2<f64>> {
    if threshold.is_infinite() || h.nrows() == 0 {
        return Cow::Borrowed(h);
    }
    let threshold = threshold.max(1.0);
    let (mut values, vectors) = symmetric_eigen(h);
    if magnitude_ratio(&values) <= threshold {
        return Cow::Borrowed(h);
    }

    let has_zero = values.iter().any(|v| *v == 0.0);
    if lower_max_eigenvalues && !has_zero {
        let min_abs = values.iter().fold(f64::INFINITY, |acc, v| acc.min(v.abs()));
        let cap = threshold * min_abs;
        values.mapv_inplace(|v| if v.abs() > cap { cap.copysign(v) } else { v });
    } else {
        if lower_max_eigenvalues {
            log::debug!("[BFGS] zero eigenvalue in H; raising smallest eigenvalues instead");
        }
        let max_val = values.iter().fold(f64::NEG_INFINITY, |acc, v| acc.max(*v));
        let floor = max_val / threshold;
        values.mapv_inplace(|v| if v < floor { floor } else { v });
    }

    let n = h.nrows();
    let mut out = Array2::<f64>::zeros((n, n));
    for k in 0..n {
        let lambda = values[k];
        for i in 0..n {
            let vik = vectors[[i, k]] * lambda;
            for j in 0..n {
                out[[i, j]] += vik * vectors[[j, k]];
            }
        }
    }
    symmetrize(&mut out);
    Cow::Owned(out)
}
