//! The quadratic-program capability consumed by steering and the stationarity test.
//!
//! Every QP the solver builds is a small dense convex program over either a box
//! or the unit simplex. The solver only relies on the [`QpSolver`] contract, so
//! any implementation can be plugged in; [`ClarabelQp`] is the default.

use clarabel::algebra::CscMatrix;
use clarabel::solver::SupportedConeT::{self, *};
use clarabel::solver::implementations::default::DefaultSettingsBuilder;
use clarabel::solver::{DefaultSolver, IPSolver, SolverStatus};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};

/// Feasible set of a [`QuadraticProgram`].
#[derive(Debug, Clone)]
pub enum QpConstraints {
    /// `lower <= y <= upper`, componentwise.
    Box {
        lower: Array1<f64>,
        upper: Array1<f64>,
    },
    /// `y >= 0` and `Σ y = 1`.
    Simplex,
}

/// `minimize ½ yᵀ Q y + cᵀ y` over the given constraints.
#[derive(Debug, Clone)]
pub struct QuadraticProgram {
    pub hessian: Array2<f64>,
    pub linear: Array1<f64>,
    pub constraints: QpConstraints,
}

impl QuadraticProgram {
    pub fn dim(&self) -> usize {
        self.linear.len()
    }

    pub fn objective(&self, y: &Array1<f64>) -> f64 {
        0.5 * y.dot(&self.hessian.dot(y)) + self.linear.dot(y)
    }

    /// Euclidean projection onto the feasible set.
    pub fn project(&self, y: &Array1<f64>) -> Array1<f64> {
        match &self.constraints {
            QpConstraints::Box { lower, upper } => {
                let mut z = y.clone();
                for i in 0..z.len() {
                    z[i] = z[i].max(lower[i]).min(upper[i]);
                }
                z
            }
            QpConstraints::Simplex => project_simplex(y),
        }
    }

    // Some point of the feasible set.
    fn feasible_point(&self) -> Array1<f64> {
        let m = self.dim();
        match &self.constraints {
            QpConstraints::Box { .. } => self.project(&Array1::zeros(m)),
            QpConstraints::Simplex => Array1::from_elem(m, 1.0 / m as f64),
        }
    }

    fn validate(&self) -> Result<(), QpError> {
        let m = self.dim();
        if self.hessian.nrows() != m || self.hessian.ncols() != m {
            return Err(QpError::DimensionMismatch {
                expected: m,
                rows: self.hessian.nrows(),
                cols: self.hessian.ncols(),
            });
        }
        if let QpConstraints::Box { lower, upper } = &self.constraints {
            if lower.len() != m || upper.len() != m {
                return Err(QpError::DimensionMismatch {
                    expected: m,
                    rows: lower.len(),
                    cols: upper.len(),
                });
            }
            if lower.iter().zip(upper.iter()).any(|(l, u)| l > u) {
                return Err(QpError::Infeasible);
            }
        }
        if self.hessian.iter().any(|v| !v.is_finite()) || self.linear.iter().any(|v| !v.is_finite())
        {
            return Err(QpError::NonFiniteData);
        }
        Ok(())
    }
}

/// Why a QP could not be solved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QpError {
    #[error("QP dimensions disagree: expected {expected}, got {rows}x{cols}")]
    DimensionMismatch {
        expected: usize,
        rows: usize,
        cols: usize,
    },
    #[error("QP data contains NaN or infinite entries")]
    NonFiniteData,
    #[error("QP feasible set is empty")]
    Infeasible,
    #[error("QP solver rejected the problem: {0}")]
    Setup(String),
    #[error("QP solver stopped with status {status}")]
    Unsolved { status: String },
}

/// A black-box solver for [`QuadraticProgram`]s.
pub trait QpSolver {
    fn solve(&self, qp: &QuadraticProgram) -> Result<Array1<f64>, QpError>;
}

/// Interior-point QP solver backed by Clarabel, with an active-set polish.
///
/// The interior-point answer is accurate to the solver tolerance only, which is
/// too coarse for a stationarity measure compared against `opt_tol`. The polish
/// guesses the active set from that answer, solves the reduced KKT system
/// exactly and keeps the result when it is feasible and no worse.
#[derive(Debug, Clone)]
pub struct ClarabelQp {
    pub max_iterations: u32,
    pub tolerance: f64,
    /// Distance to a bound below which a component counts as active when polishing.
    pub active_tolerance: f64,
}

impl Default for ClarabelQp {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-9,
            active_tolerance: 1e-7,
        }
    }
}

impl ClarabelQp {
    pub fn new(max_iterations: u32, tolerance: f64) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            tolerance: tolerance.max(f64::EPSILON),
            ..Self::default()
        }
    }

    fn interior_point(&self, qp: &QuadraticProgram, scale: f64) -> Result<Array1<f64>, QpError> {
        let m = qp.dim();
        let hessian = upper_triangle(&qp.hessian, scale);
        let linear: Vec<f64> = qp.linear.iter().map(|v| v / scale).collect();
        let (rows, rhs, cones) = constraint_rows(qp);

        let mut builder = DefaultSettingsBuilder::default();
        builder
            .verbose(false)
            .max_iter(self.max_iterations)
            .tol_gap_abs(self.tolerance)
            .tol_gap_rel(self.tolerance)
            .tol_feas(self.tolerance);
        let settings = builder
            .build()
            .map_err(|err| QpError::Setup(format!("{err:?}")))?;
        let mut solver = DefaultSolver::new(&hessian, &linear, &rows, &rhs, &cones, settings);
        solver.solve();

        match solver.solution.status {
            SolverStatus::Solved => {}
            SolverStatus::AlmostSolved => {
                log::debug!("[QP] Clarabel reached reduced accuracy only (m = {})", m);
            }
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                return Err(QpError::Infeasible);
            }
            status => {
                return Err(QpError::Unsolved {
                    status: format!("{status:?}"),
                });
            }
        }
        let y = Array1::from_iter(solver.solution.x.iter().copied());
        if y.len() != m || y.iter().any(|v| !v.is_finite()) {
            return Err(QpError::NonFiniteData);
        }
        Ok(qp.project(&y))
    }

    fn polish(&self, qp: &QuadraticProgram, y: Array1<f64>) -> Array1<f64> {
        let candidate = match &qp.constraints {
            QpConstraints::Box { lower, upper } => self.polish_box(qp, &y, lower, upper),
            QpConstraints::Simplex => self.polish_simplex(qp, &y),
        };
        let current = qp.objective(&y);
        match candidate {
            Some(z) if qp.objective(&z) <= current + f64::EPSILON * (1.0 + current.abs()) => z,
            _ => y,
        }
    }

    // Fixes near-active components at their bounds and solves
    // `Q_FF z_F = -(c_F + Q_FB z_B)` for the free ones.
    fn polish_box(
        &self,
        qp: &QuadraticProgram,
        y: &Array1<f64>,
        lower: &Array1<f64>,
        upper: &Array1<f64>,
    ) -> Option<Array1<f64>> {
        let m = qp.dim();
        let mut z = y.clone();
        let mut free = Vec::with_capacity(m);
        for i in 0..m {
            if lower[i].is_finite() && y[i] - lower[i] <= self.active_tolerance * (1.0 + lower[i].abs())
            {
                z[i] = lower[i];
            } else if upper[i].is_finite()
                && upper[i] - y[i] <= self.active_tolerance * (1.0 + upper[i].abs())
            {
                z[i] = upper[i];
            } else {
                free.push(i);
            }
        }
        if free.is_empty() {
            return Some(z);
        }
        let k = free.len();
        let kkt = DMatrix::<f64>::from_fn(k, k, |a, b| qp.hessian[[free[a], free[b]]]);
        let rhs = DVector::<f64>::from_fn(k, |a, _| {
            let i = free[a];
            let mut r = -qp.linear[i];
            for j in 0..m {
                if !free.contains(&j) {
                    r -= qp.hessian[[i, j]] * z[j];
                }
            }
            r
        });
        let solution = kkt.lu().solve(&rhs)?;
        for (a, &i) in free.iter().enumerate() {
            let v = solution[a];
            if !v.is_finite() || v < lower[i] || v > upper[i] {
                return None;
            }
            z[i] = v;
        }
        Some(z)
    }

    // Solves the equality-constrained problem on the support of `y`:
    // `[Q_SS 1; 1ᵀ 0] [λ_S; ν] = [-c_S; 1]`.
    fn polish_simplex(&self, qp: &QuadraticProgram, y: &Array1<f64>) -> Option<Array1<f64>> {
        let support: Vec<usize> = (0..qp.dim())
            .filter(|&i| y[i] > self.active_tolerance)
            .collect();
        let k = support.len();
        if k == 0 {
            return None;
        }
        let kkt = DMatrix::<f64>::from_fn(k + 1, k + 1, |a, b| match (a < k, b < k) {
            (true, true) => qp.hessian[[support[a], support[b]]],
            (false, false) => 0.0,
            _ => 1.0,
        });
        let rhs = DVector::<f64>::from_fn(k + 1, |a, _| {
            if a < k { -qp.linear[support[a]] } else { 1.0 }
        });
        let solution = kkt.lu().solve(&rhs)?;
        let mut z = Array1::<f64>::zeros(qp.dim());
        for (a, &i) in support.iter().enumerate() {
            let v = solution[a];
            if !v.is_finite() || v < -self.active_tolerance {
                return None;
            }
            z[i] = v.max(0.0);
        }
        let total = z.sum();
        if total <= 0.0 {
            return None;
        }
        Some(z / total)
    }
}

impl QpSolver for ClarabelQp {
    fn solve(&self, qp: &QuadraticProgram) -> Result<Array1<f64>, QpError> {
        qp.validate()?;
        if qp.dim() == 0 {
            return Ok(Array1::zeros(0));
        }
        // Clarabel works on data of unit magnitude; the minimizer is scale invariant.
        let scale = qp
            .hessian
            .iter()
            .chain(qp.linear.iter())
            .fold(0.0f64, |acc, v| acc.max(v.abs()));
        if scale == 0.0 {
            return Ok(qp.feasible_point());
        }
        let y = self.interior_point(qp, scale)?;
        Ok(self.polish(qp, y))
    }
}

// Column-major sparse storage assembled one entry at a time, rows ascending.
struct CscColumns {
    rowval: Vec<Vec<usize>>,
    nzval: Vec<Vec<f64>>,
    n_rows: usize,
}

impl CscColumns {
    fn new(n_cols: usize) -> Self {
        Self {
            rowval: vec![Vec::new(); n_cols],
            nzval: vec![Vec::new(); n_cols],
            n_rows: 0,
        }
    }

    fn push(&mut self, row: usize, col: usize, value: f64) {
        self.rowval[col].push(row);
        self.nzval[col].push(value);
        self.n_rows = self.n_rows.max(row + 1);
    }

    fn build(self, n_rows: usize) -> CscMatrix<f64> {
        let n_cols = self.rowval.len();
        let mut colptr = Vec::with_capacity(n_cols + 1);
        colptr.push(0);
        for col in &self.rowval {
            let end = colptr[colptr.len() - 1] + col.len();
            colptr.push(end);
        }
        CscMatrix::new(
            n_rows.max(self.n_rows),
            n_cols,
            colptr,
            self.rowval.concat(),
            self.nzval.concat(),
        )
    }
}

// Upper triangle of `q / scale`, the form Clarabel expects for P.
fn upper_triangle(q: &Array2<f64>, scale: f64) -> CscMatrix<f64> {
    let m = q.nrows();
    let mut columns = CscColumns::new(m);
    for j in 0..m {
        for i in 0..=j {
            let v = q[[i, j]] / scale;
            if v != 0.0 {
                columns.push(i, j, v);
            }
        }
    }
    columns.build(m)
}

// `A y + s = b` with `s` in the returned cones.
fn constraint_rows(qp: &QuadraticProgram) -> (CscMatrix<f64>, Vec<f64>, Vec<SupportedConeT<f64>>) {
    let m = qp.dim();
    let mut columns = CscColumns::new(m);
    let mut rhs = Vec::new();
    let mut cones = Vec::new();
    match &qp.constraints {
        QpConstraints::Box { lower, upper } => {
            for i in 0..m {
                if upper[i].is_finite() {
                    columns.push(rhs.len(), i, 1.0);
                    rhs.push(upper[i]);
                }
                if lower[i].is_finite() {
                    columns.push(rhs.len(), i, -1.0);
                    rhs.push(-lower[i]);
                }
            }
            if !rhs.is_empty() {
                cones.push(NonnegativeConeT(rhs.len()));
            }
        }
        QpConstraints::Simplex => {
            for i in 0..m {
                columns.push(0, i, 1.0);
            }
            rhs.push(1.0);
            cones.push(ZeroConeT(1));
            for i in 0..m {
                columns.push(i + 1, i, -1.0);
                rhs.push(0.0);
            }
            cones.push(NonnegativeConeT(m));
        }
    }
    let n_rows = rhs.len();
    (columns.build(n_rows), rhs, cones)
}

/// Euclidean projection onto the unit simplex (sort-and-threshold).
fn project_simplex(y: &Array1<f64>) -> Array1<f64> {
    let m = y.len();
    if m == 0 {
        return y.clone();
    }
    let mut sorted: Vec<f64> = y.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (k, &v) in sorted.iter().enumerate() {
        cumulative += v;
        let candidate = (cumulative - 1.0) / (k as f64 + 1.0);
        if v - candidate > 0.0 {
            theta = candidate;
        }
    }
    y.mapv(|v| (v - theta).max(0.0))
}
