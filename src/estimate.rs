//! Entry points: validate the inputs, run both phases, assemble the gradient.

use crate::adjoint::{LogDetAdjoint, reverse_cholesky_log_det};
use crate::linalg::faer_ndarray::FaerLinalgError;
use crate::linalg::utils::{all_finite, lower_triangle_finite};
use crate::sensitivity::{
    derivative_matrices, projected_coefficient_gradient, row_quadratic_forms,
};
use crate::types::{DerivativeStrategy, LogDetGradOptions, LogDetGradient};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogDetGradError {
    #[error("Dimension mismatch in {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Cholesky factor is singular: |L({index},{index})| = {value:.3e} is not above the tolerance {threshold:.3e}."
    )]
    SingularFactor {
        index: usize,
        value: f64,
        threshold: f64,
    },

    #[error("Degenerate problem size r = {0}: the Hessian must have at least one row.")]
    DegenerateSize(usize),

    #[error("Input {0} contains non-finite values.")]
    NonFiniteInput(&'static str),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// Shapes shared by a validated call.
#[derive(Debug, Clone, Copy)]
struct ProblemDims {
    r: usize,
    n: usize,
    p: usize,
}

fn expect_len(what: &'static str, expected: usize, found: usize) -> Result<(), LogDetGradError> {
    if expected != found {
        return Err(LogDetGradError::DimensionMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

pub(crate) fn validate_options(options: &LogDetGradOptions) -> Result<(), LogDetGradError> {
    let tol = options.singular_tolerance;
    if !tol.is_finite() || tol < 0.0 {
        return Err(LogDetGradError::InvalidOptions(format!(
            "singular_tolerance must be finite and non-negative, got {tol}"
        )));
    }
    Ok(())
}

fn validate_inputs(
    l: ArrayView2<'_, f64>,
    s: ArrayView2<'_, f64>,
    x: ArrayView2<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
    tau: f64,
    check_finite: bool,
) -> Result<ProblemDims, LogDetGradError> {
    let (n, r) = s.dim();
    let p = x.ncols();

    expect_len("rows of L", r, l.nrows())?;
    expect_len("columns of L", r, l.ncols())?;
    if r == 0 {
        return Err(LogDetGradError::DegenerateSize(r));
    }
    expect_len("rows of X", n, x.nrows())?;
    expect_len("length of mu", n, mu.len())?;
    expect_len("length of wt", n, wt.len())?;

    if check_finite {
        if !lower_triangle_finite(&l) {
            return Err(LogDetGradError::NonFiniteInput("L"));
        }
        if !all_finite(&s) {
            return Err(LogDetGradError::NonFiniteInput("S"));
        }
        if !all_finite(&x) {
            return Err(LogDetGradError::NonFiniteInput("X"));
        }
        if !all_finite(&mu) {
            return Err(LogDetGradError::NonFiniteInput("mu"));
        }
        if !all_finite(&wt) {
            return Err(LogDetGradError::NonFiniteInput("wt"));
        }
        if !tau.is_finite() {
            return Err(LogDetGradError::NonFiniteInput("tau"));
        }
    }

    Ok(ProblemDims { r, n, p })
}

/// Coefficient components `<F, dM/dbeta_j>` for every column of `x`.
fn coefficient_gradient(
    adjoint: &LogDetAdjoint,
    s: ArrayView2<'_, f64>,
    x: ArrayView2<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
    options: &LogDetGradOptions,
) -> Array1<f64> {
    let p = x.ncols();
    match options.strategy {
        DerivativeStrategy::Materialized => {
            let parallel = options.use_parallel(p);
            let gr = derivative_matrices(s, x, mu, wt, parallel);
            let values: Vec<f64> = if parallel {
                gr.par_iter().map(|g| adjoint.contract_lower(g)).collect()
            } else {
                gr.iter().map(|g| adjoint.contract_lower(g)).collect()
            };
            Array1::from_vec(values)
        }
        DerivativeStrategy::Projected => {
            let q = row_quadratic_forms(s, &adjoint.symmetric());
            projected_coefficient_gradient(x, mu, wt, &q)
        }
    }
}

/// Gradient of `ln|L|` with respect to the coefficients and tau, using default options.
///
/// See [`gradient_log_det_with_options`].
pub fn gradient_log_det(
    l: ArrayView2<'_, f64>,
    s: ArrayView2<'_, f64>,
    x: ArrayView2<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
    tau: f64,
) -> Result<LogDetGradient, LogDetGradError> {
    gradient_log_det_with_options(l, s, x, mu, wt, tau, &LogDetGradOptions::default())
}

/// Gradient of `ln|L|`, where `L` is the lower Cholesky factor of the Hessian
/// `M = L L^T`, with respect to each coefficient `beta_j` and to `tau`.
///
/// * `l` is r x r lower triangular; its strict upper triangle is ignored.
/// * `s` is n x r, `x` is n x p, `mu` and `wt` have length n.
///
/// The result has length p + 1. Entry `j < p` is `<F, S^T diag(wt mu X[:,j]) S>`
/// with `F` the adjoint of the reverse Cholesky sweep; the last entry is
/// `tau * trace(F)`. All values refer to `ln|L|`, which is half of `ln|M|`.
pub fn gradient_log_det_with_options(
    l: ArrayView2<'_, f64>,
    s: ArrayView2<'_, f64>,
    x: ArrayView2<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
    tau: f64,
    options: &LogDetGradOptions,
) -> Result<LogDetGradient, LogDetGradError> {
    validate_options(options)?;
    let dims = validate_inputs(l, s, x, mu, wt, tau, options.check_finite)?;
    log::debug!(
        "log-det gradient: r={}, n={}, p={}, strategy={:?}, parallel={}",
        dims.r,
        dims.n,
        dims.p,
        options.strategy,
        options.use_parallel(dims.p)
    );

    let adjoint = reverse_cholesky_log_det(l, options.singular_tolerance)?;
    let coefficients = coefficient_gradient(&adjoint, s, x, mu, wt, options);

    let mut dl = Array1::<f64>::zeros(dims.p + 1);
    dl.slice_mut(ndarray::s![..dims.p]).assign(&coefficients);
    dl[dims.p] = tau * adjoint.trace();
    Ok(LogDetGradient::new(dl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn identity_factor_tau_component_equals_tau() {
        let l = Array2::<f64>::eye(2);
        let s = Array2::<f64>::eye(2);
        let x = Array2::<f64>::zeros((2, 0));
        let ones = Array1::<f64>::ones(2);
        let g = gradient_log_det(l.view(), s.view(), x.view(), ones.view(), ones.view(), 3.5)
            .expect("gradient");
        assert_eq!(g.len(), 1);
        assert_abs_diff_eq!(g.tau(), 3.5, epsilon = 1e-15);
    }

    #[test]
    fn shape_errors_name_the_offending_input() {
        let l = Array2::<f64>::eye(2);
        let s = Array2::<f64>::eye(2);
        let x = Array2::<f64>::ones((3, 1));
        let v = Array1::<f64>::ones(2);
        let err = gradient_log_det(l.view(), s.view(), x.view(), v.view(), v.view(), 1.0)
            .expect_err("x has the wrong row count");
        match err {
            LogDetGradError::DimensionMismatch {
                what,
                expected,
                found,
            } => {
                assert_eq!(what, "rows of X");
                assert_eq!((expected, found), (2, 3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let opts = LogDetGradOptions {
            singular_tolerance: -1.0,
            ..LogDetGradOptions::default()
        };
        assert!(matches!(
            validate_options(&opts),
            Err(LogDetGradError::InvalidOptions(_))
        ));
    }

    #[test]
    fn non_finite_inputs_are_rejected_only_when_checked() {
        let l = array![[1.0, 0.0], [f64::NAN, 1.0]];
        let s = Array2::<f64>::eye(2);
        let x = Array2::<f64>::ones((2, 1));
        let v = Array1::<f64>::ones(2);
        let err = gradient_log_det(l.view(), s.view(), x.view(), v.view(), v.view(), 1.0)
            .expect_err("NaN in L");
        assert!(matches!(err, LogDetGradError::NonFiniteInput("L")));

        let unchecked = LogDetGradOptions {
            check_finite: false,
            ..LogDetGradOptions::default()
        };
        let g = gradient_log_det_with_options(
            l.view(),
            s.view(),
            x.view(),
            v.view(),
            v.view(),
            1.0,
            &unchecked,
        )
        .expect("diagonal is fine, so the sweep runs");
        assert!(g[0].is_nan());
    }

    #[test]
    fn non_finite_strict_upper_triangle_of_factor_is_ignored() {
        let l = array![[1.0, f64::NAN], [0.5, 1.0]];
        let clean = array![[1.0, 0.0], [0.5, 1.0]];
        let s = Array2::<f64>::eye(2);
        let x = Array2::<f64>::ones((2, 1));
        let v = Array1::<f64>::ones(2);
        let g = gradient_log_det(l.view(), s.view(), x.view(), v.view(), v.view(), 1.0)
            .expect("upper triangle is never read");
        let expected =
            gradient_log_det(clean.view(), s.view(), x.view(), v.view(), v.view(), 1.0)
                .expect("gradient");
        assert_eq!(g, expected);
    }
}
