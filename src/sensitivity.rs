//! Forward sensitivities of the Hessian with respect to the coefficients.
//!
//! The Hessian is the weighted quadratic form `S^T diag(wt * mu) S` (plus terms
//! that do not depend on beta). Under a log link `d mu_i / d beta_j = mu_i X_ij`,
//! so the derivative along coefficient `j` is `S^T diag(wt * mu * X[:, j]) S`.

use crate::linalg::faer_ndarray::{fast_ab, fast_atb};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;

/// Row weights `wt * mu * x_col` for one coefficient direction.
fn direction_weights(
    x_col: ArrayView1<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
) -> Array1<f64> {
    let mut weights = Array1::<f64>::zeros(x_col.len());
    Zip::from(&mut weights)
        .and(&x_col)
        .and(&mu)
        .and(&wt)
        .for_each(|out, &x, &m, &w| *out = w * m * x);
    weights
}

/// `dM/dbeta_j = S^T diag(wt * mu * x_col) S`, returned exactly symmetric.
///
/// `s` is n x r, the three vectors have length n. Shapes are checked by the
/// public entry points before this is reached.
pub fn derivative_matrix(
    s: ArrayView2<'_, f64>,
    x_col: ArrayView1<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
) -> Array2<f64> {
    debug_assert_eq!(s.nrows(), x_col.len());
    debug_assert_eq!(mu.len(), x_col.len());
    debug_assert_eq!(wt.len(), x_col.len());

    let weights = direction_weights(x_col, mu, wt);
    let mut weighted = s.to_owned();
    for (mut row, &w) in weighted.axis_iter_mut(Axis(0)).zip(weights.iter()) {
        row *= w;
    }

    let mut gr = fast_atb(&s, &weighted);
    // GEMM rounding can leave the two triangles a few ulps apart; mirror the
    // lower one so the contraction sees one value per symmetric pair.
    let r = gr.nrows();
    for i in 0..r {
        for j in (i + 1)..r {
            gr[[i, j]] = gr[[j, i]];
        }
    }
    gr
}

/// All p derivative matrices, one per column of `x`.
///
/// The columns are independent, so with `parallel` set they are built on the
/// rayon pool; output order always follows the columns of `x`.
pub fn derivative_matrices(
    s: ArrayView2<'_, f64>,
    x: ArrayView2<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
    parallel: bool,
) -> Vec<Array2<f64>> {
    let p = x.ncols();
    if parallel {
        (0..p)
            .into_par_iter()
            .map(|j| derivative_matrix(s, x.column(j), mu, wt))
            .collect()
    } else {
        (0..p)
            .map(|j| derivative_matrix(s, x.column(j), mu, wt))
            .collect()
    }
}

/// Row-wise quadratic forms `q_i = s_i^T G s_i` for a symmetric `g`.
///
/// Since `gr[j] = sum_i (wt mu X_ij)_i s_i s_i^T`, the full Frobenius product
/// `<G, gr[j]>` equals `sum_i wt_i mu_i X_ij q_i`, which lets the coefficient
/// gradient skip forming any `gr[j]`.
pub(crate) fn row_quadratic_forms(s: ArrayView2<'_, f64>, g: &Array2<f64>) -> Array1<f64> {
    let sg = fast_ab(&s, g);
    let mut q = Array1::<f64>::zeros(s.nrows());
    Zip::from(&mut q)
        .and(sg.rows())
        .and(s.rows())
        .for_each(|out, sg_row, s_row| *out = sg_row.dot(&s_row));
    q
}

/// `X^T (wt * mu * q)`: the projected coefficient gradient.
pub(crate) fn projected_coefficient_gradient(
    x: ArrayView2<'_, f64>,
    mu: ArrayView1<'_, f64>,
    wt: ArrayView1<'_, f64>,
    q: &Array1<f64>,
) -> Array1<f64> {
    let mut weighted_q = Array1::<f64>::zeros(q.len());
    Zip::from(&mut weighted_q)
        .and(q)
        .and(&mu)
        .and(&wt)
        .for_each(|out, &qi, &m, &w| *out = w * m * qi);
    x.t().dot(&weighted_q)
}
