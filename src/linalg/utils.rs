use ndarray::{ArrayBase, Data, Ix2};

/// Compensated summation for long Frobenius contractions.
#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

/// Largest finite absolute diagonal entry, or 0 when there is none.
pub(crate) fn max_abs_diag<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> f64 {
    matrix
        .diag()
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(f64::abs)
        .fold(0.0, f64::max)
}

/// Smallest absolute diagonal entry together with its index.
pub(crate) fn min_abs_diag<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> Option<(usize, f64)> {
    matrix
        .diag()
        .iter()
        .copied()
        .map(f64::abs)
        .enumerate()
        .fold(None, |best, (idx, v)| match best {
            Some((_, b)) if b <= v => best,
            _ => Some((idx, v)),
        })
}

/// True when every entry on or below the diagonal is finite.
pub(crate) fn lower_triangle_finite<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> bool {
    matrix
        .indexed_iter()
        .all(|((i, j), v)| i < j || v.is_finite())
}

pub(crate) fn all_finite<S: Data<Elem = f64>, D: ndarray::Dimension>(
    array: &ArrayBase<S, D>,
) -> bool {
    array.iter().all(|v| v.is_finite())
}
