use ndarray::{Array1, ArrayView1, s};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// How the coefficient components of the gradient are formed from the adjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DerivativeStrategy {
    /// Build every dM/dbeta_j as a dense r x r matrix and contract it against the adjoint.
    #[default]
    Materialized,
    /// Contract row-wise through S without forming the per-coefficient matrices.
    Projected,
}

pub fn default_singular_tolerance() -> f64 {
    1e-12
}

pub fn default_parallel_threshold() -> usize {
    4
}

pub fn default_check_finite() -> bool {
    true
}

/// Kernel configuration. Every field has a serde default, so an empty
/// document deserializes to `LogDetGradOptions::default()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDetGradOptions {
    /// A diagonal entry of L is singular when
    /// `|L(k,k)| <= singular_tolerance * max_k |L(k,k)|`, or when it is zero or non-finite.
    #[serde(default = "default_singular_tolerance")]
    pub singular_tolerance: f64,
    /// Derivative matrices are built on rayon once p reaches this count. Zero disables it.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
    #[serde(default = "default_check_finite")]
    pub check_finite: bool,
    #[serde(default)]
    pub strategy: DerivativeStrategy,
}

impl Default for LogDetGradOptions {
    fn default() -> Self {
        Self {
            singular_tolerance: default_singular_tolerance(),
            parallel_threshold: default_parallel_threshold(),
            check_finite: default_check_finite(),
            strategy: DerivativeStrategy::default(),
        }
    }
}

impl LogDetGradOptions {
    pub fn with_strategy(mut self, strategy: DerivativeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel_threshold = 0;
        self
    }

    pub(crate) fn use_parallel(&self, p: usize) -> bool {
        self.parallel_threshold > 0 && p >= self.parallel_threshold
    }
}

/// Gradient of `ln|L|` ordered as `[d/dbeta_0, ..., d/dbeta_{p-1}, tau * d/dtau]`.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct LogDetGradient(pub Array1<f64>);

impl LogDetGradient {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    /// Number of coefficient directions p.
    pub fn num_coefficients(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    pub fn coefficients(&self) -> ArrayView1<'_, f64> {
        let p = self.num_coefficients();
        self.0.slice(s![..p])
    }

    pub fn tau(&self) -> f64 {
        self.0[self.num_coefficients()]
    }

    /// The same gradient for `ln|M| = 2 ln|L|`.
    pub fn scaled_to_hessian(&self) -> Array1<f64> {
        self.0.mapv(|v| 2.0 * v)
    }
}

impl Deref for LogDetGradient {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LogDetGradient {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AsRef<Array1<f64>> for LogDetGradient {
    fn as_ref(&self) -> &Array1<f64> {
        &self.0
    }
}

impl From<LogDetGradient> for Array1<f64> {
    fn from(values: LogDetGradient) -> Self {
        values.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn empty_document_deserializes_to_defaults() {
        let opts: LogDetGradOptions = serde_json::from_str("{}").expect("defaults");
        assert_eq!(opts, LogDetGradOptions::default());
        assert_eq!(opts.strategy, DerivativeStrategy::Materialized);
    }

    #[test]
    fn options_round_trip_through_json() {
        let opts = LogDetGradOptions::default()
            .with_strategy(DerivativeStrategy::Projected)
            .sequential();
        let text = serde_json::to_string(&opts).expect("serialize");
        let back: LogDetGradOptions = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, opts);
        assert!(!back.use_parallel(1_000));
    }

    #[test]
    fn parallel_threshold_gates_rayon_path() {
        let opts = LogDetGradOptions::default();
        assert!(!opts.use_parallel(3));
        assert!(opts.use_parallel(4));
    }

    #[test]
    fn gradient_accessors_split_coefficients_and_tau() {
        let g = LogDetGradient::new(array![0.5, -1.0, 2.0]);
        assert_eq!(g.num_coefficients(), 2);
        assert_eq!(g.coefficients().to_vec(), vec![0.5, -1.0]);
        assert_eq!(g.tau(), 2.0);
        assert_eq!(g.scaled_to_hessian(), array![1.0, -2.0, 4.0]);

        let only_tau = LogDetGradient::new(array![3.0]);
        assert_eq!(only_tau.coefficients().len(), 0);
        assert_eq!(only_tau.tau(), 3.0);
    }
}
