#![deny(dead_code)]
#![deny(unused_imports)]

pub mod adjoint;
pub mod diagnostics;
pub mod estimate;
pub mod linalg;
pub mod sensitivity;
pub mod types;

pub use adjoint::{LogDetAdjoint, log_det_factor, reverse_cholesky_log_det};
pub use diagnostics::{
    GradientCheck, compare_gradients, finite_difference_log_det_gradient, log_det_cholesky,
};
pub use estimate::{LogDetGradError, gradient_log_det, gradient_log_det_with_options};
pub use sensitivity::{derivative_matrices, derivative_matrix};
pub use types::{DerivativeStrategy, LogDetGradOptions, LogDetGradient};
