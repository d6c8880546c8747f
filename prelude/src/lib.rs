pub use flame;
pub use nalgebra;

#[allow(non_camel_case_types)]
pub type float = f64;
pub use std::f64::{INFINITY, NEG_INFINITY};

/// Absolute tolerance used when comparing solver output against hard bounds.
pub const BOUND_TOLERANCE: float = 1e-6;

pub type Matrix<const R: usize, const C: usize> = nalgebra::SMatrix<float, R, C>;
pub type Vector<const N: usize> = nalgebra::SVector<float, N>;

pub use nalgebra::{DMatrix, DVector};
