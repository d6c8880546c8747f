use osqp::Problem as InnerProblem;
use std::borrow::Cow;

pub use osqp::{Settings, Solution, Status};

use prelude::*;
use prelude::flame;

#[derive(Debug, thiserror::Error)]
pub enum ProblemError {
    #[error("osqp setup failed: {0}")]
    Setup(String),
    #[error("P must be stored as an upper triangular matrix")]
    NotUpperTriangular,
}

/// OSQP problem with every call wrapped in a flame span.
pub struct Problem {
    inner: InnerProblem,
}

#[allow(non_snake_case)]
impl Problem {
    pub fn new(
        P: &sparse::CscMatrix,
        q: &[float],
        A: &sparse::CscMatrix,
        l: &[float],
        u: &[float],
        settings: &Settings,
    ) -> Result<Problem, ProblemError> {
        let _guard = flame::start_guard("osqp setup");
        if !P.is_upper_triangular() {
            return Err(ProblemError::NotUpperTriangular);
        }
        let inner = InnerProblem::new(convert_sparse(P), q, convert_sparse(A), l, u, settings)
            .map_err(|e| ProblemError::Setup(format!("{:?}", e)))?;
        Ok(Problem { inner })
    }

    pub fn update_lin_cost(&mut self, q: &[float]) {
        let _guard = flame::start_guard("osqp update_lin_cost");
        self.inner.update_lin_cost(q)
    }

    pub fn update_bounds(&mut self, l: &[float], u: &[float]) {
        let _guard = flame::start_guard("osqp update_bounds");
        self.inner.update_bounds(l, u)
    }

    pub fn update_P(&mut self, P: &sparse::CscMatrix) {
        let _guard = flame::start_guard("osqp update_P");
        self.inner.update_P(convert_sparse(P))
    }

    pub fn update_A(&mut self, A: &sparse::CscMatrix) {
        let _guard = flame::start_guard("osqp update_A");
        self.inner.update_A(convert_sparse(A))
    }

    pub fn solve(&mut self) -> Status<'_> {
        let _guard = flame::start_guard("osqp solve");
        self.inner.solve()
    }
}

pub fn convert_sparse(this: &sparse::CscMatrix) -> osqp::CscMatrix<'_> {
    let (nrows, ncols) = this.shape();
    osqp::CscMatrix {
        nrows,
        ncols,
        indptr: Cow::Borrowed(this.indptr()),
        indices: Cow::Borrowed(this.indices()),
        data: Cow::Borrowed(this.data()),
    }
}
