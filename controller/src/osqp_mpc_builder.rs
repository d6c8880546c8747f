use log::Level::Debug;
use osqp_wrapper::{Problem, Settings, Status};

use control_model::{ActuatorLimits, VehicleModel, NI, NS};
use prelude::nalgebra::{DMatrix, Matrix1x2, Matrix2, SMatrix};
use prelude::*;
use sparse::{BlockRef, CscMatrix};

use crate::{SolverFailure, SolverSettings, Weights};

/// Values of the QP that only change with the driver profile or the controller settings.
#[derive(Clone, Debug, PartialEq)]
pub struct QpParameters {
    pub dt: float,
    pub weights: Weights,
    pub time_gap: float,
    pub min_safe_distance: float,
    pub far_gap_multiplier: float,
    pub limits: ActuatorLimits,
    pub max_jerk: Option<float>,
}

/// Measurements and references of a single control step. Positions are relative to the
/// current ego position.
#[derive(Clone, Copy, Debug)]
pub struct StepInput<'a> {
    pub velocity: float,
    pub previous_acceleration: float,
    pub reference_speed: float,
    /// Predicted lead position after each horizon step.
    pub lead_positions: &'a [float],
}

#[derive(Clone, Debug)]
pub struct QpSolution {
    pub accelerations: Vec<float>,
    /// Predicted (relative position, velocity) after each horizon step.
    pub states: Vec<(float, float)>,
    pub close_slack: Vec<float>,
    pub far_slack: Vec<float>,
    pub inaccurate: bool,
}

// Decision variables, in order:
//   x_1 .. x_N  (position and velocity)
//   a_0 .. a_{N-1}
//   j_0 .. j_{N-1}
//   close slack, far slack (N each)
// Constraint rows, in order:
//   N * NS state evolution
//   N jerk definitions
//   N acceleration bounds, N jerk bounds, N velocity bounds
//   N close hinges, N far hinges
//   2N slack positivity
#[derive(Clone, Copy, Debug)]
struct Layout {
    N: usize,
}

impl Layout {
    fn n_variables(&self) -> usize {
        self.N * (NS + 4 * NI)
    }

    fn n_constraints(&self) -> usize {
        self.N * (NS + 8)
    }

    fn state(&self, k: usize) -> usize {
        k * NS
    }

    fn acceleration(&self) -> usize {
        self.N * NS
    }

    fn jerk(&self) -> usize {
        self.acceleration() + self.N
    }

    fn close_slack(&self) -> usize {
        self.jerk() + self.N
    }

    fn far_slack(&self) -> usize {
        self.close_slack() + self.N
    }

    fn jerk_definition_rows(&self) -> usize {
        self.N * NS
    }

    fn acceleration_bound_rows(&self) -> usize {
        self.jerk_definition_rows() + self.N
    }

    fn jerk_bound_rows(&self) -> usize {
        self.acceleration_bound_rows() + self.N
    }

    fn velocity_bound_rows(&self) -> usize {
        self.jerk_bound_rows() + self.N
    }

    fn close_rows(&self) -> usize {
        self.velocity_bound_rows() + self.N
    }

    fn far_rows(&self) -> usize {
        self.close_rows() + self.N
    }

    fn slack_rows(&self) -> usize {
        self.far_rows() + self.N
    }
}

struct TrackedBlocks {
    stage_cost: Vec<BlockRef>,
    acceleration_cost: BlockRef,
    jerk_cost: BlockRef,
    close_cost: BlockRef,
    far_cost: BlockRef,
    A: Vec<BlockRef>,
    B: Vec<BlockRef>,
    jerk: BlockRef,
    far: Vec<BlockRef>,
}

impl TrackedBlocks {
    fn write(&self, N: usize, params: &QpParameters, P: &mut CscMatrix, A: &mut CscMatrix) {
        let w = &params.weights;
        let T = params.time_gap;

        // q_d (p + T v - L)^2 + q_v (v - v_ref)^2, upper triangle only
        #[rustfmt::skip]
        let stage_cost = Matrix2::new(
            2.0 * w.q_distance, 2.0 * w.q_distance * T,
            0.0,                2.0 * w.q_distance * T * T + 2.0 * w.q_velocity,
        );
        for block in &self.stage_cost {
            P.set_block(block, &stage_cost);
        }

        let diagonal = |weight: float| DMatrix::from_diagonal_element(N, N, 2.0 * weight);
        P.set_block(&self.acceleration_cost, &diagonal(w.r_acceleration));
        P.set_block(&self.jerk_cost, &diagonal(w.r_jerk));
        P.set_block(&self.close_cost, &diagonal(w.q_close));
        P.set_block(&self.far_cost, &diagonal(w.q_far));

        let model = VehicleModel::new(params.limits);
        let (A_d, B_d) = model.discretised(params.dt);
        let (A_nz, B_nz) = model.discretised_sparsity();
        let A_d = mask(&A_d, &A_nz);
        let B_d = mask(&B_d, &B_nz);
        for block in &self.A {
            A.set_block(block, &A_d);
        }
        for block in &self.B {
            A.set_block(block, &B_d);
        }

        A.set_block(&self.jerk, &DMatrix::from_diagonal_element(N, N, -params.dt));

        let far = Matrix1x2::new(1.0, params.far_gap_multiplier * T);
        for block in &self.far {
            A.set_block(block, &far);
        }
    }
}

fn mask<const R: usize, const C: usize>(
    values: &Matrix<R, C>,
    sparsity: &SMatrix<bool, R, C>,
) -> Matrix<R, C> {
    values.zip_map(sparsity, |v, nz| if nz { v } else { 0.0 })
}

fn to_dynamic<const R: usize, const C: usize>(sparsity: &SMatrix<bool, R, C>) -> DMatrix<bool> {
    DMatrix::from_fn(R, C, |r, c| sparsity[(r, c)])
}

/// Sparse receding horizon QP for car following. The structure is fixed by the horizon
/// length; weights, step length and limits can be changed in place.
pub struct OsqpMpc {
    problem: Problem,
    layout: Layout,
    params: QpParameters,
    blocks: TrackedBlocks,
    P: CscMatrix,
    A: CscMatrix,
    A_d: Matrix<NS, NS>,
    q: DVector<float>,
    l: DVector<float>,
    u: DVector<float>,
}

impl OsqpMpc {
    pub fn new(
        N: usize,
        params: QpParameters,
        solver: &SolverSettings,
    ) -> Result<OsqpMpc, SolverFailure> {
        assert!(N > 0, "horizon must contain at least one step");
        let layout = Layout { N };

        let model = VehicleModel::new(params.limits);
        let (A_sparsity, B_sparsity) = model.discretised_sparsity();
        let A_sparsity = to_dynamic(&A_sparsity);
        let B_sparsity = to_dynamic(&B_sparsity);

        // Build penalty matrix P
        let stage_cost_sparsity = DMatrix::from_row_slice(NS, NS, &[true, true, false, true]);
        let (stage_costs, stage_cost_blocks): (Vec<_>, Vec<_>) = (0..N)
            .map(|_| sparse::block_mut(&stage_cost_sparsity))
            .unzip();
        let (acceleration_cost, acceleration_cost_block) =
            sparse::block_mut(&sparse::diagonal_sparsity(N));
        let (jerk_cost, jerk_cost_block) = sparse::block_mut(&sparse::diagonal_sparsity(N));
        let (close_cost, close_cost_block) = sparse::block_mut(&sparse::diagonal_sparsity(N));
        let (far_cost, far_cost_block) = sparse::block_mut(&sparse::diagonal_sparsity(N));

        let mut P = sparse::block_diag(&[
            sparse::block_diag(&stage_costs),
            acceleration_cost,
            jerk_cost,
            close_cost,
            far_cost,
        ])
        .build_csc();

        // State evolution, x_0 is moved into the bounds
        // -x_{k+1} + A x_k + B a_k = 0
        let (Ax, A_blocks): (Vec<_>, Vec<_>) =
            (1..N).map(|_| sparse::block_mut(&A_sparsity)).unzip();
        let (Bu, B_blocks): (Vec<_>, Vec<_>) =
            (0..N).map(|_| sparse::block_mut(&B_sparsity)).unzip();

        let Ax = -sparse::eye(N * NS)
            + sparse::bmat(&[
                &[None, Some(sparse::zeros(NS, NS))],
                &[Some(sparse::block_diag(&Ax)), None],
            ]);
        let Bu = sparse::block_diag(&Bu);

        // Jerk definition, a_{-1} is moved into the bounds
        // a_k - a_{k-1} - dt j_k = 0
        let A_difference = sparse::diags(N, &[1.0, -1.0], &[0, -1]);
        let (A_jerk, jerk_block) = sparse::block_mut(&sparse::diagonal_sparsity(N));

        let velocity = sparse::block_diag(&vec![sparse::block(&Matrix1x2::new(0.0, 1.0)); N]);

        // Hinge slacks:
        // d_safe - L_k <= -p_k + s_close_k
        // L_k - d_safe <= p_k + m T v_k + s_far_k
        let close = sparse::block_diag(&vec![sparse::block(&Matrix1x2::new(-1.0, 0.0)); N]);
        let (far, far_blocks): (Vec<_>, Vec<_>) = (0..N)
            .map(|_| sparse::block_mut(&DMatrix::from_element(1, NS, true)))
            .unzip();
        let far = sparse::block_diag(&far);

        let eye = sparse::eye(N);

        // Build constraint matrix A
        let mut A = sparse::bmat(&[
            // State evolution
            &[Some(&Ax), Some(&Bu), None, None, None],
            // Jerk definition
            &[None, Some(&A_difference), Some(&A_jerk), None, None],
            // Acceleration bounds
            &[None, Some(&eye), None, None, None],
            // Jerk bounds
            &[None, None, Some(&eye), None, None],
            // Velocity bounds
            &[Some(&velocity), None, None, None, None],
            // Close hinge
            &[Some(&close), None, None, Some(&eye), None],
            // Far hinge
            &[Some(&far), None, None, None, Some(&eye)],
            // Slacks are positive
            &[None, None, None, Some(&eye), None],
            &[None, None, None, None, Some(&eye)],
        ])
        .build_csc();

        debug_assert_eq!(P.shape(), (layout.n_variables(), layout.n_variables()));
        debug_assert_eq!(A.shape(), (layout.n_constraints(), layout.n_variables()));

        let blocks = TrackedBlocks {
            stage_cost: stage_cost_blocks,
            acceleration_cost: acceleration_cost_block,
            jerk_cost: jerk_cost_block,
            close_cost: close_cost_block,
            far_cost: far_cost_block,
            A: A_blocks,
            B: B_blocks,
            jerk: jerk_block,
            far: far_blocks,
        };
        blocks.write(N, &params, &mut P, &mut A);

        let q = DVector::zeros(layout.n_variables());
        let mut l = DVector::zeros(layout.n_constraints());
        let mut u = DVector::zeros(layout.n_constraints());
        write_parameter_bounds(&layout, &params, &mut l, &mut u);

        let settings = Settings::default()
            .verbose(log_enabled!(Debug))
            .eps_abs(solver.eps_abs)
            .eps_rel(solver.eps_rel)
            .max_iter(solver.max_iter)
            .time_limit(solver.time_limit)
            .polish(true)
            // Identical inputs must give identical commands
            .warm_start(false);

        let problem = Problem::new(&P, q.as_slice(), &A, l.as_slice(), u.as_slice(), &settings)
            .map_err(|e| SolverFailure::Setup(e.to_string()))?;

        debug!(
            "built car following qp: N={} variables={} constraints={} nnz(P)={} nnz(A)={}",
            N,
            layout.n_variables(),
            layout.n_constraints(),
            P.nnz(),
            A.nnz()
        );

        Ok(OsqpMpc {
            problem,
            layout,
            A_d: model.discretised(params.dt).0,
            params,
            blocks,
            P,
            A,
            q,
            l,
            u,
        })
    }

    pub fn horizon_len(&self) -> usize {
        self.layout.N
    }

    pub fn parameters(&self) -> &QpParameters {
        &self.params
    }

    /// Rewrites the matrix values that depend on the parameters. The sparsity is unchanged so
    /// the solver workspace is reused.
    pub fn update_parameters(&mut self, params: QpParameters) {
        if params == self.params {
            return;
        }
        let N = self.layout.N;
        self.blocks.write(N, &params, &mut self.P, &mut self.A);
        self.problem.update_P(&self.P);
        self.problem.update_A(&self.A);

        self.A_d = VehicleModel::new(params.limits).discretised(params.dt).0;
        write_parameter_bounds(&self.layout, &params, &mut self.l, &mut self.u);
        self.params = params;
    }

    pub fn solve(&mut self, step: &StepInput) -> Result<QpSolution, SolverFailure> {
        let layout = self.layout;
        let N = layout.N;
        assert_eq!(step.lead_positions.len(), N, "one lead position per stage");

        self.write_step(step);
        self.problem.update_lin_cost(self.q.as_slice());
        self.problem
            .update_bounds(self.l.as_slice(), self.u.as_slice());

        let (x, inaccurate) = match self.problem.solve() {
            Status::Solved(solution) => (solution.x().to_vec(), false),
            Status::SolvedInaccurate(solution) => (solution.x().to_vec(), true),
            Status::MaxIterationsReached(_) => return Err(SolverFailure::MaxIterations),
            Status::TimeLimitReached(_) => return Err(SolverFailure::TimeLimit),
            Status::PrimalInfeasible(_) | Status::PrimalInfeasibleInaccurate(_) => {
                return Err(SolverFailure::PrimalInfeasible)
            }
            Status::DualInfeasible(_) | Status::DualInfeasibleInaccurate(_) => {
                return Err(SolverFailure::DualInfeasible)
            }
            Status::NonConvex(_) => return Err(SolverFailure::NonConvex),
            _ => return Err(SolverFailure::Unknown),
        };

        if x.iter().any(|v| !v.is_finite()) {
            return Err(SolverFailure::NonFinite);
        }

        let slice = |start: usize| x[start..start + N].to_vec();
        Ok(QpSolution {
            accelerations: slice(layout.acceleration()),
            states: (0..N)
                .map(|k| (x[layout.state(k)], x[layout.state(k) + 1]))
                .collect(),
            close_slack: slice(layout.close_slack()),
            far_slack: slice(layout.far_slack()),
            inaccurate,
        })
    }

    fn write_step(&mut self, step: &StepInput) {
        let layout = self.layout;
        let N = layout.N;
        let w = &self.params.weights;
        let T = self.params.time_gap;
        let d_safe = self.params.min_safe_distance;

        // Linear cost of the gap and speed tracking terms
        self.q.fill(0.0);
        for (k, &L) in step.lead_positions.iter().enumerate() {
            let i = layout.state(k);
            self.q[i] = -2.0 * w.q_distance * L;
            self.q[i + 1] = -2.0 * w.q_distance * T * L - 2.0 * w.q_velocity * step.reference_speed;
        }

        // -x_1 + B a_0 = -A x_0
        let x0 = Vector::<NS>::new(0.0, step.velocity);
        let initial = -(self.A_d * x0);
        self.l.rows_mut(0, N * NS).fill(0.0);
        self.u.rows_mut(0, N * NS).fill(0.0);
        self.l.fixed_rows_mut::<NS>(0).copy_from(&initial);
        self.u.fixed_rows_mut::<NS>(0).copy_from(&initial);

        // a_0 - dt j_0 = a_{-1}
        let jerk_rows = layout.jerk_definition_rows();
        self.l.rows_mut(jerk_rows, N).fill(0.0);
        self.u.rows_mut(jerk_rows, N).fill(0.0);
        self.l[jerk_rows] = step.previous_acceleration;
        self.u[jerk_rows] = step.previous_acceleration;

        for (k, &L) in step.lead_positions.iter().enumerate() {
            self.l[layout.close_rows() + k] = d_safe - L;
            self.l[layout.far_rows() + k] = L - d_safe;
        }
    }
}

fn write_parameter_bounds(
    layout: &Layout,
    params: &QpParameters,
    l: &mut DVector<float>,
    u: &mut DVector<float>,
) {
    let N = layout.N;
    let limits = &params.limits;

    l.rows_mut(layout.acceleration_bound_rows(), N)
        .fill(limits.min_acceleration);
    u.rows_mut(layout.acceleration_bound_rows(), N)
        .fill(limits.max_acceleration);

    let max_jerk = params.max_jerk.unwrap_or(INFINITY);
    l.rows_mut(layout.jerk_bound_rows(), N).fill(-max_jerk);
    u.rows_mut(layout.jerk_bound_rows(), N).fill(max_jerk);

    l.rows_mut(layout.velocity_bound_rows(), N).fill(0.0);
    u.rows_mut(layout.velocity_bound_rows(), N)
        .fill(limits.max_velocity);

    // Hinge and slack rows are only bounded below
    u.rows_mut(layout.close_rows(), 4 * N).fill(INFINITY);
    l.rows_mut(layout.slack_rows(), 2 * N).fill(0.0);
}
