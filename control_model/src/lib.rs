#![allow(non_snake_case)]

use prelude::nalgebra::{DMatrix, SMatrix};
use prelude::flame;
use prelude::*;

mod vehicle;
pub use vehicle::{ActuatorLimits, VehicleModel, NI, NS};

/// Longitudinal state of a single vehicle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VehicleState {
    pub position: float,
    pub velocity: float,
    pub acceleration: float,
}

impl VehicleState {
    pub fn new(position: float, velocity: float) -> VehicleState {
        VehicleState {
            position,
            velocity,
            acceleration: 0.0,
        }
    }

    /// Bumper to bumper distance to a vehicle ahead.
    pub fn gap_to(&self, lead: &VehicleState) -> float {
        lead.position - self.position
    }
}

/// Acceleration requested for the next step together with the jerk it implies relative to
/// the previously applied command.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ControlCommand {
    pub acceleration: float,
    pub jerk: float,
}

impl ControlCommand {
    pub fn new(acceleration: float, previous_acceleration: float, dt: float) -> ControlCommand {
        ControlCommand {
            acceleration,
            jerk: (acceleration - previous_acceleration) / dt,
        }
    }
}

/// Zero order hold discretisation of `x' = A x + B u` using the matrix exponential of the
/// augmented system.
pub fn discretise<const N: usize, const M: usize>(
    dt: float,
    A: &SMatrix<float, N, N>,
    B: &SMatrix<float, N, M>,
) -> (SMatrix<float, N, N>, SMatrix<float, N, M>) {
    let _guard = flame::start_guard("model discretise");

    let mut C = DMatrix::<float>::zeros(N + M, N + M);
    C.view_mut((0, 0), (N, N)).copy_from(A);
    C.view_mut((0, N), (N, M)).copy_from(B);
    C *= dt;

    let C_d = C.exp();

    let A_d = C_d.fixed_view::<N, N>(0, 0).into_owned();
    let B_d = C_d.fixed_view::<N, M>(0, N).into_owned();

    (A_d, B_d)
}

/// Entries of the discretised system that can be non-zero given the continuous sparsity.
pub fn discretise_sparsity<const N: usize, const M: usize>(
    A: &SMatrix<bool, N, N>,
    B: &SMatrix<bool, N, M>,
) -> (SMatrix<bool, N, N>, SMatrix<bool, N, M>) {
    let A = A.map(|nz| if nz { 1.0 } else { 0.0 });
    let B = B.map(|nz| if nz { 1.0 } else { 0.0 });

    let (A_d, B_d) = discretise(1.0, &A, &B);

    (A_d.map(|v| v != 0.0), B_d.map(|v| v != 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prelude::nalgebra::{Matrix2, Matrix2x1};

    #[test]
    fn double_integrator_discretisation_is_exact() {
        let dt = 0.1;
        let A = Matrix2::new(0.0, 1.0, 0.0, 0.0);
        let B = Matrix2x1::new(0.0, 1.0);

        let (A_d, B_d) = discretise(dt, &A, &B);

        assert!((A_d - Matrix2::new(1.0, dt, 0.0, 1.0)).abs().max() < 1e-12);
        assert!((B_d - Matrix2x1::new(0.5 * dt * dt, dt)).abs().max() < 1e-12);
    }

    #[test]
    fn sparsity_fills_in_through_integration() {
        let A = Matrix2::new(false, true, false, false);
        let B = Matrix2x1::new(false, true);

        let (A_d, B_d) = discretise_sparsity(&A, &B);

        assert_eq!(A_d, Matrix2::new(true, true, false, true));
        assert_eq!(B_d, Matrix2x1::new(true, true));
    }

    #[test]
    fn command_jerk_is_acceleration_difference_over_dt() {
        let command = ControlCommand::new(1.0, 0.5, 0.1);
        assert!((command.jerk - 5.0).abs() < 1e-12);
    }
}
