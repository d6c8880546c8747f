use prelude::nalgebra::SMatrix;
use prelude::*;

use crate::{discretise, discretise_sparsity, VehicleState};

/// Number of states in the linear model: position and velocity.
pub const NS: usize = 2;
/// Number of inputs in the linear model: acceleration.
pub const NI: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActuatorLimits {
    pub min_acceleration: float,
    pub max_acceleration: float,
    pub max_velocity: float,
}

impl ActuatorLimits {
    pub fn clamp_acceleration(&self, acceleration: float) -> float {
        acceleration.clamp(self.min_acceleration, self.max_acceleration)
    }
}

impl Default for ActuatorLimits {
    fn default() -> ActuatorLimits {
        ActuatorLimits {
            min_acceleration: -3.0,
            max_acceleration: 2.0,
            max_velocity: 30.0,
        }
    }
}

/// Point mass moving along a line, driven directly by its acceleration.
#[derive(Clone, Debug, Default)]
pub struct VehicleModel {
    limits: ActuatorLimits,
}

impl VehicleModel {
    pub fn new(limits: ActuatorLimits) -> VehicleModel {
        VehicleModel { limits }
    }

    /// Integrates one step of constant acceleration. The command is clamped to the actuator
    /// range and further limited so the velocity stays within `[0, max_velocity]`.
    pub fn advance(
        &self,
        state: &VehicleState,
        control_acceleration: float,
        dt: float,
    ) -> VehicleState {
        debug_assert!(dt > 0.0);

        let v = state.velocity;
        let a = self.limits.clamp_acceleration(control_acceleration);

        let (a, velocity) = if v + a * dt <= 0.0 {
            (-v / dt, 0.0)
        } else if v + a * dt > self.limits.max_velocity {
            // Lands exactly on the cap, braking if the state started above it
            ((self.limits.max_velocity - v) / dt, self.limits.max_velocity)
        } else {
            (a, v + a * dt)
        };

        VehicleState {
            position: state.position + v * dt + 0.5 * a * dt * dt,
            velocity,
            acceleration: a,
        }
    }

    /// Continuous time model `[p, v]' = A [p, v] + B a`.
    pub fn linearise(&self) -> (Matrix<NS, NS>, Matrix<NS, NI>) {
        #[rustfmt::skip]
        let A = Matrix::<NS, NS>::new(
            0.0, 1.0,
            0.0, 0.0,
        );
        let B = Matrix::<NS, NI>::new(0.0, 1.0);
        (A, B)
    }

    pub fn linearise_sparsity(&self) -> (SMatrix<bool, NS, NS>, SMatrix<bool, NS, NI>) {
        let (A, B) = self.linearise();
        (A.map(|v| v != 0.0), B.map(|v| v != 0.0))
    }

    /// Discrete transition matrices for a fixed step.
    pub fn discretised(&self, dt: float) -> (Matrix<NS, NS>, Matrix<NS, NI>) {
        let (A, B) = self.linearise();
        discretise(dt, &A, &B)
    }

    /// Structurally non-zero entries of `discretised`, independent of `dt`.
    pub fn discretised_sparsity(&self) -> (SMatrix<bool, NS, NS>, SMatrix<bool, NS, NI>) {
        let (A, B) = self.linearise_sparsity();
        discretise_sparsity(&A, &B)
    }
}
