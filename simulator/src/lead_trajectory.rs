use std::f64::consts::PI;

use config::Segment;
use control_model::VehicleState;
use prelude::*;

/// Source of the lead vehicle's acceleration. The lead is driven open loop and never reacts
/// to the ego vehicle.
pub trait LeadTrajectory: Send {
    fn name(&self) -> &'static str;

    /// Acceleration to apply over `[t, t + dt]`.
    fn acceleration(&mut self, t: float, lead: &VehicleState, dt: float) -> float;
}

pub fn from_config(trajectory: &config::LeadTrajectory) -> Box<dyn LeadTrajectory> {
    match trajectory {
        config::LeadTrajectory::Sinusoidal { max_speed, period } => {
            Box::new(Sinusoidal::new(*max_speed, *period))
        }
        config::LeadTrajectory::ConstantSpeed => Box::new(ConstantSpeed),
        config::LeadTrajectory::Scripted { segments } => Box::new(Scripted::new(segments.clone())),
    }
}

/// Tracks a speed oscillating between zero and `max_speed`, starting at half of it.
pub struct Sinusoidal {
    max_speed: float,
    period: float,
}

impl Sinusoidal {
    pub fn new(max_speed: float, period: float) -> Sinusoidal {
        Sinusoidal { max_speed, period }
    }

    pub fn target_speed(&self, t: float) -> float {
        0.5 * self.max_speed * (1.0 + (2.0 * PI * t / self.period).sin())
    }
}

impl LeadTrajectory for Sinusoidal {
    fn name(&self) -> &'static str {
        "sinusoidal"
    }

    fn acceleration(&mut self, t: float, lead: &VehicleState, dt: float) -> float {
        (self.target_speed(t + dt) - lead.velocity) / dt
    }
}

pub struct ConstantSpeed;

impl LeadTrajectory for ConstantSpeed {
    fn name(&self) -> &'static str {
        "constant_speed"
    }

    fn acceleration(&mut self, _t: float, _lead: &VehicleState, _dt: float) -> float {
        0.0
    }
}

/// Piecewise constant acceleration, coasting once the script runs out.
pub struct Scripted {
    // (end time, acceleration)
    segments: Vec<(float, float)>,
}

impl Scripted {
    pub fn new(segments: Vec<Segment>) -> Scripted {
        let segments = segments
            .iter()
            .scan(0.0, |end, segment| {
                *end += segment.duration;
                Some((*end, segment.acceleration))
            })
            .collect();
        Scripted { segments }
    }
}

impl LeadTrajectory for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn acceleration(&mut self, t: float, _lead: &VehicleState, _dt: float) -> float {
        // Nudge past the boundary so a step starting on it uses the next segment
        let t = t + 1e-9;
        self.segments
            .iter()
            .find(|&&(end, _)| t < end)
            .map_or(0.0, |&(_, acceleration)| acceleration)
    }
}
