use std::fmt;
use std::str::FromStr;

use prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown driver style '{0}', expected one of: aggressive, balanced, conservative")]
pub struct UnknownStyleError(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DriverStyle {
    Aggressive,
    Balanced,
    Conservative,
}

impl DriverStyle {
    pub const ALL: [DriverStyle; 3] = [
        DriverStyle::Aggressive,
        DriverStyle::Balanced,
        DriverStyle::Conservative,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DriverStyle::Aggressive => "aggressive",
            DriverStyle::Balanced => "balanced",
            DriverStyle::Conservative => "conservative",
        }
    }
}

impl fmt::Display for DriverStyle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverStyle {
    type Err = UnknownStyleError;

    fn from_str(name: &str) -> Result<DriverStyle, UnknownStyleError> {
        DriverStyle::ALL
            .iter()
            .copied()
            .find(|style| style.name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| UnknownStyleError(name.to_owned()))
    }
}

/// Cost weights of the tracking problem.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Weights {
    pub q_velocity: float,
    pub q_distance: float,
    pub q_close: float,
    pub q_far: float,
    pub r_acceleration: float,
    pub r_jerk: float,
}

/// Immutable controller parameterisation for one driving style.
#[derive(Clone, Debug, PartialEq)]
pub struct DriverStyleProfile {
    pub style: DriverStyle,
    /// Desired following distance in seconds of travel at the current speed.
    pub time_gap: float,
    /// Multiplier on the nominal cruise speed.
    pub speed_factor: float,
    pub weights: Weights,
    /// Number of steps in the prediction horizon.
    pub horizon: usize,
    /// Duration of each horizon step in seconds.
    pub dt: float,
}

pub const DEFAULT_HORIZON: usize = 10;
pub const DEFAULT_DT: float = 0.1;

impl DriverStyleProfile {
    pub fn for_style(name: &str) -> Result<DriverStyleProfile, UnknownStyleError> {
        name.parse().map(DriverStyleProfile::from_style)
    }

    pub fn from_style(style: DriverStyle) -> DriverStyleProfile {
        let (time_gap, speed_factor, weights) = match style {
            DriverStyle::Aggressive => (
                1.0,
                1.2,
                Weights {
                    q_velocity: 2.0,
                    q_distance: 1.0,
                    q_close: 5.0,
                    q_far: 0.5,
                    r_acceleration: 0.05,
                    r_jerk: 0.05,
                },
            ),
            DriverStyle::Balanced => (
                2.0,
                1.0,
                Weights {
                    q_velocity: 1.0,
                    q_distance: 2.0,
                    q_close: 10.0,
                    q_far: 1.0,
                    r_acceleration: 0.1,
                    r_jerk: 0.1,
                },
            ),
            DriverStyle::Conservative => (
                3.0,
                1.0,
                Weights {
                    q_velocity: 0.5,
                    q_distance: 3.0,
                    q_close: 20.0,
                    q_far: 2.0,
                    r_acceleration: 0.2,
                    r_jerk: 0.2,
                },
            ),
        };

        DriverStyleProfile {
            style,
            time_gap,
            speed_factor,
            weights,
            horizon: DEFAULT_HORIZON,
            dt: DEFAULT_DT,
        }
    }

    pub fn with_horizon(self, horizon: usize, dt: float) -> DriverStyleProfile {
        DriverStyleProfile { horizon, dt, ..self }
    }

    pub fn with_weights(self, weights: Weights) -> DriverStyleProfile {
        DriverStyleProfile { weights, ..self }
    }

    pub fn reference_speed(&self, nominal_speed: float) -> float {
        nominal_speed * self.speed_factor
    }

    pub fn desired_distance(&self, velocity: float) -> float {
        self.time_gap * velocity
    }
}
