#![allow(non_snake_case)]

#[macro_use]
extern crate log;

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use control_model::{ActuatorLimits, VehicleState};
use controller::{
    DriverStyle, DriverStyleProfile, FallbackPolicy, LeadPredictionKind, MpcSettings,
    SolverSettings, Weights, DEFAULT_DT, DEFAULT_HORIZON,
};
use prelude::*;

pub static CONFIG_FILE: &str = "acc.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to deserialise {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Simulated duration in seconds.
    pub t: float,
    pub dt: float,
    /// Driver style name, or `all` to compare every built-in style.
    pub style: String,
    /// Consecutive solver failures tolerated before a run is aborted.
    pub failure_threshold: usize,
    /// Pace the loop to wall clock time.
    pub real_time: bool,
    pub controller: Controller,
    pub ego: Ego,
    pub lead: Lead,
    /// Overrides applied on top of the selected style's weights.
    pub weights: WeightOverrides,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Controller {
    pub N: usize,
    pub nominal_speed: float,
    pub min_safe_distance: float,
    pub far_gap_multiplier: float,
    pub max_jerk: Option<float>,
    pub fallback: Fallback,
    pub lead_prediction: LeadPrediction,
    pub eps_abs: float,
    pub eps_rel: float,
    pub max_iter: u32,
    /// Wall clock budget of a single solve in seconds.
    pub solver_time_limit: Option<float>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    MaxBraking,
    HoldPrevious,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadPrediction {
    ConstantVelocity,
    ConstantAcceleration,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Ego {
    pub position: float,
    pub velocity: float,
    pub min_acceleration: float,
    pub max_acceleration: float,
    pub max_velocity: float,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Lead {
    pub position: float,
    pub velocity: float,
    pub trajectory: LeadTrajectory,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeadTrajectory {
    /// Speed oscillating between zero and `max_speed`.
    Sinusoidal {
        #[serde(default = "default_sinusoid_max_speed")]
        max_speed: float,
        #[serde(default = "default_sinusoid_period")]
        period: float,
    },
    ConstantSpeed,
    /// Piecewise constant accelerations, coasting after the last segment.
    Scripted { segments: Vec<Segment> },
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Segment {
    pub duration: float,
    pub acceleration: float,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WeightOverrides {
    pub q_velocity: Option<float>,
    pub q_distance: Option<float>,
    pub q_close: Option<float>,
    pub q_far: Option<float>,
    pub r_acceleration: Option<float>,
    pub r_jerk: Option<float>,
}

fn default_sinusoid_max_speed() -> float {
    40.0 / 3.6
}

fn default_sinusoid_period() -> float {
    20.0
}

impl Default for Config {
    fn default() -> Config {
        Config {
            t: 60.0,
            dt: DEFAULT_DT,
            style: DriverStyle::Balanced.name().to_owned(),
            failure_threshold: 5,
            real_time: false,
            controller: Controller::default(),
            ego: Ego::default(),
            lead: Lead::default(),
            weights: WeightOverrides::default(),
        }
    }
}

impl Default for Controller {
    fn default() -> Controller {
        let mpc = MpcSettings::default();
        Controller {
            N: DEFAULT_HORIZON,
            nominal_speed: mpc.nominal_speed,
            min_safe_distance: mpc.min_safe_distance,
            far_gap_multiplier: mpc.far_gap_multiplier,
            max_jerk: mpc.max_jerk,
            fallback: Fallback::MaxBraking,
            lead_prediction: LeadPrediction::ConstantVelocity,
            eps_abs: mpc.solver.eps_abs,
            eps_rel: mpc.solver.eps_rel,
            max_iter: mpc.solver.max_iter,
            solver_time_limit: None,
        }
    }
}

impl Default for Ego {
    fn default() -> Ego {
        let limits = ActuatorLimits::default();
        Ego {
            position: 0.0,
            velocity: 15.0,
            min_acceleration: limits.min_acceleration,
            max_acceleration: limits.max_acceleration,
            max_velocity: limits.max_velocity,
        }
    }
}

impl Default for Lead {
    fn default() -> Lead {
        Lead {
            position: 30.0,
            velocity: 15.0,
            trajectory: LeadTrajectory::default(),
        }
    }
}

impl Default for LeadTrajectory {
    fn default() -> LeadTrajectory {
        LeadTrajectory::Sinusoidal {
            max_speed: default_sinusoid_max_speed(),
            period: default_sinusoid_period(),
        }
    }
}

impl WeightOverrides {
    pub fn is_empty(&self) -> bool {
        *self == WeightOverrides::default()
    }

    pub fn apply(&self, weights: Weights) -> Weights {
        Weights {
            q_velocity: self.q_velocity.unwrap_or(weights.q_velocity),
            q_distance: self.q_distance.unwrap_or(weights.q_distance),
            q_close: self.q_close.unwrap_or(weights.q_close),
            q_far: self.q_far.unwrap_or(weights.q_far),
            r_acceleration: self.r_acceleration.unwrap_or(weights.r_acceleration),
            r_jerk: self.r_jerk.unwrap_or(weights.r_jerk),
        }
    }

    fn values(&self) -> [(&'static str, Option<float>); 6] {
        [
            ("q_velocity", self.q_velocity),
            ("q_distance", self.q_distance),
            ("q_close", self.q_close),
            ("q_far", self.q_far),
            ("r_acceleration", self.r_acceleration),
            ("r_jerk", self.r_jerk),
        ]
    }
}

impl Config {
    /// Loads the configuration from `path`, or from `acc.toml` when no path is given. A missing
    /// default file gives the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(CONFIG_FILE), false),
        };

        let config_str = match fs::read_to_string(path) {
            Ok(config_str) => config_str,
            Err(e) if !required && e.kind() == io::ErrorKind::NotFound => {
                info!("{} not found, using default configuration", path.display());
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_owned(),
                    source,
                })
            }
        };

        let config: Config = toml::from_str(&config_str).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(config_str: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(config_str).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(ok: bool, message: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(message.to_owned()))
            }
        }

        check(self.dt > 0.0 && self.dt.is_finite(), "dt must be positive and finite")?;
        check(self.t > 0.0 && self.t.is_finite(), "t must be positive and finite")?;
        check(self.failure_threshold > 0, "failure_threshold must be at least 1")?;

        let c = &self.controller;
        check(c.N > 0, "controller.N must be at least 1")?;
        check(c.nominal_speed >= 0.0, "controller.nominal_speed must not be negative")?;
        check(
            c.min_safe_distance >= 0.0,
            "controller.min_safe_distance must not be negative",
        )?;
        check(
            c.far_gap_multiplier >= 0.0,
            "controller.far_gap_multiplier must not be negative",
        )?;
        check(
            c.max_jerk.map_or(true, |j| j > 0.0),
            "controller.max_jerk must be positive",
        )?;
        check(
            c.eps_abs > 0.0 && c.eps_rel > 0.0,
            "solver tolerances must be positive",
        )?;
        check(c.max_iter > 0, "controller.max_iter must be at least 1")?;
        check(
            c.solver_time_limit.map_or(true, |t| t > 0.0),
            "controller.solver_time_limit must be positive",
        )?;

        let ego = &self.ego;
        check(
            ego.min_acceleration < ego.max_acceleration,
            "ego.min_acceleration must be below ego.max_acceleration",
        )?;
        check(
            ego.min_acceleration <= 0.0 && ego.max_acceleration >= 0.0,
            "ego acceleration range must contain zero",
        )?;
        check(ego.max_velocity > 0.0, "ego.max_velocity must be positive")?;
        check(
            ego.velocity >= 0.0 && ego.velocity <= ego.max_velocity,
            "ego.velocity must lie within [0, ego.max_velocity]",
        )?;

        check(self.lead.velocity >= 0.0, "lead.velocity must not be negative")?;
        match &self.lead.trajectory {
            LeadTrajectory::Sinusoidal { max_speed, period } => {
                check(*max_speed >= 0.0, "sinusoidal max_speed must not be negative")?;
                check(*period > 0.0, "sinusoidal period must be positive")?;
            }
            LeadTrajectory::ConstantSpeed => {}
            LeadTrajectory::Scripted { segments } => {
                check(
                    segments.iter().all(|s| s.duration > 0.0),
                    "scripted segment durations must be positive",
                )?;
            }
        }

        for (name, value) in self.weights.values() {
            if let Some(value) = value {
                if !(value >= 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "weights.{} must not be negative",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn steps(&self) -> usize {
        (self.t / self.dt).round() as usize
    }

    pub fn limits(&self) -> ActuatorLimits {
        ActuatorLimits {
            min_acceleration: self.ego.min_acceleration,
            max_acceleration: self.ego.max_acceleration,
            max_velocity: self.ego.max_velocity,
        }
    }

    pub fn mpc_settings(&self) -> MpcSettings {
        let c = &self.controller;
        MpcSettings {
            limits: self.limits(),
            nominal_speed: c.nominal_speed,
            min_safe_distance: c.min_safe_distance,
            far_gap_multiplier: c.far_gap_multiplier,
            max_jerk: c.max_jerk,
            fallback: match c.fallback {
                Fallback::MaxBraking => FallbackPolicy::MaxBraking,
                Fallback::HoldPrevious => FallbackPolicy::HoldPrevious,
            },
            lead_prediction: match c.lead_prediction {
                LeadPrediction::ConstantVelocity => LeadPredictionKind::ConstantVelocity,
                LeadPrediction::ConstantAcceleration => LeadPredictionKind::ConstantAcceleration,
            },
            solver: SolverSettings {
                eps_abs: c.eps_abs,
                eps_rel: c.eps_rel,
                max_iter: c.max_iter,
                time_limit: c.solver_time_limit.map(Duration::from_secs_f64),
            },
        }
    }

    /// Built-in profile of `style` with this run's horizon, step and weight overrides.
    pub fn profile(&self, style: DriverStyle) -> DriverStyleProfile {
        let profile = DriverStyleProfile::from_style(style).with_horizon(self.controller.N, self.dt);
        if self.weights.is_empty() {
            profile
        } else {
            let weights = self.weights.apply(profile.weights);
            info!("{} weights overridden: {:?}", style, weights);
            profile.with_weights(weights)
        }
    }

    pub fn ego_state(&self) -> VehicleState {
        VehicleState::new(self.ego.position, self.ego.velocity)
    }

    pub fn lead_state(&self) -> VehicleState {
        VehicleState::new(self.lead.position, self.lead.velocity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_reference_run() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.steps(), 600);
        assert_eq!(config.style, "balanced");
        assert_eq!(config.controller.N, 10);
        assert_eq!(config.ego_state(), VehicleState::new(0.0, 15.0));
        assert_eq!(config.lead_state(), VehicleState::new(30.0, 15.0));
        assert_eq!(config.mpc_settings(), MpcSettings::default());
    }

    #[test]
    fn parses_a_full_file() {
        let config = Config::from_toml(
            r#"
            t = 20.0
            dt = 0.05
            style = "aggressive"
            failure_threshold = 3

            [controller]
            N = 15
            max_jerk = 5.0
            fallback = "hold_previous"
            lead_prediction = "constant_acceleration"
            solver_time_limit = 0.01

            [ego]
            velocity = 10.0
            max_velocity = 25.0

            [lead]
            position = 50.0

            [lead.trajectory]
            kind = "scripted"
            segments = [
                { duration = 5.0, acceleration = -1.0 },
                { duration = 2.0, acceleration = 0.5 },
            ]

            [weights]
            q_close = 50.0
            "#,
        )
        .unwrap();

        assert_eq!(config.steps(), 400);
        let settings = config.mpc_settings();
        assert_eq!(settings.max_jerk, Some(5.0));
        assert_eq!(settings.fallback, FallbackPolicy::HoldPrevious);
        assert_eq!(
            settings.lead_prediction,
            LeadPredictionKind::ConstantAcceleration
        );
        assert_eq!(settings.solver.time_limit, Some(Duration::from_secs_f64(0.01)));
        assert_eq!(settings.limits.max_velocity, 25.0);

        match &config.lead.trajectory {
            LeadTrajectory::Scripted { segments } => assert_eq!(segments.len(), 2),
            other => panic!("unexpected trajectory {:?}", other),
        }

        let profile = config.profile(DriverStyle::Aggressive);
        assert_eq!(profile.horizon, 15);
        assert_eq!(profile.dt, 0.05);
        assert_eq!(profile.weights.q_close, 50.0);
        assert_eq!(profile.weights.q_far, 0.5);
    }

    #[test]
    fn sinusoid_parameters_default() {
        let config = Config::from_toml("[lead]\ntrajectory = { kind = \"sinusoidal\", period = 10.0 }")
            .unwrap();
        assert_eq!(
            config.lead.trajectory,
            LeadTrajectory::Sinusoidal {
                max_speed: 40.0 / 3.6,
                period: 10.0
            }
        );
    }

    #[test]
    fn rejects_invalid_values() {
        for bad in &[
            "dt = 0.0",
            "dt = nan",
            "t = inf",
            "failure_threshold = 0",
            "[controller]\nN = 0",
            "[ego]\nmin_acceleration = 2.0\nmax_acceleration = 1.0",
            "[ego]\nvelocity = 40.0",
            "[weights]\nr_jerk = -1.0",
            "[controller]\nmax_jerk = 0.0",
        ] {
            assert!(
                matches!(Config::from_toml(bad), Err(ConfigError::Invalid(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(matches!(
            Config::from_toml("horizon = 3"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = Config::load(Some(Path::new("definitely/not/here/acc.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
