use chrono::{Duration, NaiveTime};
use serde_derive::Deserialize;

use crate::controller::{Controller, NightUsage};
use crate::error::ConfigError;

pub const DEFAULT_MAX_OUTPUT: f64 = 500.;
pub const DEFAULT_LOOP_PERIOD_SECS: u64 = 30;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 300;
pub const DEFAULT_SETPOINT_DEADBAND: f64 = 10.;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    #[default]
    AlwaysZero,
    MinimizeGrid,
    NightUsage,
}

impl Policy {
    pub fn name(self) -> &'static str {
        match self {
            Policy::AlwaysZero => "always_zero",
            Policy::MinimizeGrid => "minimize_grid",
            Policy::NightUsage => "night_usage",
        }
    }
}

/// `[controller]` section of the configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub policy: Policy,
    /// Platform topic carrying the house power in W (negative = net production).
    pub house_power_topic: String,
    pub max_output: Option<f64>,
    pub morning_cutoff_time: Option<String>,
    pub evening_rampup_time: Option<String>,
    pub loop_period_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub setpoint_deadband: Option<f64>,
    /// Initial state of the automatic controller switch.
    pub enabled: Option<bool>,
}

impl ControllerConfig {
    pub fn new(policy: Policy, house_power_topic: &str) -> Self {
        Self {
            policy,
            house_power_topic: house_power_topic.to_string(),
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.house_power_topic.is_empty() && self.build_controller().is_ok()
    }

    pub fn max_output(&self) -> Result<f64, ConfigError> {
        let max_output = self.max_output.unwrap_or(DEFAULT_MAX_OUTPUT);
        if max_output.is_finite() && max_output > 0. {
            Ok(max_output)
        } else {
            Err(ConfigError::InvalidMaxOutput(max_output))
        }
    }

    pub fn loop_period(&self) -> Duration {
        Duration::seconds(
            self.loop_period_secs
                .unwrap_or(DEFAULT_LOOP_PERIOD_SECS)
                .max(1) as i64,
        )
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS) as i64)
    }

    pub fn setpoint_deadband(&self) -> f64 {
        self.setpoint_deadband
            .unwrap_or(DEFAULT_SETPOINT_DEADBAND)
            .max(0.)
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn build_controller(&self) -> Result<Controller, ConfigError> {
        self.max_output()?;
        Ok(match self.policy {
            Policy::AlwaysZero => Controller::AlwaysZero,
            Policy::MinimizeGrid => Controller::MinimizeGrid,
            Policy::NightUsage => {
                let cutoff = required_time(&self.morning_cutoff_time, "morning_cutoff_time")?;
                let rampup = required_time(&self.evening_rampup_time, "evening_rampup_time")?;
                Controller::NightUsage(NightUsage::new(cutoff, rampup)?)
            }
        })
    }
}

fn required_time(value: &Option<String>, key: &'static str) -> Result<NaiveTime, ConfigError> {
    let value = value.as_deref().ok_or(ConfigError::MissingTime {
        policy: Policy::NightUsage.name(),
        key,
    })?;
    parse_time_of_day(value)
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| ConfigError::InvalidTime(value.to_string()))
}
