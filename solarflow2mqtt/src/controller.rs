//! Output setpoint policies.
//!
//! A [`Controller`] is asked for a decision on every control tick. It only sees the
//! inputs handed to it; checking that those inputs are fresh is the dispatcher's job.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use log::info;

use crate::control_config::Policy;
use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SetpointDecision {
    NoChange,
    /// Requested output in W, not yet clamped by the translator.
    Setpoint(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlInputs {
    /// Net grid power in W as metered at the house; negative while feeding into the grid.
    /// The hub's own output is already part of it.
    pub house_power: f64,
    pub solar_input_power: f64,
    /// Output limit the hub is currently working with.
    pub current_output: f64,
    pub max_output: f64,
}

impl ControlInputs {
    /// Consumption behind the meter: what the grid delivers plus what the hub feeds in.
    pub fn consumption(&self) -> f64 {
        self.house_power + self.current_output
    }

    fn tracked_consumption(&self) -> f64 {
        self.consumption().clamp(0., self.max_output.max(0.))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Charging,
    Transitioning,
    Discharging,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Charging => "charging",
            Phase::Transitioning => "transitioning",
            Phase::Discharging => "discharging",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Boundary {
    MorningCutoff,
    EveningRampup,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Controller {
    /// Never discharges; the device feeds solar through once the battery is full.
    AlwaysZero,
    /// Follows house consumption to keep the grid draw near zero.
    MinimizeGrid,
    NightUsage(NightUsage),
}

impl Controller {
    pub fn evaluate(&mut self, inputs: &ControlInputs, now: NaiveDateTime) -> SetpointDecision {
        match self {
            Controller::AlwaysZero => SetpointDecision::Setpoint(0.),
            Controller::MinimizeGrid => SetpointDecision::Setpoint(inputs.tracked_consumption()),
            Controller::NightUsage(night_usage) => night_usage.evaluate(inputs, now),
        }
    }

    pub fn policy(&self) -> Policy {
        match self {
            Controller::AlwaysZero => Policy::AlwaysZero,
            Controller::MinimizeGrid => Policy::MinimizeGrid,
            Controller::NightUsage(_) => Policy::NightUsage,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Controller::NightUsage(night_usage) => Some(night_usage.phase()),
            _ => None,
        }
    }

    /// Human readable policy and phase, e.g. `night_usage/charging`.
    pub fn describe(&self) -> String {
        match self.phase() {
            Some(phase) => format!("{}/{}", self.policy().name(), phase.as_str()),
            None => self.policy().name().to_string(),
        }
    }

    /// Next wall-clock instant at which the policy may change its mind on its own.
    pub fn next_boundary(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Controller::NightUsage(night_usage) => Some(night_usage.next_boundary(now)),
            _ => None,
        }
    }
}

/// Charge during the day, supply the house during the night.
///
/// Starts in [`Phase::Charging`] and moves to [`Phase::Transitioning`] once the morning
/// cutoff is reached or solar input exceeds house consumption, whichever comes first. The
/// evening rampup switches to [`Phase::Discharging`]. The next morning cutoff ends the
/// night, and since that tick lies in the day window it goes on to transitioning at once.
/// Boundaries are detected as crossings between two ticks, so a tick that
/// follows a suspension catches up immediately.
#[derive(Clone, Debug, PartialEq)]
pub struct NightUsage {
    morning_cutoff: NaiveTime,
    evening_rampup: NaiveTime,
    phase: Phase,
    last_tick: Option<NaiveDateTime>,
}

impl NightUsage {
    pub fn new(morning_cutoff: NaiveTime, evening_rampup: NaiveTime) -> Result<Self, ConfigError> {
        if morning_cutoff == evening_rampup {
            return Err(ConfigError::InvalidTimeWindow {
                cutoff: morning_cutoff,
                rampup: evening_rampup,
            });
        }
        Ok(Self {
            morning_cutoff,
            evening_rampup,
            phase: Phase::Charging,
            last_tick: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether `time` lies in `[morning_cutoff, evening_rampup)`, wrapping at midnight.
    pub fn is_daytime(&self, time: NaiveTime) -> bool {
        if self.morning_cutoff < self.evening_rampup {
            time >= self.morning_cutoff && time < self.evening_rampup
        } else {
            time >= self.morning_cutoff || time < self.evening_rampup
        }
    }

    fn last_crossed(&self, from: NaiveTime, to: NaiveTime) -> Option<Boundary> {
        [
            (Boundary::MorningCutoff, self.morning_cutoff),
            (Boundary::EveningRampup, self.evening_rampup),
        ]
        .into_iter()
        .filter(|(_, at)| crossed(from, to, *at))
        .min_by_key(|(_, at)| elapsed_since(*at, to))
        .map(|(boundary, _)| boundary)
    }

    fn leaves_charging(&self, inputs: &ControlInputs, now: NaiveDateTime) -> bool {
        self.is_daytime(now.time()) || inputs.solar_input_power > inputs.consumption()
    }

    /// Advances the phase for a tick at `now` and returns the resulting phase.
    pub fn step(&mut self, inputs: &ControlInputs, now: NaiveDateTime) -> Phase {
        let crossed = match self.last_tick {
            Some(previous) if now >= previous && now - previous < Duration::days(1) => {
                self.last_crossed(previous.time(), now.time())
            }
            // clock stepped backwards, keep what we have
            Some(previous) if now < previous => None,
            last_tick => {
                if last_tick.is_some() && self.phase != Phase::Charging {
                    info!("night usage: no tick for a day or more, restarting in charging phase");
                }
                self.phase = Phase::Charging;
                None
            }
        };
        self.last_tick = Some(now);

        let mut next = match self.phase {
            Phase::Charging if self.leaves_charging(inputs, now) => Phase::Transitioning,
            Phase::Transitioning if crossed == Some(Boundary::EveningRampup) => Phase::Discharging,
            Phase::Discharging if crossed == Some(Boundary::MorningCutoff) => Phase::Charging,
            phase => phase,
        };
        // the tick that crossed the cutoff already lies in the day window
        if next == Phase::Charging
            && self.phase == Phase::Discharging
            && self.leaves_charging(inputs, now)
        {
            next = Phase::Transitioning;
        }
        if next != self.phase {
            info!(
                "night usage: {} -> {} at {}",
                self.phase.as_str(),
                next.as_str(),
                now.format("%H:%M:%S")
            );
            self.phase = next;
        }
        next
    }

    pub fn evaluate(&mut self, inputs: &ControlInputs, now: NaiveDateTime) -> SetpointDecision {
        match self.step(inputs, now) {
            Phase::Charging => SetpointDecision::Setpoint(0.),
            Phase::Transitioning => SetpointDecision::Setpoint(inputs.tracked_consumption()),
            Phase::Discharging => SetpointDecision::Setpoint(
                inputs.consumption().min(inputs.max_output).max(0.),
            ),
        }
    }

    pub fn next_boundary(&self, now: NaiveDateTime) -> NaiveDateTime {
        std::cmp::min(
            next_occurrence(now, self.morning_cutoff),
            next_occurrence(now, self.evening_rampup),
        )
    }
}

/// Whether `at` lies in the wrapped time-of-day interval `(from, to]`.
fn crossed(from: NaiveTime, to: NaiveTime, at: NaiveTime) -> bool {
    if from <= to {
        from < at && at <= to
    } else {
        at > from || at <= to
    }
}

fn elapsed_since(at: NaiveTime, now: NaiveTime) -> Duration {
    let elapsed = now.signed_duration_since(at);
    if elapsed < Duration::zero() {
        elapsed + Duration::days(1)
    } else {
        elapsed
    }
}

fn next_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}
