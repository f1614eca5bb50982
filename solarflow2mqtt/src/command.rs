use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use log::{debug, warn};

use crate::error::CommandError;
use crate::protocol::{option_code, CommandAck, DeviceCommand, BYPASS_MODES, PV_BRANDS};
use crate::state::{DeviceState, Field};

pub const MIN_SOC_RANGE: (f64, f64) = (0., 30.);
pub const MAX_SOC_RANGE: (f64, f64) = (70., 100.);
pub const MAX_INVERTER_INPUT_RANGE: (f64, f64) = (0., 1200.);

/// An output limit write issued to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetpointCommand {
    pub id: u64,
    pub watts: u32,
    /// Epoch milliseconds.
    pub issued_at: i64,
}

impl SetpointCommand {
    pub fn to_device_command(&self) -> DeviceCommand {
        DeviceCommand::WriteProperties {
            id: self.id,
            issued_at: self.issued_at,
            properties: BTreeMap::from([("outputLimit".to_string(), i64::from(self.watts))]),
        }
    }
}

/// Manual overrides coming from the platform's controllable entities.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceIntent {
    OutputLimit(f64),
    MinSoc(f64),
    MaxSoc(f64),
    MaxInverterInput(f64),
    BypassMode(String),
    PvBrand(String),
    Buzzer(bool),
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlatformIntent {
    Device(DeviceIntent),
    /// Turns the automatic controller on or off.
    Controller(bool),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Current { accepted: bool },
    Superseded,
}

/// Builds vendor commands and keeps track of which setpoint is the current one.
#[derive(Debug)]
pub struct CommandTranslator {
    max_watts: u32,
    next_id: u64,
    last_setpoint: Option<SetpointCommand>,
}

impl CommandTranslator {
    pub fn new(max_output: f64) -> Self {
        Self {
            max_watts: max_output.max(0.).floor() as u32,
            next_id: 1,
            last_setpoint: None,
        }
    }

    pub fn max_watts(&self) -> u32 {
        self.max_watts
    }

    pub fn last_setpoint(&self) -> Option<SetpointCommand> {
        self.last_setpoint
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn validate_setpoint(&self, watts: f64) -> Result<u32, CommandError> {
        if watts.is_nan() {
            return Err(CommandError::InvalidValue {
                what: "output limit",
                value: watts.to_string(),
            });
        }
        let max = f64::from(self.max_watts);
        if !(0. ..=max).contains(&watts) {
            return Err(CommandError::OutOfRange {
                what: "output limit",
                value: watts,
                min: 0.,
                max,
            });
        }
        Ok(watts.round() as u32)
    }

    pub fn clamp(&self, watts: f64) -> u32 {
        if watts.is_nan() {
            return 0;
        }
        watts.clamp(0., f64::from(self.max_watts)).round() as u32
    }

    /// Always produces a command; out of range requests are logged and clamped.
    pub fn build_setpoint_command(&mut self, watts: f64, now: DateTime<Local>) -> SetpointCommand {
        let watts = match self.validate_setpoint(watts) {
            Ok(watts) => watts,
            Err(e) => {
                let clamped = self.clamp(watts);
                warn!("{e}, clamping to {clamped} W");
                clamped
            }
        };
        let command = SetpointCommand {
            id: self.take_id(),
            watts,
            issued_at: now.timestamp_millis(),
        };
        self.last_setpoint = Some(command);
        command
    }

    pub fn build_time_sync_reply(&self, now: DateTime<Local>) -> DeviceCommand {
        DeviceCommand::TimeSyncReply {
            timestamp: now.timestamp_millis(),
        }
    }

    pub fn build_request_all(&mut self, now: DateTime<Local>) -> DeviceCommand {
        DeviceCommand::ReadAll {
            id: self.take_id(),
            issued_at: now.timestamp_millis(),
        }
    }

    fn write(&mut self, now: DateTime<Local>, properties: &[(&str, i64)]) -> DeviceCommand {
        DeviceCommand::WriteProperties {
            id: self.take_id(),
            issued_at: now.timestamp_millis(),
            properties: properties
                .iter()
                .map(|(key, value)| (key.to_string(), *value))
                .collect(),
        }
    }

    pub fn translate(
        &mut self,
        intent: &DeviceIntent,
        state: &DeviceState,
        now: DateTime<Local>,
    ) -> Result<DeviceCommand, CommandError> {
        match intent {
            DeviceIntent::OutputLimit(watts) => {
                Ok(self.build_setpoint_command(*watts, now).to_device_command())
            }
            DeviceIntent::MinSoc(percent) => {
                let percent = check_range("min soc", *percent, MIN_SOC_RANGE)?;
                Ok(self.write(now, &[("minSoc", per_mille(percent))]))
            }
            DeviceIntent::MaxSoc(percent) => {
                let percent = check_range("max soc", *percent, MAX_SOC_RANGE)?;
                Ok(self.write(now, &[("socSet", per_mille(percent))]))
            }
            DeviceIntent::MaxInverterInput(watts) => {
                let watts = check_range("max inverter input", *watts, MAX_INVERTER_INPUT_RANGE)?;
                // the device only accepts both values together
                let brand = state
                    .text(Field::PvBrand)
                    .and_then(|name| option_code(&PV_BRANDS, name))
                    .ok_or(CommandError::MissingState(Field::PvBrand))?;
                Ok(self.write(
                    now,
                    &[("inverseMaxPower", watts.round() as i64), ("pvBrand", brand)],
                ))
            }
            DeviceIntent::PvBrand(name) => {
                let brand = select_code("pv brand", name, &PV_BRANDS)?;
                let max_input = state
                    .number(Field::MaxInverterInput)
                    .ok_or(CommandError::MissingState(Field::MaxInverterInput))?;
                Ok(self.write(
                    now,
                    &[("inverseMaxPower", max_input.round() as i64), ("pvBrand", brand)],
                ))
            }
            DeviceIntent::BypassMode(name) => {
                let mode = select_code("bypass mode", name, &BYPASS_MODES)?;
                Ok(self.write(now, &[("passMode", mode)]))
            }
            DeviceIntent::Buzzer(on) => Ok(self.write(now, &[("buzzerSwitch", i64::from(*on))])),
        }
    }

    /// Only the ack for the most recent setpoint matters.
    pub fn match_ack(&self, ack: &CommandAck) -> AckOutcome {
        match self.last_setpoint {
            Some(setpoint) if setpoint.id == ack.id => AckOutcome::Current {
                accepted: ack.accepted,
            },
            _ => {
                debug!("ack {} does not belong to the current setpoint", ack.id);
                AckOutcome::Superseded
            }
        }
    }
}

fn check_range(
    what: &'static str,
    value: f64,
    (min, max): (f64, f64),
) -> Result<f64, CommandError> {
    if value.is_nan() || value < min || value > max {
        Err(CommandError::OutOfRange {
            what,
            value,
            min,
            max,
        })
    } else {
        Ok(value)
    }
}

fn per_mille(percent: f64) -> i64 {
    (percent * 10.).round() as i64
}

fn select_code(
    what: &'static str,
    name: &str,
    table: &[(&'static str, i64)],
) -> Result<i64, CommandError> {
    option_code(table, name).ok_or_else(|| CommandError::Unknown {
        what,
        value: name.to_string(),
        options: table
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceEvent, TelemetryReport};
    use crate::state::{FieldValue, StateStore};
    use chrono::TimeZone;

    fn now() -> DateTime<Local> {
        Local.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn properties(command: &DeviceCommand) -> &BTreeMap<String, i64> {
        match command {
            DeviceCommand::WriteProperties { properties, .. } => properties,
            other => panic!("expected a write, got {other:?}"),
        }
    }

    #[test]
    fn setpoints_are_clamped_into_range() {
        let mut translator = CommandTranslator::new(500.);
        assert_eq!(translator.build_setpoint_command(-5., now()).watts, 0);
        assert_eq!(translator.build_setpoint_command(600., now()).watts, 500);
        assert_eq!(translator.build_setpoint_command(f64::NAN, now()).watts, 0);
        assert_eq!(translator.build_setpoint_command(249.6, now()).watts, 250);
    }

    #[test]
    fn validate_reports_out_of_range() {
        let translator = CommandTranslator::new(500.);
        assert_eq!(
            translator.validate_setpoint(-5.),
            Err(CommandError::OutOfRange {
                what: "output limit",
                value: -5.,
                min: 0.,
                max: 500.
            })
        );
        assert_eq!(translator.validate_setpoint(500.), Ok(500));
    }

    #[test]
    fn every_command_takes_a_new_id() {
        let mut translator = CommandTranslator::new(500.);
        let first = translator.build_setpoint_command(100., now());
        let request = translator.build_request_all(now());
        let second = translator.build_setpoint_command(100., now());
        assert_eq!(first.id, 1);
        assert_eq!(request, DeviceCommand::ReadAll { id: 2, issued_at: 1_700_000_000_000 });
        assert_eq!(second.id, 3);
        assert_eq!(translator.last_setpoint(), Some(second));
    }

    #[test]
    fn only_the_latest_setpoint_ack_is_current() {
        let mut translator = CommandTranslator::new(500.);
        let old = translator.build_setpoint_command(100., now());
        let current = translator.build_setpoint_command(200., now());
        assert_eq!(
            translator.match_ack(&CommandAck { id: old.id, accepted: true }),
            AckOutcome::Superseded
        );
        assert_eq!(
            translator.match_ack(&CommandAck { id: current.id, accepted: false }),
            AckOutcome::Current { accepted: false }
        );
    }

    #[test]
    fn time_sync_reply_uses_epoch_millis() {
        let translator = CommandTranslator::new(500.);
        assert_eq!(
            translator.build_time_sync_reply(now()),
            DeviceCommand::TimeSyncReply { timestamp: 1_700_000_000_000 }
        );
    }

    #[test]
    fn soc_limits_are_range_checked_and_sent_per_mille() {
        let mut translator = CommandTranslator::new(500.);
        let state = DeviceState::default();

        let command = translator
            .translate(&DeviceIntent::MinSoc(10.), &state, now())
            .unwrap();
        assert_eq!(properties(&command)["minSoc"], 100);

        let command = translator
            .translate(&DeviceIntent::MaxSoc(95.), &state, now())
            .unwrap();
        assert_eq!(properties(&command)["socSet"], 950);

        assert!(matches!(
            translator.translate(&DeviceIntent::MaxSoc(50.), &state, now()),
            Err(CommandError::OutOfRange { what: "max soc", .. })
        ));
    }

    #[test]
    fn inverter_settings_need_each_other() {
        let mut translator = CommandTranslator::new(500.);
        let mut store = StateStore::new();

        assert_eq!(
            translator.translate(&DeviceIntent::MaxInverterInput(600.), store.get(), now()),
            Err(CommandError::MissingState(Field::PvBrand))
        );

        store.apply(
            &DeviceEvent::Telemetry(TelemetryReport {
                readings: vec![
                    (Field::PvBrand, FieldValue::Text("hoymiles".into())),
                    (Field::MaxInverterInput, FieldValue::Number(800.)),
                ],
                ..Default::default()
            }),
            now(),
        );
        let command = translator
            .translate(&DeviceIntent::MaxInverterInput(600.), store.get(), now())
            .unwrap();
        assert_eq!(properties(&command)["inverseMaxPower"], 600);
        assert_eq!(properties(&command)["pvBrand"], 1);

        let command = translator
            .translate(&DeviceIntent::PvBrand("bosswerk".into()), store.get(), now())
            .unwrap();
        assert_eq!(properties(&command)["inverseMaxPower"], 800);
        assert_eq!(properties(&command)["pvBrand"], 15);
    }

    #[test]
    fn unknown_select_option_is_rejected() {
        let mut translator = CommandTranslator::new(500.);
        let err = translator
            .translate(
                &DeviceIntent::BypassMode("sometimes".into()),
                &DeviceState::default(),
                now(),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown bypass mode 'sometimes', expected one of [automatic, always_off, always_on]"
        );
    }

    #[test]
    fn buzzer_and_bypass_are_direct_writes() {
        let mut translator = CommandTranslator::new(500.);
        let state = DeviceState::default();
        let command = translator
            .translate(&DeviceIntent::Buzzer(true), &state, now())
            .unwrap();
        assert_eq!(properties(&command)["buzzerSwitch"], 1);
        let command = translator
            .translate(&DeviceIntent::BypassMode("always_off".into()), &state, now())
            .unwrap();
        assert_eq!(properties(&command)["passMode"], 1);
    }
}
