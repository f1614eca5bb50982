use std::fmt;

use chrono::{DateTime, Duration, Local};
use log::debug;

use crate::protocol::{DeviceEvent, PackReport, TelemetryReport};

/// The fixed set of device fields kept in the canonical state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    BatteryLevel,
    SolarInputPower,
    SolarInput1Power,
    SolarInput2Power,
    HomeOutputPower,
    BatteryChargePower,
    BatteryDischargePower,
    OutputLimit,
    MaxInverterInput,
    MinSoc,
    MaxSoc,
    BatteryRuntime,
    BatteryChargeTime,
    BypassMode,
    PvBrand,
    BuzzerSwitch,
    SerialNumber,
    FirmwareVersion,
}

impl Field {
    pub const ALL: [Field; 18] = [
        Field::BatteryLevel,
        Field::SolarInputPower,
        Field::SolarInput1Power,
        Field::SolarInput2Power,
        Field::HomeOutputPower,
        Field::BatteryChargePower,
        Field::BatteryDischargePower,
        Field::OutputLimit,
        Field::MaxInverterInput,
        Field::MinSoc,
        Field::MaxSoc,
        Field::BatteryRuntime,
        Field::BatteryChargeTime,
        Field::BypassMode,
        Field::PvBrand,
        Field::BuzzerSwitch,
        Field::SerialNumber,
        Field::FirmwareVersion,
    ];
    pub const COUNT: usize = Self::ALL.len();

    /// Entity key used for platform topics and unique ids.
    pub fn key(self) -> &'static str {
        match self {
            Field::BatteryLevel => "battery",
            Field::SolarInputPower => "solar_input_power",
            Field::SolarInput1Power => "solar_input_1_power",
            Field::SolarInput2Power => "solar_input_2_power",
            Field::HomeOutputPower => "home_output_power",
            Field::BatteryChargePower => "battery_charge_power",
            Field::BatteryDischargePower => "battery_discharge_power",
            Field::OutputLimit => "output_limit",
            Field::MaxInverterInput => "max_inverter_input",
            Field::MinSoc => "min_soc",
            Field::MaxSoc => "max_soc",
            Field::BatteryRuntime => "battery_runtime",
            Field::BatteryChargeTime => "battery_charge_time",
            Field::BypassMode => "bypass_mode",
            Field::PvBrand => "pv_brand",
            Field::BuzzerSwitch => "buzzer_switch",
            Field::SerialNumber => "serial_number",
            Field::FirmwareVersion => "firmware_version",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) => Some(*value),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Number(_) => None,
            FieldValue::Text(text) => Some(text),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(value) => write!(f, "{}", format_number(*value)),
            FieldValue::Text(text) => write!(f, "{text}"),
        }
    }
}

/// Renders whole numbers without a fraction, everything else with two decimals.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub value: FieldValue,
    pub updated_at: DateTime<Local>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackStatus {
    Standby,
    Charging,
    Discharging,
    Unknown,
}

impl PackStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => PackStatus::Standby,
            1 => PackStatus::Charging,
            2 => PackStatus::Discharging,
            _ => PackStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PackStatus::Standby => "standby",
            PackStatus::Charging => "charging",
            PackStatus::Discharging => "discharging",
            PackStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PackState {
    pub soc: Option<f64>,
    pub status: Option<PackStatus>,
    /// Kelvin, as reported by the device.
    pub max_temperature: Option<f64>,
    pub updated_at: Option<DateTime<Local>>,
}

impl PackState {
    fn merge(&mut self, report: &PackReport, now: DateTime<Local>) -> bool {
        let before = (self.soc, self.status, self.max_temperature);
        if report.soc.is_some() {
            self.soc = report.soc;
        }
        if report.status.is_some() {
            self.status = report.status;
        }
        if report.max_temperature.is_some() {
            self.max_temperature = report.max_temperature;
        }
        self.updated_at = Some(now);
        before != (self.soc, self.status, self.max_temperature)
    }
}

/// Latest known state of the device, one slot per [`Field`].
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceState {
    readings: [Option<Reading>; Field::COUNT],
    packs: Vec<(String, PackState)>,
    last_update: Option<DateTime<Local>>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            readings: std::array::from_fn(|_| None),
            packs: Vec::new(),
            last_update: None,
        }
    }
}

impl DeviceState {
    pub fn reading(&self, field: Field) -> Option<&Reading> {
        self.readings[field.index()].as_ref()
    }

    pub fn value(&self, field: Field) -> Option<&FieldValue> {
        self.reading(field).map(|reading| &reading.value)
    }

    pub fn number(&self, field: Field) -> Option<f64> {
        self.value(field).and_then(FieldValue::as_number)
    }

    pub fn text(&self, field: Field) -> Option<&str> {
        self.value(field).and_then(FieldValue::as_text)
    }

    pub fn serial(&self) -> Option<&str> {
        self.text(Field::SerialNumber)
    }

    /// Battery packs in the order the device enumerates them.
    pub fn packs(&self) -> &[(String, PackState)] {
        &self.packs
    }

    pub fn pack_serials(&self) -> Vec<String> {
        self.packs.iter().map(|(serial, _)| serial.clone()).collect()
    }

    pub fn last_update(&self) -> Option<DateTime<Local>> {
        self.last_update
    }

    fn set(&mut self, field: Field, value: FieldValue, now: DateTime<Local>) -> bool {
        let slot = &mut self.readings[field.index()];
        let changed = slot.as_ref().map_or(true, |reading| reading.value != value);
        *slot = Some(Reading {
            value,
            updated_at: now,
        });
        self.last_update = Some(now);
        changed
    }
}

/// What an [`StateStore::apply`] call changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateChange {
    pub fields: Vec<Field>,
    pub packs_enumerated: bool,
    pub packs_updated: Vec<String>,
}

impl StateChange {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && !self.packs_enumerated && self.packs_updated.is_empty()
    }

    pub fn serial_changed(&self) -> bool {
        self.fields.contains(&Field::SerialNumber)
    }

    fn record(&mut self, field: Field, changed: bool) {
        if changed && !self.fields.contains(&field) {
            self.fields.push(field);
        }
    }
}

/// Canonical device state. Only decoded device events mutate it.
#[derive(Debug, Default)]
pub struct StateStore {
    state: DeviceState,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> &DeviceState {
        &self.state
    }

    /// Merges the fields carried by `event`; fields it does not carry keep their value and
    /// timestamp.
    pub fn apply(&mut self, event: &DeviceEvent, now: DateTime<Local>) -> StateChange {
        let mut change = StateChange::default();
        match event {
            DeviceEvent::Telemetry(report) => self.apply_report(report, now, &mut change),
            DeviceEvent::Firmware { serial, modules } => {
                let serial_changed =
                    self.state
                        .set(Field::SerialNumber, FieldValue::Text(serial.clone()), now);
                change.record(Field::SerialNumber, serial_changed);
                if !modules.is_empty() {
                    let version = modules
                        .iter()
                        .map(|(module, version)| format!("{module} {version}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let version_changed =
                        self.state
                            .set(Field::FirmwareVersion, FieldValue::Text(version), now);
                    change.record(Field::FirmwareVersion, version_changed);
                }
            }
            DeviceEvent::SerialReported(serial) => {
                let changed =
                    self.state
                        .set(Field::SerialNumber, FieldValue::Text(serial.clone()), now);
                change.record(Field::SerialNumber, changed);
            }
            DeviceEvent::TimeSyncRequested | DeviceEvent::CommandAck(_) => {}
        }
        if !change.is_empty() {
            debug!("state change: {change:?}");
        }
        change
    }

    fn apply_report(
        &mut self,
        report: &TelemetryReport,
        now: DateTime<Local>,
        change: &mut StateChange,
    ) {
        for (field, value) in &report.readings {
            let changed = self.state.set(*field, value.clone(), now);
            change.record(*field, changed);
        }
        if let Some(serial) = &report.serial {
            let changed = self
                .state
                .set(Field::SerialNumber, FieldValue::Text(serial.clone()), now);
            change.record(Field::SerialNumber, changed);
        }
        // a report without readings still proves the device is alive
        self.state.last_update = Some(now);

        if report.enumerates_packs {
            let serials: Vec<&str> = report.packs.iter().map(|p| p.serial.as_str()).collect();
            let known: Vec<&str> = self.state.packs.iter().map(|(s, _)| s.as_str()).collect();
            if serials != known {
                let mut previous = std::mem::take(&mut self.state.packs);
                self.state.packs = serials
                    .iter()
                    .map(|serial| {
                        let state = previous
                            .iter()
                            .position(|(s, _)| s.as_str() == *serial)
                            .map(|i| previous.swap_remove(i).1)
                            .unwrap_or_default();
                        ((*serial).to_string(), state)
                    })
                    .collect();
                change.packs_enumerated = true;
            }
        }

        for pack in &report.packs {
            match self.state.packs.iter_mut().find(|(s, _)| *s == pack.serial) {
                Some((serial, state)) => {
                    if state.merge(pack, now) {
                        change.packs_updated.push(serial.clone());
                    }
                }
                None => debug!("ignoring data for unenumerated pack {}", pack.serial),
            }
        }
    }

    /// True when no device update was seen within `max_age`.
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Local>) -> bool {
        match self.state.last_update {
            Some(updated_at) => now - updated_at > max_age,
            None => true,
        }
    }

    pub fn is_field_stale(&self, field: Field, max_age: Duration, now: DateTime<Local>) -> bool {
        match self.state.reading(field) {
            Some(reading) => now - reading.updated_at > max_age,
            None => true,
        }
    }

    pub fn age(&self, now: DateTime<Local>) -> Option<Duration> {
        self.state.last_update.map(|updated_at| now - updated_at)
    }
}
