//! Vendor MQTT payloads.
//!
//! The device reports JSON documents on `/<prefix>/<device-id>/...` topics and accepts
//! JSON commands on the matching write topics. Decoding yields [`DeviceEvent`]s; encoding
//! turns a [`DeviceCommand`] into the exact topic and payload to publish. No I/O happens
//! here.

use std::collections::BTreeMap;

use log::warn;
use serde_derive::Deserialize;
use serde_json::{json, Value};

use crate::device::DeviceIdentity;
use crate::error::DecodeError;
use crate::state::{Field, FieldValue, PackStatus};

/// Vendor codes of the bypass mode select.
pub const BYPASS_MODES: [(&str, i64); 3] =
    [("automatic", 0), ("always_off", 1), ("always_on", 2)];

/// Vendor codes of the PV inverter brand select.
pub const PV_BRANDS: [(&str, i64); 7] = [
    ("other", 0),
    ("hoymiles", 1),
    ("enphase", 2),
    ("apsystems", 3),
    ("anker", 4),
    ("deye", 5),
    ("bosswerk", 15),
];

pub fn option_name(table: &[(&'static str, i64)], code: i64) -> Option<&'static str> {
    table.iter().find(|(_, c)| *c == code).map(|(name, _)| *name)
}

pub fn option_code(table: &[(&'static str, i64)], name: &str) -> Option<i64> {
    table.iter().find(|(n, _)| *n == name).map(|(_, code)| *code)
}

pub fn option_names(table: &[(&'static str, i64)]) -> Vec<String> {
    table.iter().map(|(name, _)| name.to_string()).collect()
}

#[derive(Clone, Copy)]
enum Conversion {
    Number,
    /// value is sent in tenths of a percent
    PerMille,
    Select(&'static [(&'static str, i64)]),
    Switch,
}

// pvPower* is sent by the Hub1200, solarPower* by the Hub2000
const PROPERTIES: [(&str, Field, Conversion); 18] = [
    ("electricLevel", Field::BatteryLevel, Conversion::Number),
    ("solarInputPower", Field::SolarInputPower, Conversion::Number),
    ("pvPower1", Field::SolarInput1Power, Conversion::Number),
    ("solarPower1", Field::SolarInput1Power, Conversion::Number),
    ("pvPower2", Field::SolarInput2Power, Conversion::Number),
    ("solarPower2", Field::SolarInput2Power, Conversion::Number),
    ("outputHomePower", Field::HomeOutputPower, Conversion::Number),
    ("outputPackPower", Field::BatteryChargePower, Conversion::Number),
    ("packInputPower", Field::BatteryDischargePower, Conversion::Number),
    ("outputLimit", Field::OutputLimit, Conversion::Number),
    ("inverseMaxPower", Field::MaxInverterInput, Conversion::Number),
    ("minSoc", Field::MinSoc, Conversion::PerMille),
    ("socSet", Field::MaxSoc, Conversion::PerMille),
    ("remainOutTime", Field::BatteryRuntime, Conversion::Number),
    ("remainInputTime", Field::BatteryChargeTime, Conversion::Number),
    ("passMode", Field::BypassMode, Conversion::Select(&BYPASS_MODES)),
    ("pvBrand", Field::PvBrand, Conversion::Select(&PV_BRANDS)),
    ("buzzerSwitch", Field::BuzzerSwitch, Conversion::Switch),
];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PackReport {
    pub serial: String,
    pub soc: Option<f64>,
    pub status: Option<PackStatus>,
    pub max_temperature: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryReport {
    pub readings: Vec<(Field, FieldValue)>,
    pub serial: Option<String>,
    pub packs: Vec<PackReport>,
    /// The report carries the canonical list of installed packs.
    pub enumerates_packs: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandAck {
    pub id: u64,
    pub accepted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    Telemetry(TelemetryReport),
    Firmware {
        serial: String,
        modules: Vec<(String, i64)>,
    },
    SerialReported(String),
    TimeSyncRequested,
    CommandAck(CommandAck),
}

/// A frame to send to the device.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    WriteProperties {
        id: u64,
        issued_at: i64,
        properties: BTreeMap<String, i64>,
    },
    ReadAll {
        id: u64,
        issued_at: i64,
    },
    TimeSyncReply {
        timestamp: i64,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackFrame {
    sn: String,
    soc_level: Option<f64>,
    state: Option<i64>,
    max_temp: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteReplyFrame {
    message_id: Value,
    success: bool,
}

#[derive(Deserialize)]
struct ModuleFrame {
    module: String,
    version: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirmwareFrame {
    device_sn: String,
    #[serde(default)]
    modules: Vec<ModuleFrame>,
}

#[derive(Deserialize)]
struct LogBody {
    sn: Option<String>,
}

#[derive(Deserialize)]
struct LogFrame {
    log: LogBody,
}

pub struct Codec {
    identity: DeviceIdentity,
    report_topic: String,
    time_request_topic: String,
    write_reply_topic: String,
    firmware_topic: String,
    log_topic: String,
}

impl Codec {
    pub fn new(identity: &DeviceIdentity) -> Self {
        Self {
            identity: identity.clone(),
            report_topic: identity.report_topic(),
            time_request_topic: identity.time_request_topic(),
            write_reply_topic: identity.write_reply_topic(),
            firmware_topic: identity.firmware_topic(),
            log_topic: identity.log_topic(),
        }
    }

    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<DeviceEvent, DecodeError> {
        if topic == self.time_request_topic {
            // the request carries nothing we need
            return Ok(DeviceEvent::TimeSyncRequested);
        }
        if topic == self.report_topic {
            decode_report(topic, parse_typed(topic, payload)?)
        } else if topic == self.write_reply_topic {
            let frame: WriteReplyFrame = parse_typed(topic, payload)?;
            let id = match &frame.message_id {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            }
            .ok_or_else(|| {
                DecodeError::malformed(topic, format!("unexpected messageId {}", frame.message_id))
            })?;
            Ok(DeviceEvent::CommandAck(CommandAck {
                id,
                accepted: frame.success,
            }))
        } else if topic == self.firmware_topic {
            let frame: FirmwareFrame = parse_typed(topic, payload)?;
            Ok(DeviceEvent::Firmware {
                serial: frame.device_sn,
                modules: frame
                    .modules
                    .into_iter()
                    .map(|m| (m.module, m.version))
                    .collect(),
            })
        } else if topic == self.log_topic {
            let frame: LogFrame = parse_typed(topic, payload)?;
            frame
                .log
                .sn
                .map(DeviceEvent::SerialReported)
                .ok_or_else(|| DecodeError::malformed(topic, "log entry without serial"))
        } else {
            Err(DecodeError::UnknownTopic(topic.to_string()))
        }
    }

    /// Serialises a command. Equal commands always produce equal topic and payload.
    pub fn encode(&self, command: &DeviceCommand) -> (String, String) {
        match command {
            DeviceCommand::WriteProperties {
                id,
                issued_at,
                properties,
            } => (
                self.identity.write_topic(),
                json!({
                    "deviceId": self.identity.device_id,
                    "messageId": id.to_string(),
                    "properties": properties,
                    "timestamp": issued_at,
                })
                .to_string(),
            ),
            DeviceCommand::ReadAll { id, issued_at } => (
                self.identity.read_topic(),
                json!({
                    "deviceId": self.identity.device_id,
                    "messageId": id.to_string(),
                    "properties": ["getAll"],
                    "timestamp": issued_at,
                })
                .to_string(),
            ),
            DeviceCommand::TimeSyncReply { timestamp } => (
                self.identity.time_reply_topic(),
                json!({
                    "messageId": timestamp.to_string(),
                    "timestamp": timestamp,
                })
                .to_string(),
            ),
        }
    }
}

fn parse_typed<T: serde::de::DeserializeOwned>(
    topic: &str,
    payload: &[u8],
) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::malformed(topic, e.to_string()))
}

fn decode_report(topic: &str, frame: Value) -> Result<DeviceEvent, DecodeError> {
    let properties = frame
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| DecodeError::malformed(topic, "missing properties object"))?;

    let mut report = TelemetryReport::default();
    for (key, field, conversion) in PROPERTIES {
        let Some(raw) = properties.get(key) else {
            continue;
        };
        let number = raw
            .as_f64()
            .ok_or_else(|| DecodeError::malformed(topic, format!("{key} is not a number: {raw}")))?;
        let value = match conversion {
            Conversion::Number => FieldValue::Number(number),
            Conversion::PerMille => FieldValue::Number(number / 10.),
            Conversion::Switch => {
                let state = if number as i64 == 1 { "ON" } else { "OFF" };
                FieldValue::Text(state.to_string())
            }
            Conversion::Select(table) => match option_name(table, number as i64) {
                Some(name) => FieldValue::Text(name.to_string()),
                None => {
                    warn!("ignoring unknown {key} value {number}");
                    continue;
                }
            },
        };
        report.readings.push((field, value));
    }
    report.serial = frame
        .get("sn")
        .or_else(|| properties.get("sn"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(packs) = frame.get("packData") {
        let packs: Vec<PackFrame> = serde_json::from_value(packs.clone())
            .map_err(|e| DecodeError::malformed(topic, format!("packData: {e}")))?;
        report.packs = packs
            .into_iter()
            .map(|pack| PackReport {
                serial: pack.sn,
                soc: pack.soc_level,
                status: pack.state.map(PackStatus::from_code),
                max_temperature: pack.max_temp.map(|t| t / 10.),
            })
            .collect();
        report.enumerates_packs = properties.contains_key("packNum");
    }

    Ok(DeviceEvent::Telemetry(report))
}
