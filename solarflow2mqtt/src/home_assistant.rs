use std::collections::HashMap;

use log::{debug, error, info, warn};

use crate::command::{
    DeviceIntent, PlatformIntent, MAX_INVERTER_INPUT_RANGE, MAX_SOC_RANGE, MIN_SOC_RANGE,
};
use crate::device::DeviceIdentity;
use crate::error::CommandError;
use crate::home_assistant_config::{
    availability_topic, command_topic, config_topic, state_topic, Component, DeviceConfig,
    EntityConfig, STATE_PREFIX,
};
use crate::mqtt_wrapper::{MqttWrapper, QoS};
use crate::protocol::{option_names, BYPASS_MODES, PV_BRANDS};
use crate::state::{format_number, DeviceState, Field, PackState, StateChange};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

pub const CONTROLLER_KEY: &str = "controller";
pub const CONTROLLER_PHASE_KEY: &str = "controller_phase";
pub const SOLAR_OVERFLOW_KEY: &str = "solar_overflow_power";
pub const OPERATING_STATE_KEY: &str = "state";

#[derive(Clone, Copy)]
enum CommandKind {
    OutputLimit,
    MinSoc,
    MaxSoc,
    MaxInverterInput,
    BypassMode,
    PvBrand,
    Buzzer,
    Controller,
}

const COMMANDS: [(&str, CommandKind); 8] = [
    ("output_limit", CommandKind::OutputLimit),
    ("min_soc", CommandKind::MinSoc),
    ("max_soc", CommandKind::MaxSoc),
    ("max_inverter_input", CommandKind::MaxInverterInput),
    ("bypass_mode", CommandKind::BypassMode),
    ("pv_brand", CommandKind::PvBrand),
    ("buzzer_switch", CommandKind::Buzzer),
    (CONTROLLER_KEY, CommandKind::Controller),
];

fn pack_keys(serial: &str) -> [String; 3] {
    [
        format!("pack_{serial}_soc"),
        format!("pack_{serial}_state"),
        format!("pack_{serial}_temperature"),
    ]
}

/// Power the panels deliver beyond what goes into the battery.
pub fn solar_overflow(state: &DeviceState) -> Option<f64> {
    let solar = state.number(Field::SolarInputPower)?;
    let charge = state.number(Field::BatteryChargePower).unwrap_or(0.);
    Some((solar - charge).max(0.))
}

pub fn operating_state(state: &DeviceState) -> Option<&'static str> {
    let discharge = state.number(Field::BatteryDischargePower);
    let charge = state.number(Field::BatteryChargePower);
    let solar = state.number(Field::SolarInputPower);
    if discharge.is_none() && charge.is_none() && solar.is_none() {
        return None;
    }
    Some(if discharge.unwrap_or(0.) > 0. {
        "discharging"
    } else if charge.unwrap_or(0.) > 0. {
        "charging"
    } else if solar.unwrap_or(0.) > 0. {
        "solar_passthrough"
    } else {
        "idle"
    })
}

/// Publishes discovery descriptors and entity states to Home Assistant.
///
/// Remembers the last value sent per entity and skips publishes that would not change
/// anything.
pub struct HomeAssistant {
    device_id: String,
    max_output: f64,
    command_prefix: String,
    last_published: HashMap<String, String>,
    /// Serial and pack list of the last discovery run.
    discovered: Option<(String, Vec<String>)>,
    online: Option<bool>,
}

impl HomeAssistant {
    pub fn new(identity: &DeviceIdentity, max_output: f64) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            max_output,
            command_prefix: format!("{STATE_PREFIX}/{}/", identity.device_id),
            last_published: HashMap::new(),
            discovered: None,
            online: None,
        }
    }

    pub fn availability_topic(&self) -> String {
        availability_topic(&self.device_id)
    }

    pub fn is_online(&self) -> bool {
        self.online == Some(true)
    }

    fn publish_retained<MQTT: MqttWrapper>(client: &mut MQTT, topic: &str, payload: String) {
        debug!("Publishing to {topic} with payload {payload}");
        if let Err(e) = client.publish(topic, QoS::AtMostOnce, true, payload) {
            warn!("Failed to publish message: {e:?}");
        }
    }

    pub fn entity_configs(&self, serial: &str, packs: &[String]) -> Vec<EntityConfig> {
        let id = self.device_id.as_str();
        let device_config = DeviceConfig::new(
            "SolarFlow".to_string(),
            "SolarFlow".to_string(),
            vec![self.device_id.clone(), serial.to_string()],
        );
        let key = |field: Field| field.key();

        let mut entities = vec![
            EntityConfig::battery(id, &device_config, "Battery", key(Field::BatteryLevel)),
            EntityConfig::power(
                id,
                &device_config,
                "Solar Input Power",
                key(Field::SolarInputPower),
            ),
            EntityConfig::power(
                id,
                &device_config,
                "Solar Input 1 Power",
                key(Field::SolarInput1Power),
            ),
            EntityConfig::power(
                id,
                &device_config,
                "Solar Input 2 Power",
                key(Field::SolarInput2Power),
            ),
            EntityConfig::power(id, &device_config, "Solar Overflow Power", SOLAR_OVERFLOW_KEY),
            EntityConfig::power(
                id,
                &device_config,
                "Home Output Power",
                key(Field::HomeOutputPower),
            ),
            EntityConfig::power(
                id,
                &device_config,
                "Battery Charge Power",
                key(Field::BatteryChargePower),
            ),
            EntityConfig::power(
                id,
                &device_config,
                "Battery Discharge Power",
                key(Field::BatteryDischargePower),
            ),
            EntityConfig::duration(
                id,
                &device_config,
                "Battery Runtime",
                key(Field::BatteryRuntime),
            ),
            EntityConfig::duration(
                id,
                &device_config,
                "Battery Charge Time",
                key(Field::BatteryChargeTime),
            ),
            EntityConfig::string(id, &device_config, "State", OPERATING_STATE_KEY),
            EntityConfig::string(id, &device_config, "Serial Number", key(Field::SerialNumber)),
            EntityConfig::string(
                id,
                &device_config,
                "Firmware Version",
                key(Field::FirmwareVersion),
            ),
            EntityConfig::string(id, &device_config, "Controller Phase", CONTROLLER_PHASE_KEY),
            EntityConfig::number(
                id,
                &device_config,
                "Output Limit",
                key(Field::OutputLimit),
                "W",
                0.,
                self.max_output,
                1.,
            ),
            EntityConfig::number(
                id,
                &device_config,
                "Min Capacity",
                key(Field::MinSoc),
                "%",
                MIN_SOC_RANGE.0,
                MIN_SOC_RANGE.1,
                1.,
            ),
            EntityConfig::number(
                id,
                &device_config,
                "Max Capacity",
                key(Field::MaxSoc),
                "%",
                MAX_SOC_RANGE.0,
                MAX_SOC_RANGE.1,
                1.,
            ),
            EntityConfig::number(
                id,
                &device_config,
                "Max Inverter Input",
                key(Field::MaxInverterInput),
                "W",
                MAX_INVERTER_INPUT_RANGE.0,
                MAX_INVERTER_INPUT_RANGE.1,
                100.,
            ),
            EntityConfig::select(
                id,
                &device_config,
                "Bypass Mode",
                key(Field::BypassMode),
                option_names(&BYPASS_MODES),
            ),
            EntityConfig::select(
                id,
                &device_config,
                "PV Brand",
                key(Field::PvBrand),
                option_names(&PV_BRANDS),
            ),
            EntityConfig::switch(id, &device_config, "Buzzer", key(Field::BuzzerSwitch)),
            EntityConfig::switch(id, &device_config, "Automatic Controller", CONTROLLER_KEY),
        ];

        for (i, serial) in packs.iter().enumerate() {
            let index = i + 1;
            let [soc, state, temperature] = pack_keys(serial);
            entities.extend([
                EntityConfig::battery(
                    id,
                    &device_config,
                    &format!("Battery Pack {index}"),
                    &soc,
                ),
                EntityConfig::string(
                    id,
                    &device_config,
                    &format!("Battery Pack {index} State"),
                    &state,
                ),
                EntityConfig::temperature(
                    id,
                    &device_config,
                    &format!("Battery Pack {index} Temperature"),
                    &temperature,
                ),
            ]);
        }
        entities
    }

    /// True once the serial is known and differs from what was announced last, or the
    /// pack enumeration changed since.
    pub fn needs_discovery(&self, state: &DeviceState) -> bool {
        match state.serial() {
            Some(serial) => match &self.discovered {
                Some((discovered_serial, packs)) => {
                    discovered_serial != serial || *packs != state.pack_serials()
                }
                None => true,
            },
            None => false,
        }
    }

    /// Publishes the retained discovery descriptors. Returns false while the serial is
    /// unknown.
    pub fn publish_discovery<MQTT: MqttWrapper>(
        &mut self,
        client: &mut MQTT,
        state: &DeviceState,
    ) -> bool {
        let Some(serial) = state.serial() else {
            debug!("Device serial not yet known, not sending discovery info");
            return false;
        };
        let packs = state.pack_serials();

        if let Some((_, previous)) = &self.discovered {
            for removed in previous.iter().filter(|serial| !packs.contains(serial)) {
                info!("Battery pack {removed} is gone, removing its entities");
                for key in pack_keys(removed) {
                    let topic = config_topic(Component::Sensor, &self.device_id, &key);
                    Self::publish_retained(client, &topic, String::new());
                    self.last_published.remove(&key);
                }
            }
        }

        info!(
            "Sending discovery info for {serial} with {} battery pack(s)",
            packs.len()
        );
        for config in self.entity_configs(serial, &packs) {
            match serde_json::to_string(&config) {
                Ok(payload) => {
                    Self::publish_retained(client, &config.config_topic(&self.device_id), payload)
                }
                Err(e) => error!("Cannot serialize discovery info for {}: {e}", config.key),
            }
        }
        self.discovered = Some((serial.to_string(), packs));
        true
    }

    /// Publishes availability on transitions only. Going online forgets what was
    /// published before so every entity is sent again.
    pub fn set_availability<MQTT: MqttWrapper>(&mut self, client: &mut MQTT, online: bool) {
        if self.online == Some(online) {
            return;
        }
        let payload = if online { ONLINE } else { OFFLINE };
        info!("Device is {payload}");
        Self::publish_retained(client, &self.availability_topic(), payload.to_string());
        if online {
            self.last_published.clear();
        }
        self.online = Some(online);
    }

    /// Makes the next [`Self::set_availability`] publish even without a transition, e.g.
    /// after the broker sent our last will on a reconnect.
    pub fn forget_availability(&mut self) {
        self.online = None;
    }

    /// Returns whether anything was published.
    pub fn publish_state<MQTT: MqttWrapper>(
        &mut self,
        client: &mut MQTT,
        key: &str,
        value: &str,
    ) -> bool {
        if self.last_published.get(key).is_some_and(|last| last == value) {
            debug!("{key} unchanged at {value}, not publishing");
            return false;
        }
        Self::publish_retained(client, &state_topic(&self.device_id, key), value.to_string());
        self.last_published.insert(key.to_string(), value.to_string());
        true
    }

    fn publish_derived<MQTT: MqttWrapper>(&mut self, client: &mut MQTT, state: &DeviceState) {
        if let Some(overflow) = solar_overflow(state) {
            self.publish_state(client, SOLAR_OVERFLOW_KEY, &format_number(overflow));
        }
        if let Some(operating_state) = operating_state(state) {
            self.publish_state(client, OPERATING_STATE_KEY, operating_state);
        }
    }

    fn publish_pack<MQTT: MqttWrapper>(
        &mut self,
        client: &mut MQTT,
        serial: &str,
        pack: &PackState,
    ) {
        let [soc, state, temperature] = pack_keys(serial);
        if let Some(value) = pack.soc {
            self.publish_state(client, &soc, &format_number(value));
        }
        if let Some(status) = pack.status {
            self.publish_state(client, &state, status.as_str());
        }
        if let Some(value) = pack.max_temperature {
            self.publish_state(client, &temperature, &format_number(value));
        }
    }

    pub fn publish_changes<MQTT: MqttWrapper>(
        &mut self,
        client: &mut MQTT,
        state: &DeviceState,
        change: &StateChange,
    ) {
        for field in &change.fields {
            if let Some(value) = state.value(*field) {
                self.publish_state(client, field.key(), &value.to_string());
            }
        }
        if change.fields.iter().any(|field| {
            matches!(
                field,
                Field::SolarInputPower | Field::BatteryChargePower | Field::BatteryDischargePower
            )
        }) {
            self.publish_derived(client, state);
        }
        for (serial, pack) in state.packs() {
            if change.packs_enumerated || change.packs_updated.contains(serial) {
                self.publish_pack(client, serial, pack);
            }
        }
    }

    /// Publishes every known value, subject to the usual change suppression.
    pub fn publish_all<MQTT: MqttWrapper>(&mut self, client: &mut MQTT, state: &DeviceState) {
        for field in Field::ALL {
            if let Some(value) = state.value(field) {
                self.publish_state(client, field.key(), &value.to_string());
            }
        }
        self.publish_derived(client, state);
        for (serial, pack) in state.packs() {
            self.publish_pack(client, serial, pack);
        }
    }

    pub fn command_topics(&self) -> Vec<String> {
        COMMANDS
            .iter()
            .map(|(key, _)| command_topic(&self.device_id, key))
            .collect()
    }

    /// Maps a message on one of our command topics to an intent. Returns `None` for any
    /// other topic.
    pub fn parse_command(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Option<Result<PlatformIntent, CommandError>> {
        let key = topic
            .strip_prefix(self.command_prefix.as_str())?
            .strip_suffix("/set")?;
        let (what, kind) = COMMANDS.iter().find(|(k, _)| *k == key)?;
        Some(parse_intent(*what, *kind, payload))
    }
}

fn parse_intent(
    what: &'static str,
    kind: CommandKind,
    payload: &[u8],
) -> Result<PlatformIntent, CommandError> {
    let invalid = || CommandError::InvalidValue {
        what,
        value: String::from_utf8_lossy(payload).into_owned(),
    };
    let text = std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|_| invalid())?;
    let number = || -> Result<f64, CommandError> {
        text.parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(invalid)
    };
    let switch = || -> Result<bool, CommandError> {
        if text.eq_ignore_ascii_case("ON") {
            Ok(true)
        } else if text.eq_ignore_ascii_case("OFF") {
            Ok(false)
        } else {
            Err(invalid())
        }
    };
    let intent = match kind {
        CommandKind::OutputLimit => DeviceIntent::OutputLimit(number()?),
        CommandKind::MinSoc => DeviceIntent::MinSoc(number()?),
        CommandKind::MaxSoc => DeviceIntent::MaxSoc(number()?),
        CommandKind::MaxInverterInput => DeviceIntent::MaxInverterInput(number()?),
        CommandKind::BypassMode => DeviceIntent::BypassMode(text.to_string()),
        CommandKind::PvBrand => DeviceIntent::PvBrand(text.to_string()),
        CommandKind::Buzzer => DeviceIntent::Buzzer(switch()?),
        CommandKind::Controller => return Ok(PlatformIntent::Controller(switch()?)),
    };
    Ok(PlatformIntent::Device(intent))
}
