use serde::Serialize;

pub const DISCOVERY_PREFIX: &str = "homeassistant";
pub const STATE_PREFIX: &str = "solarflow";

pub fn node_id(device_id: &str) -> String {
    format!("solarflow_{device_id}")
}

pub fn unique_id(device_id: &str, key: &str) -> String {
    format!("{}_{key}", node_id(device_id))
}

pub fn config_topic(component: Component, device_id: &str, key: &str) -> String {
    format!(
        "{DISCOVERY_PREFIX}/{}/{}/{key}/config",
        component.as_str(),
        node_id(device_id)
    )
}

pub fn state_topic(device_id: &str, key: &str) -> String {
    format!("{STATE_PREFIX}/{device_id}/{key}/state")
}

pub fn command_topic(device_id: &str, key: &str) -> String {
    format!("{STATE_PREFIX}/{device_id}/{key}/set")
}

pub fn availability_topic(device_id: &str) -> String {
    format!("{STATE_PREFIX}/{device_id}/availability")
}

/// `DeviceConfig` is used to define the configuration for a Home Assistant device
/// in the MQTT discovery protocol and is used to group entities together.
///
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    name: String,
    model: String,
    identifiers: Vec<String>,
    manufacturer: String,
    // Software version of the application that supplies the discovered MQTT item.
    sw_version: String,
}

impl DeviceConfig {
    pub fn new(name: String, model: String, identifiers: Vec<String>) -> Self {
        Self {
            name,
            model,
            identifiers,
            manufacturer: "Zendure".to_string(),
            // Rust compiler sets the CARGO_PKG_VERSION environment from the Cargo.toml .
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Sensor,
    Number,
    Select,
    Switch,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Sensor => "sensor",
            Component::Number => "number",
            Component::Select => "select",
            Component::Switch => "switch",
        }
    }
}

/// `EntityConfig` is the discovery payload of a single Home Assistant entity.
///
/// Every entity has its own state topic carrying the raw value, controllable entities
/// additionally get a command topic. More information about the MQTT discovery protocol
/// can be found here: https://www.home-assistant.io/docs/mqtt/discovery/
///
#[derive(Serialize, Clone, Debug)]
pub struct EntityConfig {
    #[serde(skip)]
    pub component: Component,
    #[serde(skip)]
    pub key: String,
    pub unique_id: String, // Stable across restarts so the platform never duplicates entities.
    name: String,
    pub state_topic: String,
    availability_topic: String,
    device: DeviceConfig,
    // exclude optional if they are not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Vec<String>>,
}

impl EntityConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new_entity(
        component: Component,
        device_id: &str,
        device_config: &DeviceConfig,
        key: &str,
        name: &str,
        device_class: Option<String>,
        unit_of_measurement: Option<String>,
        state_class: Option<String>,
    ) -> Self {
        let command_topic = match component {
            Component::Sensor => None,
            _ => Some(command_topic(device_id, key)),
        };
        EntityConfig {
            component,
            key: key.to_string(),
            unique_id: unique_id(device_id, key),
            name: name.to_string(),
            state_topic: state_topic(device_id, key),
            availability_topic: availability_topic(device_id),
            device: device_config.clone(),
            command_topic,
            unit_of_measurement,
            device_class,
            state_class,
            min: None,
            max: None,
            step: None,
            mode: None,
            options: None,
        }
    }

    pub fn config_topic(&self, device_id: &str) -> String {
        config_topic(self.component, device_id, &self.key)
    }

    pub fn string(device_id: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_entity(
            Component::Sensor,
            device_id,
            device_config,
            key,
            name,
            None,
            None,
            None,
        )
    }

    pub fn power(device_id: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_entity(
            Component::Sensor,
            device_id,
            device_config,
            key,
            name,
            Some("power".to_string()),
            Some("W".to_string()),
            Some("measurement".to_string()),
        )
    }

    pub fn battery(device_id: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_entity(
            Component::Sensor,
            device_id,
            device_config,
            key,
            name,
            Some("battery".to_string()),
            Some("%".to_string()),
            Some("measurement".to_string()),
        )
    }

    pub fn duration(device_id: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_entity(
            Component::Sensor,
            device_id,
            device_config,
            key,
            name,
            Some("duration".to_string()),
            Some("min".to_string()),
            Some("measurement".to_string()),
        )
    }

    pub fn temperature(
        device_id: &str,
        device_config: &DeviceConfig,
        name: &str,
        key: &str,
    ) -> Self {
        Self::new_entity(
            Component::Sensor,
            device_id,
            device_config,
            key,
            name,
            Some("temperature".to_string()),
            Some("K".to_string()),
            Some("measurement".to_string()),
        )
    }

    /// A slider between `min` and `max`.
    #[allow(clippy::too_many_arguments)]
    pub fn number(
        device_id: &str,
        device_config: &DeviceConfig,
        name: &str,
        key: &str,
        unit: &str,
        min: f64,
        max: f64,
        step: f64,
    ) -> Self {
        let mut config = Self::new_entity(
            Component::Number,
            device_id,
            device_config,
            key,
            name,
            None,
            Some(unit.to_string()),
            None,
        );
        config.min = Some(min);
        config.max = Some(max);
        config.step = Some(step);
        config.mode = Some("slider".to_string());
        config
    }

    pub fn select(
        device_id: &str,
        device_config: &DeviceConfig,
        name: &str,
        key: &str,
        options: Vec<String>,
    ) -> Self {
        let mut config = Self::new_entity(
            Component::Select,
            device_id,
            device_config,
            key,
            name,
            None,
            None,
            None,
        );
        config.options = Some(options);
        config
    }

    pub fn switch(device_id: &str, device_config: &DeviceConfig, name: &str, key: &str) -> Self {
        Self::new_entity(
            Component::Switch,
            device_id,
            device_config,
            key,
            name,
            None,
            None,
            None,
        )
    }
}
