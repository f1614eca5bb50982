use std::path::PathBuf;
use std::{env, fs};

use log::{info, warn};
use serde::Deserialize;
use solarflow2mqtt::{
    control_config::ControllerConfig, device::DeviceIdentity, mqtt_config::MqttConfig,
};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceIdentity,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl Config {
    pub fn is_valid(&self) -> bool {
        self.device.is_valid() && self.mqtt.is_valid() && self.controller.is_valid()
    }

    /// `$SOLARFLOW_CONFIG` if set, else `config.toml` in the working directory, else next
    /// to the executable.
    fn path() -> PathBuf {
        if let Ok(path) = env::var("SOLARFLOW_CONFIG") {
            return PathBuf::from(path);
        }
        let path = PathBuf::from("config.toml");
        if path.exists() {
            return path;
        }
        info!("config.toml does not exist in working directory. Trying relative path");
        match env::current_exe() {
            Ok(mut exe) => {
                exe.pop();
                exe.push("config.toml");
                exe
            }
            Err(_) => path,
        }
    }

    pub fn load() -> Config {
        // parse config from TOML file if present
        let path = Self::path();
        info!("loading configuration from {}", path.display());
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Could not read {}: {e}", path.display());
                "".into()
            }
        };
        let mut config = match toml::from_str::<Config>(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("toml config unparsable: {e}");
                Config::default()
            }
        };
        config.apply_env(|key| env::var(key).ok());
        config
    }

    /// Overwrites config values with environment variables that are set.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        // $MQTT_BROKER_HOST
        if let Some(host) = var("MQTT_BROKER_HOST") {
            self.mqtt.host = host;
        }
        // $MQTT_PORT (optional)
        if let Some(port) = var("MQTT_PORT") {
            match port.parse() {
                Ok(port) => self.mqtt.port = Some(port),
                Err(e) => warn!("ignoring MQTT_PORT={port}: {e}"),
            }
        }
        // $MQTT_USERNAME (optional)
        if let Some(username) = var("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        // $MQTT_PASSWORD (optional)
        if let Some(password) = var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        // $SOLARFLOW_TOPIC_PREFIX
        if let Some(prefix) = var("SOLARFLOW_TOPIC_PREFIX") {
            self.device.topic_prefix = prefix;
        }
        // $SOLARFLOW_DEVICE_ID
        if let Some(device_id) = var("SOLARFLOW_DEVICE_ID") {
            self.device.device_id = device_id;
        }
    }
}
