mod config;
mod logging;
mod rumqttc_wrapper;
mod signals;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Local;
use config::Config;
use log::{error, info, warn};
use rumqttc_wrapper::RumqttcWrapper;
use solarflow2mqtt::dispatcher::{last_will, Dispatcher, Event};
use solarflow2mqtt::mqtt_wrapper::MqttWrapper;

/// Upper bound for a single wait on the event channel.
const MAX_WAIT: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    logging::init_logger();
    info!("Running revision: {}", env!("GIT_HASH"));
    if std::env::args().len() > 1 {
        error!("Arguments passed. Tool is configured by config.toml in its path");
    }

    let config = Config::load();
    config
        .controller
        .build_controller()
        .context("invalid [controller] section")?;
    if !config.is_valid() {
        bail!(
            "incomplete configuration: [device] topic_prefix and device_id, [mqtt] host and \
             [controller] house_power_topic are required"
        );
    }
    info!(
        "broker {}:{}, policy {}",
        config.mqtt.host,
        config.mqtt.port(),
        config.controller.policy.name()
    );

    let (inbox, events) = mpsc::channel();
    signals::spawn_shutdown_listener(inbox.clone());
    let client = RumqttcWrapper::new(&config.mqtt, Some(last_will(&config.device)), inbox);
    let mut dispatcher = Dispatcher::new(client, &config.device, &config.controller)?;
    dispatcher.start(Local::now());

    while dispatcher.is_running() {
        let now = Local::now();
        let wait = match dispatcher.next_deadline() {
            Some(deadline) if deadline <= now => {
                dispatcher.handle(Event::Timer, now);
                continue;
            }
            Some(deadline) => (deadline - now).to_std().unwrap_or(MAX_WAIT).min(MAX_WAIT),
            None => MAX_WAIT,
        };
        let event = match events.recv_timeout(wait) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => Event::Timer,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("all event sources are gone");
                Event::Shutdown
            }
        };
        dispatcher.handle(event, Local::now());
    }
    Ok(())
}
