//! The single consumer of all inbound events.
//!
//! The [`Dispatcher`] owns the MQTT client, the canonical state and the controller. It is
//! driven by one thread handing it [`Event`]s together with the current time, so nothing in
//! here needs locking and every test can feed it a scripted clock.

use chrono::{DateTime, Duration, Local, TimeZone};
use log::{debug, info, warn};

use crate::command::{
    AckOutcome, CommandTranslator, DeviceIntent, PlatformIntent, SetpointCommand,
};
use crate::control_config::ControllerConfig;
use crate::controller::{ControlInputs, Controller, SetpointDecision};
use crate::device::DeviceIdentity;
use crate::error::{CommandError, ConfigError, StateError};
use crate::home_assistant::{HomeAssistant, CONTROLLER_KEY, CONTROLLER_PHASE_KEY, OFFLINE};
use crate::home_assistant_config::availability_topic;
use crate::mqtt_wrapper::{MqttWrapper, QoS, Will};
use crate::protocol::{CommandAck, Codec, DeviceCommand, DeviceEvent};
use crate::scheduler::{Scheduler, Timer};
use crate::state::{DeviceState, Field, StateStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Message(InboundMessage),
    /// The client (re)established its broker connection.
    Connected,
    /// A scheduler deadline passed.
    Timer,
    Shutdown,
}

/// Marks the device offline when the bridge loses its broker connection.
pub fn last_will(identity: &DeviceIdentity) -> Will {
    Will {
        topic: availability_topic(&identity.device_id),
        payload: OFFLINE.to_string(),
    }
}

pub struct Dispatcher<MQTT: MqttWrapper> {
    client: MQTT,
    identity: DeviceIdentity,
    codec: Codec,
    store: StateStore,
    publisher: HomeAssistant,
    translator: CommandTranslator,
    controller: Controller,
    scheduler: Scheduler,
    house_power_topic: String,
    house_power: Option<(f64, DateTime<Local>)>,
    controller_enabled: bool,
    pending: Option<SetpointCommand>,
    max_output: f64,
    stale_after: Duration,
    setpoint_deadband: f64,
    retried_after_reject: bool,
    running: bool,
}

impl<MQTT: MqttWrapper> Dispatcher<MQTT> {
    pub fn new(
        client: MQTT,
        identity: &DeviceIdentity,
        config: &ControllerConfig,
    ) -> Result<Self, ConfigError> {
        let controller = config.build_controller()?;
        let max_output = config.max_output()?;
        Ok(Self {
            client,
            identity: identity.clone(),
            codec: Codec::new(identity),
            store: StateStore::new(),
            publisher: HomeAssistant::new(identity, max_output),
            translator: CommandTranslator::new(max_output),
            controller,
            scheduler: Scheduler::new(config.loop_period()),
            house_power_topic: config.house_power_topic.clone(),
            house_power: None,
            controller_enabled: config.enabled(),
            pending: None,
            max_output,
            stale_after: config.stale_after(),
            setpoint_deadband: config.setpoint_deadband(),
            retried_after_reject: false,
            running: false,
        })
    }

    pub fn client(&self) -> &MQTT {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut MQTT {
        &mut self.client
    }

    pub fn state(&self) -> &DeviceState {
        self.store.get()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_enabled(&self) -> bool {
        self.controller_enabled
    }

    /// Last setpoint sent to the device that was not rejected.
    pub fn pending(&self) -> Option<SetpointCommand> {
        self.pending
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn next_deadline(&self) -> Option<DateTime<Local>> {
        self.scheduler.next_deadline()
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut topics = self.identity.inbound_topics();
        topics.push(self.house_power_topic.clone());
        topics.extend(self.publisher.command_topics());
        topics
    }

    fn subscribe_all(&mut self) {
        for topic in self.subscriptions() {
            if let Err(e) = self.client.subscribe(&topic, QoS::AtMostOnce) {
                warn!("subscription to {topic} failed: {e}");
            }
        }
    }

    pub fn start(&mut self, now: DateTime<Local>) {
        info!(
            "Bridging device {} (prefix {}), controller {}",
            self.identity.device_id,
            self.identity.topic_prefix,
            self.controller.describe()
        );
        self.subscribe_all();
        self.publisher.set_availability(&mut self.client, false);
        self.publish_controller_state();
        self.request_all(now);
        self.scheduler.start(now, false);
        self.running = true;
    }

    pub fn handle(&mut self, event: Event, now: DateTime<Local>) {
        match event {
            Event::Message(message) => self.on_message(&message.topic, &message.payload, now),
            Event::Connected => self.on_connected(),
            Event::Timer => self.on_timer(now),
            Event::Shutdown => self.shutdown(),
        }
    }

    /// Publishes retained `offline`, drops every subscription and disconnects once all of
    /// that reached the broker.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        info!("Shutting down");
        self.publisher.set_availability(&mut self.client, false);
        for topic in self.subscriptions() {
            if let Err(e) = self.client.unsubscribe(&topic) {
                warn!("unsubscribing from {topic} failed: {e}");
            }
        }
        if let Err(e) = self.client.disconnect() {
            warn!("disconnecting from broker failed: {e:?}");
        }
        self.running = false;
    }

    fn on_connected(&mut self) {
        info!("Connected to broker, subscribing");
        self.subscribe_all();
        // the broker may have published our last will in between
        let online = self.publisher.is_online();
        self.publisher.forget_availability();
        self.publisher.set_availability(&mut self.client, online);
        if online {
            self.publish_everything();
        }
    }

    fn on_message(&mut self, topic: &str, payload: &[u8], now: DateTime<Local>) {
        if topic == self.house_power_topic {
            self.on_house_power(payload, now);
            return;
        }
        if let Some(intent) = self.publisher.parse_command(topic, payload) {
            self.on_intent(intent, now);
            return;
        }
        match self.codec.decode(topic, payload) {
            Ok(event) => self.on_device_event(event, now),
            Err(e) => warn!("Dropping frame: {e}"),
        }
    }

    fn on_house_power(&mut self, payload: &[u8], now: DateTime<Local>) {
        let text = String::from_utf8_lossy(payload);
        self.house_power = match text.trim().parse::<f64>() {
            Ok(watts) if watts.is_finite() => Some((watts, now)),
            _ => {
                debug!("house power unavailable ({})", text.trim());
                None
            }
        };
    }

    fn on_device_event(&mut self, event: DeviceEvent, now: DateTime<Local>) {
        match &event {
            DeviceEvent::TimeSyncRequested => {
                debug!("Received time sync request, replying with current time");
                let reply = self.translator.build_time_sync_reply(now);
                self.send(&reply);
            }
            DeviceEvent::CommandAck(ack) => self.on_ack(ack, now),
            _ => {}
        }

        let change = self.store.apply(&event, now);
        let came_online = matches!(event, DeviceEvent::Telemetry(_)) && !self.publisher.is_online();
        if came_online {
            self.publisher.set_availability(&mut self.client, true);
        }
        let discovered = self.publisher.needs_discovery(self.store.get())
            && self
                .publisher
                .publish_discovery(&mut self.client, self.store.get());
        if came_online || discovered {
            self.publish_everything();
        } else if !change.is_empty() {
            self.publisher
                .publish_changes(&mut self.client, self.store.get(), &change);
        }
    }

    fn on_ack(&mut self, ack: &CommandAck, now: DateTime<Local>) {
        match self.translator.match_ack(ack) {
            AckOutcome::Current { accepted: true } => {
                debug!("Setpoint command {} accepted", ack.id);
            }
            AckOutcome::Current { accepted: false } => {
                warn!("Device rejected setpoint command {}", ack.id);
                self.pending = None;
                if !self.retried_after_reject {
                    self.retried_after_reject = true;
                    self.run_controller(now);
                }
            }
            AckOutcome::Superseded if !ack.accepted => {
                warn!("Device rejected command {}", ack.id);
            }
            AckOutcome::Superseded => {
                debug!("Discarding ack for superseded command {}", ack.id);
            }
        }
    }

    fn on_intent(&mut self, intent: Result<PlatformIntent, CommandError>, now: DateTime<Local>) {
        match intent {
            Err(e) => warn!("Ignoring command: {e}"),
            Ok(PlatformIntent::Controller(enabled)) => {
                info!(
                    "Automatic controller {}",
                    if enabled { "enabled" } else { "disabled" }
                );
                self.controller_enabled = enabled;
                self.publish_controller_state();
                if enabled {
                    self.run_controller(now);
                }
            }
            Ok(PlatformIntent::Device(DeviceIntent::OutputLimit(watts))) => {
                if self.controller_enabled {
                    info!("Manual output limit while the automatic controller is enabled");
                }
                self.issue_setpoint(watts, now);
            }
            Ok(PlatformIntent::Device(intent)) => {
                match self.translator.translate(&intent, self.store.get(), now) {
                    Ok(command) => {
                        info!("Sending {intent:?}");
                        self.send(&command);
                    }
                    Err(e) => warn!("Cannot apply {intent:?}: {e}"),
                }
            }
        }
    }

    fn on_timer(&mut self, now: DateTime<Local>) {
        for timer in self.scheduler.due(now) {
            match timer {
                Timer::Control => {
                    self.retried_after_reject = false;
                    self.run_controller(now);
                }
                Timer::RequestAll => {
                    self.request_all(now);
                    let serial_known = self.store.get().serial().is_some();
                    self.scheduler.schedule_request_all(now, serial_known);
                }
            }
        }
    }

    fn run_controller(&mut self, now: DateTime<Local>) {
        if self.store.is_stale(self.stale_after, now) {
            self.publisher.set_availability(&mut self.client, false);
        }
        if let SetpointDecision::Setpoint(watts) = self.evaluate(now) {
            self.issue_setpoint(watts, now);
        }
        self.publish_controller_state();
        let boundary = self
            .controller
            .next_boundary(now.naive_local())
            .and_then(|boundary| Local.from_local_datetime(&boundary).earliest());
        self.scheduler.set_boundary(boundary);
    }

    fn control_inputs(&self, now: DateTime<Local>) -> Result<ControlInputs, StateError> {
        match self.store.age(now) {
            None => return Err(StateError::Missing("device telemetry")),
            Some(age) if age > self.stale_after => {
                return Err(StateError::Stale {
                    what: "device telemetry",
                    age_secs: age.num_seconds(),
                })
            }
            Some(_) => {}
        }
        let house_power = match self.house_power {
            None => return Err(StateError::Missing("house power")),
            Some((_, updated_at)) if now - updated_at > self.stale_after => {
                return Err(StateError::Stale {
                    what: "house power",
                    age_secs: (now - updated_at).num_seconds(),
                })
            }
            Some((watts, _)) => watts,
        };
        Ok(ControlInputs {
            house_power,
            solar_input_power: self
                .store
                .get()
                .number(Field::SolarInputPower)
                .unwrap_or(0.),
            current_output: self.effective_limit().unwrap_or(0.),
            max_output: self.max_output,
        })
    }

    fn battery_depleted(&self) -> bool {
        let state = self.store.get();
        match (state.number(Field::BatteryLevel), state.number(Field::MinSoc)) {
            (Some(soc), Some(min_soc)) => soc <= min_soc,
            _ => false,
        }
    }

    /// Output limit the device is working with: the last setpoint we sent unless the
    /// device reported a limit after it.
    fn effective_limit(&self) -> Option<f64> {
        let reported = self.store.get().reading(Field::OutputLimit);
        match (self.pending, reported) {
            (Some(pending), Some(reading))
                if pending.issued_at >= reading.updated_at.timestamp_millis() =>
            {
                Some(f64::from(pending.watts))
            }
            (Some(pending), None) => Some(f64::from(pending.watts)),
            (_, Some(reading)) => reading.value.as_number(),
            (None, None) => None,
        }
    }

    /// Runs the controller and applies the guards every policy shares.
    pub fn evaluate(&mut self, now: DateTime<Local>) -> SetpointDecision {
        if !self.controller_enabled {
            debug!("Automatic controller disabled, leaving output alone");
            return SetpointDecision::NoChange;
        }
        let inputs = match self.control_inputs(now) {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!("Not adjusting output: {e}");
                return SetpointDecision::NoChange;
            }
        };
        let decision = self.controller.evaluate(&inputs, now.naive_local());
        let decision = if self.battery_depleted() {
            debug!("Battery at or below min SoC, requesting 0 W");
            SetpointDecision::Setpoint(0.)
        } else {
            decision
        };

        let SetpointDecision::Setpoint(watts) = decision else {
            return decision;
        };
        let target = f64::from(self.translator.clamp(watts));
        match self.effective_limit() {
            Some(current) if current == target => {
                debug!("Output already at {target} W");
                SetpointDecision::NoChange
            }
            // zero is always honoured
            Some(current)
                if target > 0. && (target - current).abs() <= self.setpoint_deadband =>
            {
                debug!("Setpoint {target} W within deadband of current {current} W");
                SetpointDecision::NoChange
            }
            _ => SetpointDecision::Setpoint(target),
        }
    }

    fn issue_setpoint(&mut self, watts: f64, now: DateTime<Local>) {
        let command = self.translator.build_setpoint_command(watts, now);
        info!(
            "Setting output limit to {} W (command {})",
            command.watts, command.id
        );
        self.send(&command.to_device_command());
        self.pending = Some(command);
    }

    fn request_all(&mut self, now: DateTime<Local>) {
        debug!("Requesting full property report");
        let command = self.translator.build_request_all(now);
        self.send(&command);
    }

    fn send(&mut self, command: &DeviceCommand) {
        let (topic, payload) = self.codec.encode(command);
        debug!("Publishing to {topic} with payload {payload}");
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
        {
            warn!("Failed to send command to device: {e:?}");
        }
    }

    fn publish_controller_state(&mut self) {
        let switch = if self.controller_enabled { "ON" } else { "OFF" };
        self.publisher
            .publish_state(&mut self.client, CONTROLLER_KEY, switch);
        let phase = self.controller.describe();
        self.publisher
            .publish_state(&mut self.client, CONTROLLER_PHASE_KEY, &phase);
    }

    fn publish_everything(&mut self) {
        self.publisher
            .publish_all(&mut self.client, self.store.get());
        self.publish_controller_state();
    }
}
