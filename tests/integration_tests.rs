use std::sync::mpsc::{self, Sender};

use chrono::{DateTime, Local, TimeZone};
use serde_json::Value;
use solarflow2mqtt::{
    control_config::{ControllerConfig, Policy},
    controller::{Phase, SetpointDecision},
    device::DeviceIdentity,
    dispatcher::{Dispatcher, Event, InboundMessage},
    mqtt_config::MqttConfig,
    mqtt_wrapper::{MqttWrapper, QoS, Will},
};

const REPORT_TOPIC: &str = "/73bkTV/5ak8yGU7/properties/report";
const WRITE_TOPIC: &str = "/73bkTV/5ak8yGU7/properties/write";
const HOUSE_POWER_TOPIC: &str = "powermeter/house/power";
const AVAILABILITY_TOPIC: &str = "solarflow/5ak8yGU7/availability";

struct MqttTester {
    published_values: Vec<(String, Vec<u8>, bool)>,
    subscriptions: Vec<String>,
    /// Number of publishes seen when `disconnect` was called.
    disconnected_after: Option<usize>,
}

impl MqttTester {
    pub fn len(&self) -> usize {
        self.published_values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.published_values
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, payload, _)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    fn writes(&self) -> Vec<Value> {
        self.payloads_on(WRITE_TOPIC)
            .iter()
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }

    fn output_limits(&self) -> Vec<i64> {
        self.writes()
            .iter()
            .filter_map(|write| write["properties"]["outputLimit"].as_i64())
            .collect()
    }
}

impl MqttWrapper for MqttTester {
    fn subscribe(&mut self, topic: &str, _qos: QoS) -> anyhow::Result<()> {
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        self.subscriptions.retain(|t| t != topic);
        Ok(())
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        self.disconnected_after = Some(self.published_values.len());
        Ok(())
    }

    fn publish<S, V>(
        &mut self,
        topic: S,
        _qos: QoS,
        retain: bool,
        payload: V,
    ) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        self.published_values
            .push((topic.into(), payload.into(), retain));
        Ok(())
    }

    fn new(_config: &MqttConfig, _will: Option<Will>, _inbox: Sender<Event>) -> Self {
        Self {
            published_values: Vec::new(),
            subscriptions: Vec::new(),
            disconnected_after: None,
        }
    }
}

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2024, 6, 3, hour, minute, second)
        .unwrap()
}

fn controller_config(policy: Policy) -> ControllerConfig {
    let mut config = ControllerConfig::new(policy, HOUSE_POWER_TOPIC);
    config.morning_cutoff_time = Some("10:30".to_string());
    config.evening_rampup_time = Some("17:00".to_string());
    config
}

fn bridge(policy: Policy) -> Dispatcher<MqttTester> {
    let (inbox, _events) = mpsc::channel();
    let client = MqttTester::new(&MqttConfig::default(), None, inbox);
    Dispatcher::new(
        client,
        &DeviceIdentity::new("73bkTV", "5ak8yGU7"),
        &controller_config(policy),
    )
    .unwrap()
}

fn message(topic: &str, payload: &str) -> Event {
    Event::Message(InboundMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
    })
}

fn report(properties: &str) -> Event {
    message(
        REPORT_TOPIC,
        &format!(r#"{{"sn":"PO1HLC9","properties":{properties}}}"#),
    )
}

fn house_power(watts: f64) -> Event {
    message(HOUSE_POWER_TOPIC, &watts.to_string())
}

/// Fresh telemetry and house power, then a control tick.
fn tick(
    dispatcher: &mut Dispatcher<MqttTester>,
    now: DateTime<Local>,
    properties: &str,
    house: f64,
) {
    dispatcher.handle(report(properties), now);
    dispatcher.handle(house_power(house), now);
    dispatcher.handle(Event::Timer, now);
}

const IDLE: &str = r#"{"electricLevel":60,"minSoc":100,"outputLimit":0,"solarInputPower":0}"#;

#[test]
fn publish_one_message() {
    let (inbox, _events) = mpsc::channel();
    let mut mqtt = MqttTester::new(
        &MqttConfig {
            host: "frob".to_owned(),
            port: Some(1234),
            username: None,
            password: None,
            tls: None,
            client_id: Some("myclient".to_string()),
        },
        None,
        inbox,
    );
    let result = mqtt.publish("foo", QoS::AtMostOnce, true, "Hooray".to_string());
    assert!(result.is_ok());
    assert!(!mqtt.is_empty());
    assert_eq!(mqtt.len(), 1);
}

#[test]
fn start_subscribes_and_requests_full_report() {
    let mut dispatcher = bridge(Policy::MinimizeGrid);
    dispatcher.start(at(12, 0, 0));
    assert!(dispatcher.is_running());

    let client = dispatcher.client();
    assert_eq!(client.subscriptions.len(), 14);
    assert!(client.subscriptions.iter().any(|t| t == REPORT_TOPIC));
    assert!(client.subscriptions.iter().any(|t| t == HOUSE_POWER_TOPIC));
    assert!(client
        .subscriptions
        .iter()
        .any(|t| t == "solarflow/5ak8yGU7/controller/set"));

    assert_eq!(client.payloads_on(AVAILABILITY_TOPIC), vec!["offline"]);
    let reads = client.payloads_on("/73bkTV/5ak8yGU7/properties/read");
    assert_eq!(reads.len(), 1);
    let read: Value = serde_json::from_str(&reads[0]).unwrap();
    assert_eq!(read["properties"][0], "getAll");
    assert_eq!(read["deviceId"], "5ak8yGU7");
}

#[test]
fn discovery_follows_serial_and_is_not_repeated() {
    let mut dispatcher = bridge(Policy::MinimizeGrid);
    dispatcher.start(at(12, 0, 0));

    dispatcher.handle(report(IDLE), at(12, 0, 1));
    let client = dispatcher.client();
    let configs = client
        .published_values
        .iter()
        .filter(|(topic, _, retain)| topic.ends_with("/config") && *retain)
        .count();
    assert!(configs > 20);
    assert_eq!(client.payloads_on(AVAILABILITY_TOPIC), vec!["offline", "online"]);
    assert_eq!(
        client.payloads_on("solarflow/5ak8yGU7/battery/state"),
        vec!["60"]
    );
    assert_eq!(
        client.payloads_on("solarflow/5ak8yGU7/min_soc/state"),
        vec!["10"]
    );

    // the same report again changes nothing and publishes nothing
    let published = client.len();
    dispatcher.handle(report(IDLE), at(12, 0, 5));
    assert_eq!(dispatcher.client().len(), published);

    // only the changed value goes out
    dispatcher.handle(report(r#"{"electricLevel":61}"#), at(12, 0, 9));
    let client = dispatcher.client();
    assert_eq!(client.len(), published + 1);
    assert_eq!(
        client.payloads_on("solarflow/5ak8yGU7/battery/state"),
        vec!["60", "61"]
    );
}

#[test]
fn time_sync_is_answered_immediately() {
    let mut dispatcher = bridge(Policy::AlwaysZero);
    dispatcher.start(at(12, 0, 0));
    let now = at(12, 0, 3);
    dispatcher.handle(message("/73bkTV/5ak8yGU7/time/request", ""), now);

    let (topic, payload, _) = dispatcher.client().published_values.last().unwrap().clone();
    assert_eq!(topic, "/73bkTV/5ak8yGU7/time/reply");
    let reply: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(reply["timestamp"], now.timestamp_millis());
}

#[test]
fn minimize_grid_follows_net_meter_with_deadband() {
    let mut dispatcher = bridge(Policy::MinimizeGrid);
    dispatcher.start(at(12, 0, 0));

    tick(&mut dispatcher, at(12, 0, 30), IDLE, 230.);
    assert_eq!(dispatcher.client().output_limits(), vec![230]);
    assert_eq!(dispatcher.pending().map(|p| p.watts), Some(230));

    // the hub now covers 230 W, 5 W more is within the deadband
    dispatcher.handle(house_power(5.), at(12, 0, 40));
    dispatcher.handle(Event::Timer, at(12, 1, 0));
    assert_eq!(dispatcher.client().output_limits(), vec![230]);

    dispatcher.handle(house_power(70.), at(12, 1, 10));
    dispatcher.handle(Event::Timer, at(12, 1, 30));
    assert_eq!(dispatcher.client().output_limits(), vec![230, 300]);

    // net production beyond the hub's output never turns into a negative setpoint
    dispatcher.handle(house_power(-450.), at(12, 1, 40));
    dispatcher.handle(Event::Timer, at(12, 2, 0));
    assert_eq!(dispatcher.client().output_limits(), vec![230, 300, 0]);
}

#[test]
fn minimize_grid_settles_once_the_load_is_covered() {
    let mut dispatcher = bridge(Policy::MinimizeGrid);
    dispatcher.start(at(12, 0, 0));

    tick(&mut dispatcher, at(12, 0, 30), IDLE, 300.);
    assert_eq!(dispatcher.client().output_limits(), vec![300]);

    // the hub reports the new limit and the meter reads zero
    let covered = r#"{"electricLevel":60,"minSoc":100,"outputLimit":300,"solarInputPower":0}"#;
    tick(&mut dispatcher, at(12, 1, 0), covered, 0.);
    tick(&mut dispatcher, at(12, 1, 30), covered, 0.);
    tick(&mut dispatcher, at(12, 2, 0), covered, -3.);
    assert_eq!(dispatcher.client().output_limits(), vec![300]);

    // the load drops by 120 W
    tick(&mut dispatcher, at(12, 2, 30), covered, -120.);
    assert_eq!(dispatcher.client().output_limits(), vec![300, 180]);
}

#[test]
fn rejected_setpoint_is_reissued_at_once() {
    let mut dispatcher = bridge(Policy::MinimizeGrid);
    dispatcher.start(at(12, 0, 0));
    tick(&mut dispatcher, at(12, 0, 30), IDLE, 230.);
    let rejected = dispatcher.pending().unwrap();

    dispatcher.handle(
        message(
            "/73bkTV/5ak8yGU7/properties/write/reply",
            &format!(r#"{{"messageId":"{}","success":false}}"#, rejected.id),
        ),
        at(12, 0, 31),
    );
    assert_eq!(dispatcher.client().output_limits(), vec![230, 230]);
    let reissued = dispatcher.pending().unwrap();
    assert!(reissued.id > rejected.id);
}

#[test]
fn superseded_ack_is_discarded() {
    let mut dispatcher = bridge(Policy::NightUsage);
    dispatcher.start(at(11, 0, 0));
    tick(&mut dispatcher, at(11, 0, 30), IDLE, 200.);
    let first = dispatcher.pending().unwrap();
    tick(&mut dispatcher, at(11, 1, 0), IDLE, 400.);
    let second = dispatcher.pending().unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(dispatcher.controller().phase(), Some(Phase::Transitioning));

    let writes = dispatcher.client().writes().len();
    dispatcher.handle(
        message(
            "/73bkTV/5ak8yGU7/properties/write/reply",
            &format!(r#"{{"messageId":"{}","success":false}}"#, first.id),
        ),
        at(11, 1, 5),
    );
    assert_eq!(dispatcher.pending(), Some(second));
    assert_eq!(dispatcher.client().writes().len(), writes);
    assert_eq!(dispatcher.controller().phase(), Some(Phase::Transitioning));
}

#[test]
fn stale_inputs_hold_output_for_every_policy() {
    for policy in [Policy::AlwaysZero, Policy::MinimizeGrid, Policy::NightUsage] {
        // device telemetry went quiet
        let mut dispatcher = bridge(policy);
        dispatcher.start(at(12, 0, 0));
        dispatcher.handle(report(r#"{"electricLevel":60,"outputLimit":100}"#), at(12, 0, 1));
        dispatcher.handle(house_power(300.), at(12, 9, 50));
        dispatcher.handle(Event::Timer, at(12, 10, 0));
        assert!(dispatcher.client().writes().is_empty(), "{policy:?}");
        assert_eq!(dispatcher.evaluate(at(12, 10, 0)), SetpointDecision::NoChange);
        assert_eq!(
            dispatcher.client().payloads_on(AVAILABILITY_TOPIC),
            vec!["offline", "online", "offline"]
        );

        // house power went quiet
        let mut dispatcher = bridge(policy);
        dispatcher.start(at(12, 0, 0));
        dispatcher.handle(house_power(300.), at(12, 0, 1));
        dispatcher.handle(report(r#"{"electricLevel":60,"outputLimit":100}"#), at(12, 9, 50));
        dispatcher.handle(Event::Timer, at(12, 10, 0));
        assert!(dispatcher.client().writes().is_empty(), "{policy:?}");

        // house power never arrived or is unavailable
        let mut dispatcher = bridge(policy);
        dispatcher.start(at(12, 0, 0));
        dispatcher.handle(message(HOUSE_POWER_TOPIC, "unavailable"), at(12, 0, 1));
        dispatcher.handle(report(r#"{"electricLevel":60,"outputLimit":100}"#), at(12, 0, 2));
        dispatcher.handle(Event::Timer, at(12, 0, 30));
        assert!(dispatcher.client().writes().is_empty(), "{policy:?}");
    }
}

#[test]
fn night_usage_day_cycle() {
    let mut dispatcher = bridge(Policy::NightUsage);
    dispatcher.start(at(9, 0, 0));

    // solar below consumption before the cutoff: keep charging, output already at 0
    tick(
        &mut dispatcher,
        at(9, 0, 30),
        r#"{"electricLevel":40,"outputLimit":0,"solarInputPower":100}"#,
        300.,
    );
    assert_eq!(dispatcher.controller().phase(), Some(Phase::Charging));
    assert!(dispatcher.client().writes().is_empty());

    tick(
        &mut dispatcher,
        at(11, 0, 0),
        r#"{"electricLevel":50,"outputLimit":0,"solarInputPower":100}"#,
        300.,
    );
    assert_eq!(dispatcher.controller().phase(), Some(Phase::Transitioning));
    assert_eq!(dispatcher.client().output_limits(), vec![300]);

    tick(
        &mut dispatcher,
        at(18, 0, 0),
        r#"{"electricLevel":90,"outputLimit":0,"solarInputPower":0}"#,
        800.,
    );
    assert_eq!(dispatcher.controller().phase(), Some(Phase::Discharging));
    assert_eq!(dispatcher.client().output_limits(), vec![300, 500]);
    assert_eq!(
        dispatcher
            .client()
            .payloads_on("solarflow/5ak8yGU7/controller_phase/state")
            .last()
            .map(String::as_str),
        Some("night_usage/discharging")
    );
}

#[test]
fn depleted_battery_forces_zero_output() {
    let mut dispatcher = bridge(Policy::MinimizeGrid);
    dispatcher.start(at(20, 0, 0));
    tick(
        &mut dispatcher,
        at(20, 0, 30),
        r#"{"electricLevel":10,"minSoc":100,"outputLimit":200}"#,
        300.,
    );
    assert_eq!(dispatcher.client().output_limits(), vec![0]);
}

#[test]
fn controller_switch_and_manual_overrides() {
    let mut dispatcher = bridge(Policy::MinimizeGrid);
    dispatcher.start(at(12, 0, 0));
    dispatcher.handle(report(IDLE), at(12, 0, 1));

    dispatcher.handle(message("solarflow/5ak8yGU7/controller/set", "OFF"), at(12, 0, 2));
    assert!(!dispatcher.controller_enabled());
    assert_eq!(
        dispatcher
            .client()
            .payloads_on("solarflow/5ak8yGU7/controller/state")
            .last()
            .map(String::as_str),
        Some("OFF")
    );
    dispatcher.handle(house_power(300.), at(12, 0, 20));
    dispatcher.handle(Event::Timer, at(12, 0, 30));
    assert!(dispatcher.client().writes().is_empty());

    dispatcher.handle(message("solarflow/5ak8yGU7/output_limit/set", "150"), at(12, 0, 40));
    assert_eq!(dispatcher.client().output_limits(), vec![150]);

    dispatcher.handle(message("solarflow/5ak8yGU7/min_soc/set", "20"), at(12, 0, 41));
    let writes = dispatcher.client().writes();
    assert_eq!(writes.last().unwrap()["properties"]["minSoc"], 200);

    // out of range values never reach the device
    dispatcher.handle(message("solarflow/5ak8yGU7/max_soc/set", "50"), at(12, 0, 42));
    dispatcher.handle(message("solarflow/5ak8yGU7/bypass_mode/set", "sometimes"), at(12, 0, 43));
    assert_eq!(dispatcher.client().writes().len(), writes.len());
}

#[test]
fn malformed_frames_are_dropped() {
    let mut dispatcher = bridge(Policy::AlwaysZero);
    dispatcher.start(at(12, 0, 0));
    let published = dispatcher.client().len();

    dispatcher.handle(message(REPORT_TOPIC, "{not json"), at(12, 0, 1));
    dispatcher.handle(message(REPORT_TOPIC, r#"{"sn":"PO1HLC9"}"#), at(12, 0, 2));
    dispatcher.handle(
        message("/73bkTV/5ak8yGU7/properties/write/reply", r#"{"success":true}"#),
        at(12, 0, 3),
    );

    assert_eq!(dispatcher.client().len(), published);
    assert!(dispatcher.state().last_update().is_none());
    assert!(dispatcher.is_running());
}

#[test]
fn reconnect_restores_availability() {
    let mut dispatcher = bridge(Policy::AlwaysZero);
    dispatcher.start(at(12, 0, 0));
    dispatcher.handle(report(IDLE), at(12, 0, 1));
    dispatcher.handle(Event::Connected, at(12, 0, 2));
    assert_eq!(
        dispatcher.client().payloads_on(AVAILABILITY_TOPIC),
        vec!["offline", "online", "online"]
    );
}

#[test]
fn shutdown_goes_offline_and_unsubscribes() {
    let mut dispatcher = bridge(Policy::AlwaysZero);
    dispatcher.start(at(12, 0, 0));
    dispatcher.handle(report(IDLE), at(12, 0, 1));
    dispatcher.handle(Event::Shutdown, at(12, 0, 2));

    assert!(!dispatcher.is_running());
    let client = dispatcher.client();
    // nothing published after the disconnect
    assert_eq!(client.disconnected_after, Some(client.len()));
    assert!(client.subscriptions.is_empty());
    let (topic, payload, retain) = client.published_values.last().unwrap();
    assert_eq!(topic, AVAILABILITY_TOPIC);
    assert_eq!(payload, b"offline");
    assert!(*retain);
}
