use std::sync::mpsc::Sender;

use crate::dispatcher::Event;
use crate::mqtt_config::MqttConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Message the broker publishes on our behalf when the connection drops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: String,
}

pub trait MqttWrapper {
    // This trait provides an interface that the decouples library code from an
    // implementation of the MQTT client. On library calling code, one needs to
    // wrap the MQTT implementation, i.e. the client, in a new type that in
    // turn implements this trait.
    //
    // Incoming messages and (re)connects are delivered as `Event`s through the
    // inbox handed to `new`.

    fn subscribe(&mut self, topic: &str, qos: QoS) -> anyhow::Result<()>;

    fn unsubscribe(&mut self, topic: &str) -> anyhow::Result<()>;

    fn publish<S, V>(&mut self, topic: S, qos: QoS, retain: bool, payload: V) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>;

    /// Returns once everything published before has been handed to the broker and the
    /// connection is closed.
    fn disconnect(&mut self) -> anyhow::Result<()>;

    fn new(config: &MqttConfig, will: Option<Will>, inbox: Sender<Event>) -> Self;
}
