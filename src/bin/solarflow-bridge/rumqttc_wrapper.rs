use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, warn};
use rumqttc::{
    tokio_rustls::{self, rustls::ClientConfig},
    Client, LastWill, MqttOptions, Outgoing, Packet, Transport,
};
use solarflow2mqtt::{
    dispatcher::{Event, InboundMessage},
    mqtt_config::MqttConfig,
    mqtt_wrapper::{self, Will},
};

pub struct RumqttcWrapper {
    client: Client,
    connection_thread: Option<JoinHandle<()>>,
    disconnecting: Arc<AtomicBool>,
}

fn match_qos(qos: mqtt_wrapper::QoS) -> rumqttc::QoS {
    match qos {
        mqtt_wrapper::QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        mqtt_wrapper::QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        mqtt_wrapper::QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn tls_transport() -> Transport {
    // Use rustls-native-certs to load root certificates from the operating system.
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("could not load platform certificate: {e}");
    }
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            warn!("skipping invalid platform certificate: {e}");
        }
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Transport::tls_with_config(client_config.into())
}

impl mqtt_wrapper::MqttWrapper for RumqttcWrapper {
    fn subscribe(&mut self, topic: &str, qos: mqtt_wrapper::QoS) -> anyhow::Result<()> {
        Ok(self.client.subscribe(topic, match_qos(qos))?)
    }

    fn unsubscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        Ok(self.client.unsubscribe(topic)?)
    }

    fn publish<S, V>(
        &mut self,
        topic: S,
        qos: mqtt_wrapper::QoS,
        retain: bool,
        payload: V,
    ) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        // try publishing up to three times
        if self
            .client
            .try_publish(topic.clone(), match_qos(qos), retain, payload.clone())
            .is_ok()
        {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
        if self
            .client
            .try_publish(topic.clone(), match_qos(qos), retain, payload.clone())
            .is_ok()
        {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
        Ok(self
            .client
            .try_publish(topic, match_qos(qos), retain, payload)?)
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        self.disconnecting.store(true, Ordering::SeqCst);
        // queued behind everything published so far
        self.client.disconnect()?;
        if let Some(handle) = self.connection_thread.take() {
            handle
                .join()
                .map_err(|_| anyhow!("mqtt connection thread panicked"))?;
        }
        Ok(())
    }

    fn new(config: &MqttConfig, will: Option<Will>, inbox: Sender<Event>) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| "solarflow-bridge".to_string());
        let mut mqttoptions = MqttOptions::new(client_id, &config.host, config.port());
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if config.use_tls() {
            mqttoptions.set_transport(tls_transport());
        }
        if let Some(will) = will {
            mqttoptions.set_last_will(LastWill::new(
                will.topic,
                will.payload.into_bytes(),
                rumqttc::QoS::AtLeastOnce,
                true,
            ));
        }

        //parse the mqtt authentication options
        if let Some((username, password)) = match (&config.username, &config.password) {
            (None, None) => None,
            (None, Some(_)) => None,
            (Some(username), None) => Some((username.clone(), "".into())),
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
        } {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut connection) = Client::new(mqttoptions, 512);
        let disconnecting = Arc::new(AtomicBool::new(false));
        let closing = Arc::clone(&disconnecting);

        let connection_thread = thread::spawn(move || {
            // The call to .iter() blocks and keeps reconnecting on errors. Incoming
            // publishes and connection acks are handed to the event loop; the thread
            // ends once the disconnect went out or the event loop dropped its receiver.
            for notification in connection.iter() {
                let event = match notification {
                    Ok(rumqttc::Event::Incoming(Packet::Publish(publish))) => {
                        Event::Message(InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        })
                    }
                    Ok(rumqttc::Event::Incoming(Packet::ConnAck(_))) => Event::Connected,
                    Ok(rumqttc::Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("mqtt: disconnected");
                        break;
                    }
                    Ok(other) => {
                        debug!("mqtt: {other:?}");
                        continue;
                    }
                    Err(e) if closing.load(Ordering::SeqCst) => {
                        warn!("mqtt connection lost while disconnecting: {e}");
                        break;
                    }
                    Err(e) => {
                        warn!("mqtt connection error: {e}");
                        thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                };
                if inbox.send(event).is_err() {
                    break;
                }
            }
        });
        Self {
            client,
            connection_thread: Some(connection_thread),
            disconnecting,
        }
    }
}
