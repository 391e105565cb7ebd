pub mod ha_interface;

use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::timeout;

use crate::config::MqttConfig;
use crate::mqtt::ha_interface::HaDiscovery;

/// State publishes are frequent and disposable, discovery announcements are
/// rare and worth waiting for.
const STATE_PUBLISH_TIMEOUT: Duration = Duration::from_millis(50);
const DISCOVERY_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub enum Transmission {
    State { meter: String, name: String, value: f64 },
    Discovery(HaDiscovery),
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    client: AsyncClient,
}

impl MqttManager {
    /// Connects to the broker and blocks until the first ConnAck. A failure
    /// here is fatal for the whole process; once connected, the event loop
    /// moves to a background task and handles reconnects on its own.
    pub async fn connect(config: &MqttConfig) -> Result<(Self, Sender<Transmission>), ConnectionError> {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Connected to MQTT broker {}:{}", config.host, config.port);

        tokio::spawn(async move {
            debug!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        return Ok((MqttManager { rx: mrx, client }, mtx));
    }

    /// Drains the transmission channel until every sender is gone, then
    /// disconnects.
    pub async fn start_thread(&mut self) {
        while let Some(transmission) = self.rx.recv().await {
            match transmission {
                Transmission::State { meter, name, value } => {
                    self.publish_state(&meter, &name, value).await;
                }
                Transmission::Discovery(discovery) => {
                    self.publish_discovery(discovery).await;
                }
            }
        }

        debug!("All senders gone, disconnecting from broker");
        let _ = self.client.disconnect().await;
    }

    async fn publish_state(&self, meter: &str, name: &str, value: f64) {
        let topic = format!("zaehler2mqtt/{meter}/{name}/state");
        let payload = format!("{value:.4}");

        match timeout(STATE_PUBLISH_TIMEOUT, self.client.publish(topic, QoS::AtMostOnce, false, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{meter}] Failed to publish {name}: {e}"),
            Err(_) => warn!("[{meter}] Publishing {name} timed out"),
        }
    }

    async fn publish_discovery(&self, discovery: HaDiscovery) {
        let payload = serde_json::to_string(&discovery).unwrap();
        let topic = discovery.discover_topic.clone();

        match timeout(DISCOVERY_PUBLISH_TIMEOUT, self.client.publish(topic, QoS::AtLeastOnce, true, payload)).await {
            Ok(Ok(())) => info!("Published HA discovery: {}", discovery.unique_id),
            Ok(Err(e)) => warn!("Failed to publish discovery for {}: {e}", discovery.unique_id),
            Err(_) => warn!("Publishing discovery for {} timed out", discovery.unique_id),
        }
    }
}
