//! MQTT ingestion transport
//!
//! Devices publish upload batches to `gps/{device_id}/upload`. The body is
//! the same as for the HTTP upload; the device id from the topic wins.

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};

use crate::{
    config::MqttConfig,
    errors::TrackerError,
    models::{RawFix, UploadBatch},
};

/// Upload batch received over MQTT
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpload {
    pub device_id: String,
    pub locations: Vec<RawFix>,
}

pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    tx: mpsc::Sender<DeviceUpload>,
    rx: mpsc::Receiver<DeviceUpload>,
}

pub struct MqttClient {
    _client: AsyncClient,
    rx: mpsc::Receiver<DeviceUpload>,
    _handle: tokio::task::JoinHandle<Result<(), TrackerError>>,
}

impl MqttClientBuilder {
    pub fn new(config: &MqttConfig) -> Result<Self, TrackerError> {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.uri, config.port);

        if config.websocket {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
        mqtt_options.set_keep_alive(Duration::from_secs(5));

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);
        let (tx, rx) = mpsc::channel(100);

        Ok(Self {
            client,
            event_loop,
            tx,
            rx,
        })
    }

    /// Start the event loop; topics are subscribed on every (re)connect.
    pub async fn connect(self, topics: &[String]) -> Result<MqttClient, TrackerError> {
        let topics = topics.to_vec();

        let _handle = tokio::spawn(Self::process_events(
            self.tx,
            self.event_loop,
            self.client.clone(),
            topics,
        ));

        Ok(MqttClient {
            _client: self.client,
            rx: self.rx,
            _handle,
        })
    }

    async fn subscribe(client: AsyncClient, topics: &[String]) -> Result<(), TrackerError> {
        for topic in topics.iter() {
            info!("Subscribing to topic: {}", topic);
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects on its own, but subscriptions are lost with the
    /// session, so they are renewed on every ConnAck.
    async fn process_events(
        tx: mpsc::Sender<DeviceUpload>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
    ) -> Result<(), TrackerError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, subscribing to topics");
                    if let Err(e) = Self::subscribe(client.clone(), &topics).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match Self::parse_message(&publish.topic, &publish.payload) {
                        Ok(upload) => {
                            if tx.send(upload).await.is_err() {
                                info!("Upload receiver closed, stopping MQTT event loop");
                                break Ok(());
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse message: {}", e);
                        }
                    }
                }
                Err(e) => {
                    error!("MQTT Error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                _ => continue,
            }
        }
    }

    /// Parse a publish on `gps/{device_id}/upload`
    fn parse_message(topic: &str, payload: &[u8]) -> Result<DeviceUpload, TrackerError> {
        let parts: Vec<&str> = topic.split('/').collect();

        if parts.len() != 3 || parts[0] != "gps" || parts[2] != "upload" || parts[1].is_empty() {
            return Err(TrackerError::InvalidTopic(topic.to_string()));
        }

        let batch: UploadBatch = serde_json::from_slice(payload)?;
        match batch.locations {
            Some(locations) if !locations.is_empty() => Ok(DeviceUpload {
                device_id: parts[1].to_string(),
                locations,
            }),
            _ => Err(TrackerError::Validation(
                "Missing required parameters".to_string(),
            )),
        }
    }
}

impl MqttClient {
    /// Receive next upload; `None` once the event loop has stopped
    pub async fn recv(&mut self) -> Option<DeviceUpload> {
        self.rx.recv().await
    }
}
