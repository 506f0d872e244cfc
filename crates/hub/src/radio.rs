//! Boundary to the LoRaWAN radio collaborator.
//!
//! The radio side (modem join, AT-command uplink, retries) lives in a
//! separate bridge process reachable over MQTT. The hub publishes each
//! encoded frame to `<uplink_topic>/<fport>` and receives limit downlinks
//! on `<downlink_topic>`.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::codec::TelemetryFrame;
use crate::config::RadioConfig;

/// Downlink payloads buffered between the MQTT event loop and the receiver.
const DOWNLINK_QUEUE: usize = 16;

/// Outgoing requests the MQTT client buffers while the broker is away.
const REQUEST_QUEUE: usize = 20;

/// Delay before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Uplink
// ---------------------------------------------------------------------------

/// Hands an encoded frame to the radio collaborator. Delivery and retry are
/// the collaborator's concern; an error here only means the hand-off failed.
pub trait UplinkSink: Send + Sync {
    fn send(&self, frame: &TelemetryFrame) -> impl Future<Output = Result<()>> + Send;
}

/// Used when no radio bridge is configured: frames are only logged.
pub struct LogUplink;

impl UplinkSink for LogUplink {
    async fn send(&self, frame: &TelemetryFrame) -> Result<()> {
        info!(
            fport = frame.profile().fport(),
            payload = %frame.to_hex(),
            "uplink (no radio bridge)"
        );
        Ok(())
    }
}

pub struct MqttUplink {
    client: AsyncClient,
    topic: String,
}

impl MqttUplink {
    pub fn new(client: AsyncClient, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }

    pub fn topic_for(&self, frame: &TelemetryFrame) -> String {
        format!("{}/{}", self.topic, frame.profile().fport())
    }
}

impl UplinkSink for MqttUplink {
    /// Never waits on the client's request queue. While the broker is
    /// unreachable the queue fills and frames are rejected.
    async fn send(&self, frame: &TelemetryFrame) -> Result<()> {
        let topic = self.topic_for(frame);
        self.client
            .try_publish(&topic, QoS::AtLeastOnce, false, frame.as_bytes().to_vec())
            .with_context(|| format!("failed to queue uplink to {topic}"))?;
        info!(%topic, payload = %frame.to_hex(), "uplink queued");
        Ok(())
    }
}

/// The uplink selected at startup.
pub enum Uplink {
    Log(LogUplink),
    Mqtt(MqttUplink),
}

impl UplinkSink for Uplink {
    async fn send(&self, frame: &TelemetryFrame) -> Result<()> {
        match self {
            Self::Log(u) => u.send(frame).await,
            Self::Mqtt(u) => u.send(frame).await,
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT bridge
// ---------------------------------------------------------------------------

pub struct RadioBridge {
    uplink: MqttUplink,
    downlink: mpsc::Receiver<Vec<u8>>,
    client: AsyncClient,
    eventloop: EventLoop,
    downlink_tx: mpsc::Sender<Vec<u8>>,
    downlink_topic: String,
}

impl RadioBridge {
    /// Create the client. The broker connection and the downlink
    /// subscription are made by [`BridgeDriver::run`].
    pub fn connect(cfg: &RadioConfig) -> Self {
        let mut opts = MqttOptions::new(&cfg.client_id, &cfg.mqtt_host, cfg.mqtt_port);
        opts.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(opts, REQUEST_QUEUE);
        let (downlink_tx, downlink) = mpsc::channel(DOWNLINK_QUEUE);
        info!(
            host = %cfg.mqtt_host,
            port = cfg.mqtt_port,
            uplink = %cfg.uplink_topic,
            downlink = %cfg.downlink_topic,
            "radio bridge configured"
        );

        Self {
            uplink: MqttUplink::new(client.clone(), &cfg.uplink_topic),
            downlink,
            client,
            eventloop,
            downlink_tx,
            downlink_topic: cfg.downlink_topic.clone(),
        }
    }

    /// Split into the uplink sink, the downlink source, and the event-loop
    /// driver that must be spawned for either to make progress.
    pub fn split(self) -> (MqttUplink, mpsc::Receiver<Vec<u8>>, BridgeDriver) {
        (
            self.uplink,
            self.downlink,
            BridgeDriver {
                client: self.client,
                eventloop: self.eventloop,
                downlink_tx: self.downlink_tx,
                downlink_topic: self.downlink_topic,
            },
        )
    }
}

pub struct BridgeDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    downlink_tx: mpsc::Sender<Vec<u8>>,
    downlink_topic: String,
}

impl BridgeDriver {
    /// Poll the MQTT event loop until shutdown, forwarding downlink
    /// payloads. Connection errors are logged and retried.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = self.eventloop.poll() => event,
            };
            match event {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    error!("radio bridge error: {e}. reconnecting...");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
        info!("radio bridge stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(p)) => {
                if p.topic != self.downlink_topic {
                    warn!(topic = %p.topic, "unhandled topic");
                    return;
                }
                if self.downlink_tx.send(p.payload.to_vec()).await.is_err() {
                    warn!("downlink receiver gone; dropping message");
                }
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("radio bridge connected");
                // Clean sessions drop subscriptions on every reconnect.
                if let Err(e) = self.subscribe() {
                    error!("{e:#}");
                }
            }
            Event::Incoming(Packet::Disconnect) => warn!("radio bridge disconnected"),
            _ => {}
        }
    }

    fn subscribe(&self) -> Result<()> {
        self.client
            .try_subscribe(&self.downlink_topic, QoS::AtLeastOnce)
            .with_context(|| format!("failed to subscribe to {}", self.downlink_topic))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
