//! UDP update listener. Each datagram is one `{type, value}` JSON object
//! routed into the sensor store and/or the limit store.
//!
//! The socket loop only receives; datagrams are handed over a channel to a
//! separate applier task so a bad message can never take the socket down.

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::limits::{LimitKey, LimitStore};
use crate::state::{FieldKind, FieldValue, SensorField, StateStore};

/// Largest datagram accepted; longer ones are truncated by the OS and then
/// fail to parse.
const MAX_DATAGRAM: usize = 2048;

/// Datagrams buffered between the socket loop and the applier.
const QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateMsg {
    #[serde(rename = "type")]
    pub(crate) kind: Option<String>,
    #[serde(default)]
    pub(crate) value: Value,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed update json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("cannot coerce {value} to {kind:?} for '{name}'")]
    Coerce {
        name: String,
        kind: FieldKind,
        value: Value,
    },
}

/// What a single update did to the stores.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Message had no `type`; discarded silently.
    Untyped,
    /// `type` matched neither a sensor field nor a limit.
    Unknown(String),
    Applied {
        sensor: Option<(SensorField, FieldValue)>,
        limit: Option<(LimitKey, f64)>,
    },
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn coerce_float(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Some(true),
            "false" | "off" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|v| v.is_finite() && v.abs() < i64::MAX as f64)
                .map(|v| v.trunc() as i64)
        }),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Coerce a raw JSON value to `kind`.
pub(crate) fn coerce(name: &str, kind: FieldKind, value: &Value) -> Result<FieldValue, IngestError> {
    let coerced = match kind {
        FieldKind::Float => coerce_float(value).map(FieldValue::Float),
        FieldKind::Bool => coerce_bool(value).map(FieldValue::Bool),
        FieldKind::Count => coerce_count(value).map(FieldValue::Count),
    };
    coerced.ok_or_else(|| IngestError::Coerce {
        name: name.to_string(),
        kind,
        value: value.clone(),
    })
}

/// Coerce a limit value. Limits are always floats.
pub(crate) fn coerce_limit(key: LimitKey, value: &Value) -> Result<f64, IngestError> {
    coerce_float(value).ok_or_else(|| IngestError::Coerce {
        name: key.name().to_string(),
        kind: FieldKind::Float,
        value: value.clone(),
    })
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Decode one datagram and route it. Sensor and limit matching are
/// independent checks; both values are coerced before either store is
/// touched so a failed coercion leaves both stores unchanged.
pub async fn apply_update(
    payload: &[u8],
    state: &StateStore,
    limits: &LimitStore,
) -> Result<Outcome, IngestError> {
    let msg: UpdateMsg = serde_json::from_slice(payload)?;

    let Some(name) = msg.kind else {
        return Ok(Outcome::Untyped);
    };

    let sensor = match SensorField::from_name(&name) {
        Some(field) => Some((field, coerce(&name, field.kind(), &msg.value)?)),
        None => None,
    };
    let limit = match LimitKey::from_name(&name) {
        Some(key) => Some((key, coerce_limit(key, &msg.value)?)),
        None => None,
    };

    if sensor.is_none() && limit.is_none() {
        return Ok(Outcome::Unknown(name));
    }

    if let Some((field, value)) = sensor {
        state.set(field, value).await;
    }
    if let Some((key, value)) = limit {
        limits.set(key, value).await;
    }

    Ok(Outcome::Applied { sensor, limit })
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub struct IngestListener {
    socket: UdpSocket,
    state: StateStore,
    limits: LimitStore,
}

impl IngestListener {
    /// Bind the update socket. Failure here is fatal for the hub.
    pub async fn bind(addr: &str, state: StateStore, limits: LimitStore) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind udp update socket {addr}"))?;
        Ok(Self::new(socket, state, limits))
    }

    pub fn new(socket: UdpSocket, state: StateStore, limits: LimitStore) -> Self {
        Self { socket, state, limits }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until `shutdown` flips. The pending read is
    /// abandoned on shutdown and queued datagrams are discarded.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
        let applier = tokio::spawn(run_applier(rx, self.state, self.limits));

        if let Ok(addr) = self.socket.local_addr() {
            info!(%addr, "ingest listening");
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, _peer)) => {
                        if tx.send(buf[..len].to_vec()).await.is_err() {
                            error!("ingest applier stopped; listener exiting");
                            break;
                        }
                    }
                    Err(e) => warn!("udp recv failed: {e}"),
                },
            }
        }

        applier.abort();
        info!("ingest stopped");
    }
}

async fn run_applier(mut rx: mpsc::Receiver<Vec<u8>>, state: StateStore, limits: LimitStore) {
    while let Some(payload) = rx.recv().await {
        match apply_update(&payload, &state, &limits).await {
            Ok(Outcome::Applied { sensor, limit }) => {
                if let Some((field, value)) = sensor {
                    debug!(field = %field, %value, "sensor update");
                }
                if let Some((key, value)) = limit {
                    info!(limit = %key, value, "limit update");
                }
            }
            Ok(Outcome::Unknown(name)) => debug!(%name, "ignoring unknown update type"),
            Ok(Outcome::Untyped) => {}
            Err(e) => warn!("dropping update: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
