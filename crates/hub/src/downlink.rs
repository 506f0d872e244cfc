//! Limit updates arriving over the radio downlink.

use serde_json::{Map, Value};
use std::future::Future;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::ingest::{coerce_limit, IngestError};
use crate::limits::{LimitKey, LimitStore};

/// Source of raw downlink payloads. Receives are long-latency; `None`
/// means the source is closed for good.
pub trait DownlinkSource: Send {
    fn recv(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;
}

impl DownlinkSource for mpsc::Receiver<Vec<u8>> {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        mpsc::Receiver::recv(self).await
    }
}

#[derive(Debug, Error)]
pub enum DownlinkError {
    #[error("malformed downlink json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("downlink is not a json object")]
    NotAnObject,
    #[error(transparent)]
    Value(#[from] IngestError),
}

/// Extract the limit updates carried by one downlink. Unknown keys are
/// ignored; a present key with a non-numeric value rejects the whole
/// message. An empty payload yields no updates.
pub fn parse_downlink(payload: &[u8]) -> Result<Vec<(LimitKey, f64)>, DownlinkError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let msg: Map<String, Value> = match serde_json::from_slice(payload)? {
        Value::Object(map) => map,
        _ => return Err(DownlinkError::NotAnObject),
    };

    LimitKey::ALL
        .into_iter()
        .filter_map(|key| msg.get(key.name()).map(|v| (key, v)))
        .map(|(key, v)| Ok((key, coerce_limit(key, v)?)))
        .collect()
}

pub struct LimitDownlinkReceiver<S> {
    source: S,
    limits: LimitStore,
}

impl<S: DownlinkSource> LimitDownlinkReceiver<S> {
    pub fn new(source: S, limits: LimitStore) -> Self {
        Self { source, limits }
    }

    /// Handle one payload. Returns the keys that were updated.
    pub async fn handle(&self, payload: &[u8]) -> Result<Vec<LimitKey>, DownlinkError> {
        let updates = parse_downlink(payload)?;
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        self.limits.apply(&updates).await;
        for (key, value) in &updates {
            info!(limit = %key, value, "downlink limit updated");
        }
        Ok(updates.into_iter().map(|(k, _)| k).collect())
    }

    /// Listen until shutdown or until the source closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("downlink receiver started");
        loop {
            let payload = tokio::select! {
                _ = shutdown.changed() => break,
                p = self.source.recv() => p,
            };
            let Some(payload) = payload else {
                warn!("downlink source closed");
                break;
            };
            if let Err(e) = self.handle(&payload).await {
                warn!("dropping downlink: {e}");
            }
        }
        info!("downlink receiver stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
