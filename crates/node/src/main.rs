mod sim;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{HydroSim, Sample, Scenario, Thresholds};

/// New limits are pushed every this many intervals.
const LIMITS_EVERY: u64 = 3;

#[derive(Debug, Serialize)]
struct UpdateMsg {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    value: Value,
}

impl UpdateMsg {
    fn new(kind: &'static str, timestamp: OffsetDateTime, value: Value) -> Self {
        Self {
            kind,
            timestamp,
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// Env config
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct NodeConfig {
    hub_addr: String,
    sample_every: Duration,
    scenario: Scenario,
}

impl NodeConfig {
    fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let sample_every_s: u64 = get("SAMPLE_EVERY_S")
            .and_then(|s| s.parse().ok())
            .filter(|&s| s > 0)
            .unwrap_or(60);
        Self {
            hub_addr: get("HUB_ADDR").unwrap_or_else(|| "127.0.0.1:5001".to_string()),
            sample_every: Duration::from_secs(sample_every_s),
            scenario: Scenario::from_str_lossy(&get("SIM_SCENARIO").unwrap_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One datagram per field, in the order the sensor array reports them.
fn sample_messages(s: &Sample, at: OffsetDateTime) -> Vec<UpdateMsg> {
    vec![
        UpdateMsg::new("ph", at, json!(s.ph)),
        UpdateMsg::new("ec", at, json!(s.ec)),
        UpdateMsg::new("water_level", at, json!(s.water_level)),
        UpdateMsg::new("circulation", at, json!(s.circulation)),
        UpdateMsg::new("temperature", at, json!(s.temperature)),
        UpdateMsg::new("o2", at, json!(s.o2)),
        UpdateMsg::new("ph_pump", at, json!(s.ph_pump)),
        UpdateMsg::new("ec_pump", at, json!(s.ec_pump)),
        UpdateMsg::new("transpiration", at, json!(s.transpiration)),
    ]
}

fn limit_messages(t: &Thresholds, at: OffsetDateTime) -> Vec<UpdateMsg> {
    vec![
        UpdateMsg::new("ph_min", at, json!(t.ph_min)),
        UpdateMsg::new("ph_max", at, json!(t.ph_max)),
        UpdateMsg::new("ec_min", at, json!(t.ec_min)),
        UpdateMsg::new("ec_max", at, json!(t.ec_max)),
    ]
}

/// Build the datagrams for interval `n` (1-based). Pump flags use the
/// limits in effect before this interval's retune.
fn interval_messages(
    n: u64,
    sim: &mut HydroSim,
    limits: &mut Thresholds,
    at: OffsetDateTime,
) -> Vec<UpdateMsg> {
    let sample = sim.sample(limits);
    let mut msgs = sample_messages(&sample, at);
    if n % LIMITS_EVERY == 0 {
        *limits = Thresholds::random();
        msgs.extend(limit_messages(limits, at));
    }
    msgs
}

/// Send every message as its own datagram. Returns how many went out.
async fn send_all(socket: &UdpSocket, hub_addr: &str, msgs: &[UpdateMsg]) -> usize {
    let mut sent = 0;
    for msg in msgs {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(kind = msg.kind, "encode failed: {e}");
                continue;
            }
        };
        match socket.send_to(&payload, hub_addr).await {
            Ok(_) => sent += 1,
            Err(e) => warn!(kind = msg.kind, "send to {hub_addr} failed: {e}"),
        }
    }
    sent
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = NodeConfig::from_env();
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind udp socket")?;

    let mut sim = HydroSim::new(cfg.scenario);
    let mut limits = Thresholds::default();
    info!(
        hub = %cfg.hub_addr,
        every_s = cfg.sample_every.as_secs(),
        scenario = %cfg.scenario,
        "node started"
    );

    let mut n: u64 = 0;
    loop {
        let started = Instant::now();
        n += 1;

        let msgs = interval_messages(n, &mut sim, &mut limits, OffsetDateTime::now_utc());
        let sent = send_all(&socket, &cfg.hub_addr, &msgs).await;
        info!(interval = n, sent, total = msgs.len(), "interval sent");

        let pause = cfg.sample_every.saturating_sub(started.elapsed());
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(pause) => {}
        }
    }

    info!("node stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
