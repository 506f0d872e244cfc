//! Periodic sampling loop: snapshot the stores, decide the pumps, log the
//! record, and hand the encoded frame to the uplink.
//!
//! ```text
//! ┌─ tick start ─────────────────────────────────────────────────────────┐
//! │ take_tick ─▶ limits ─▶ decide ─▶ actuate ─▶ log ─▶ encode ─▶ uplink  │
//! └──────────────────────────────────────────────────────────────────────┘
//!          sleep(max(0, period − elapsed)) ─▶ next tick start
//! ```
//!
//! The period is measured from tick start to tick start. A tick that
//! overruns the period is followed immediately by the next one; ticks are
//! never skipped or batched.

use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, TelemetryFrame};
use crate::limits::LimitStore;
use crate::logbook::{LogRecord, LogSink, PumpDecision};
use crate::pump::Actuator;
use crate::radio::UplinkSink;
use crate::state::StateStore;

/// Time to wait after a tick that took `elapsed`.
pub fn next_sleep(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

pub struct Scheduler<L, U, A> {
    period: Duration,
    state: StateStore,
    limits: LimitStore,
    codec: Codec,
    log: L,
    uplink: U,
    actuator: A,
    last_tick: watch::Sender<Option<LogRecord>>,
}

impl<L: LogSink, U: UplinkSink, A: Actuator> Scheduler<L, U, A> {
    pub fn new(
        period: Duration,
        state: StateStore,
        limits: LimitStore,
        codec: Codec,
        log: L,
        uplink: U,
        actuator: A,
    ) -> Self {
        let (last_tick, _) = watch::channel(None);
        Self {
            period,
            state,
            limits,
            codec,
            log,
            uplink,
            actuator,
            last_tick,
        }
    }

    /// Receiver for the most recently logged record.
    pub fn subscribe(&self) -> watch::Receiver<Option<LogRecord>> {
        self.last_tick.subscribe()
    }

    /// Run one tick stamped `at`. A log failure fails the tick before
    /// anything is sent; an uplink failure is only reported.
    pub async fn tick(&mut self, at: OffsetDateTime) -> Result<TelemetryFrame> {
        let sensors = self.state.take_tick().await;
        let limits = self.limits.snapshot().await;
        let decision = PumpDecision::from_readings(&sensors, &limits);
        self.actuator.apply(decision);

        let record = LogRecord {
            timestamp: at,
            transpiration: sensors.transpiration,
            sensors,
            decision,
            limits,
        };
        self.log
            .append(&record)
            .await
            .context("failed to append log record")?;

        let frame = self.codec.encode(&record);
        self.last_tick.send_replace(Some(record));

        if let Err(e) = self.uplink.send(&frame).await {
            warn!("uplink failed: {e:#}");
        }
        Ok(frame)
    }

    /// Tick until shutdown, then close the log and switch every pump off.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_sec = self.period.as_secs(),
            profile = %self.codec.profile,
            "scheduler started"
        );

        loop {
            let started = Instant::now();
            match self.tick(OffsetDateTime::now_utc()).await {
                Ok(frame) => debug!(payload = %frame.to_hex(), "tick complete"),
                Err(e) => error!("tick failed: {e:#}"),
            }

            let pause = next_sleep(self.period, started.elapsed());
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if let Err(e) = self.log.close().await {
            error!("failed to close log: {e:#}");
        }
        self.actuator.all_off();
        info!("scheduler stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
