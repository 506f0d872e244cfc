mod codec;
mod config;
mod downlink;
mod ingest;
mod limits;
mod logbook;
mod pump;
mod radio;
mod scheduler;
mod state;
mod web;

use anyhow::{Context, Result};
use std::env;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::LogBackend;
use downlink::LimitDownlinkReceiver;
use ingest::IngestListener;
use limits::LimitStore;
use logbook::{CsvLog, LogBook, SqliteLog};
use pump::PumpBoard;
use radio::{LogUplink, RadioBridge, Uplink};
use scheduler::Scheduler;
use state::StateStore;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").ok();
    let cfg = config::resolve(config_path.as_deref())?;

    // ── Stores ──────────────────────────────────────────────────────
    let state = StateStore::default();
    let limits = LimitStore::new(cfg.limits);

    // ── Sockets (fatal if unavailable) ──────────────────────────────
    let ingest = IngestListener::bind(&cfg.hub.udp_bind, state.clone(), limits.clone()).await?;
    let web_listener = TcpListener::bind(&cfg.hub.web_bind)
        .await
        .with_context(|| format!("failed to bind web port {}", cfg.hub.web_bind))?;

    // ── Log sink ────────────────────────────────────────────────────
    let log = match cfg.log.backend {
        LogBackend::Csv => LogBook::Csv(CsvLog::new(cfg.log.path())),
        LogBackend::Sqlite => {
            let db = SqliteLog::connect(&format!("sqlite:{}", cfg.log.path())).await?;
            db.migrate().await?;
            LogBook::Sqlite(db)
        }
    };
    info!(backend = ?cfg.log.backend, path = cfg.log.path(), "log sink ready");

    // ── Pump board ──────────────────────────────────────────────────
    // Pins are range-checked by config validation.
    let pumps = PumpBoard::new(
        cfg.pumps.ph_gpio as u8,
        cfg.pumps.ec_gpio as u8,
        cfg.pumps.active_low,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(&str, JoinHandle<()>)> = Vec::new();

    // ── Radio bridge ────────────────────────────────────────────────
    let uplink = match &cfg.radio {
        Some(radio) => {
            let (uplink, downlink, driver) = RadioBridge::connect(radio).split();
            tasks.push(("radio", tokio::spawn(driver.run(shutdown_rx.clone()))));
            tasks.push((
                "downlink",
                tokio::spawn(
                    LimitDownlinkReceiver::new(downlink, limits.clone()).run(shutdown_rx.clone()),
                ),
            ));
            Uplink::Mqtt(uplink)
        }
        None => {
            info!("no [radio] section; uplink frames are only logged");
            Uplink::Log(LogUplink)
        }
    };

    // ── Scheduler + ingest ──────────────────────────────────────────
    let scheduler = Scheduler::new(
        cfg.period(),
        state.clone(),
        limits.clone(),
        cfg.codec(),
        log,
        uplink,
        pumps,
    );
    let last_tick = scheduler.subscribe();
    tasks.push(("scheduler", tokio::spawn(scheduler.run(shutdown_rx.clone()))));
    tasks.push(("ingest", tokio::spawn(ingest.run(shutdown_rx.clone()))));

    // ── Status API ──────────────────────────────────────────────────
    let app = AppState {
        state,
        limits,
        last_tick,
        profile: cfg.telemetry.profile,
        started_at: Instant::now(),
    };
    let web_shutdown = shutdown_rx.clone();
    tasks.push((
        "web",
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_listener, app, web_shutdown).await {
                error!("{e:#}");
            }
        }),
    ));

    info!(
        period_sec = cfg.hub.period_sec,
        profile = %cfg.telemetry.profile,
        "hub started"
    );

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!(task = name, "task ended abnormally: {e}");
        }
    }
    info!("hub stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
