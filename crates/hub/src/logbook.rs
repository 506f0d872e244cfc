//! Per-tick log records and the durable sinks they are appended to.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::limits::Limits;
use crate::state::SensorSnapshot;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Pump decisions for one tick. Dosing only reacts to the low side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct PumpDecision {
    pub ph_pump_on: bool,
    pub ec_pump_on: bool,
}

impl PumpDecision {
    pub fn from_readings(sensors: &SensorSnapshot, limits: &Limits) -> Self {
        Self {
            ph_pump_on: sensors.ph < limits.ph_min,
            ec_pump_on: sensors.ec < limits.ec_min,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub sensors: SensorSnapshot,
    pub decision: PumpDecision,
    /// Transpiration count drained this tick.
    pub transpiration: i64,
    pub limits: Limits,
}

impl LogRecord {
    pub fn date(&self) -> String {
        self.timestamp
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_default()
    }

    pub fn time_of_day(&self) -> String {
        self.timestamp
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

/// Append-only destination for tick records. Owned exclusively by the
/// scheduler.
pub trait LogSink: Send {
    fn append(&mut self, record: &LogRecord) -> impl Future<Output = Result<()>> + Send;

    /// Flush and release any open handle. Called once on shutdown.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

pub const CSV_HEADER: &str = "date,time,ph,ec,water_level,circulation,ph_pump,ec_pump,\
temperature,o2,ph_pump_on,ec_pump_on,transpiration,ph_min,ph_max,ec_min,ec_max";

pub fn csv_row(r: &LogRecord) -> String {
    let s = &r.sensors;
    let l = &r.limits;
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        r.date(),
        r.time_of_day(),
        s.ph,
        s.ec,
        s.water_level,
        s.circulation,
        s.ph_pump,
        s.ec_pump,
        s.temperature,
        s.o2,
        r.decision.ph_pump_on,
        r.decision.ec_pump_on,
        r.transpiration,
        l.ph_min,
        l.ph_max,
        l.ec_min,
        l.ec_max,
    )
}

/// CSV file sink. The file is opened on the first append; the header is
/// written when the file is empty at that point or holds only a cut-off
/// header.
pub struct CsvLog {
    path: PathBuf,
    file: Option<File>,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    async fn open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create log dir {}", parent.display()))?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("failed to open log {}", self.path.display()))?;

            let header = format!("{CSV_HEADER}\n");
            let len = file.metadata().await.context("failed to stat log")?.len();
            let needs_header = if len == 0 {
                true
            } else if len < header.len() as u64 {
                // A previous header write may have stopped part way.
                let existing = tokio::fs::read(&self.path)
                    .await
                    .with_context(|| format!("failed to read log {}", self.path.display()))?;
                header.as_bytes().starts_with(&existing)
            } else {
                false
            };

            if needs_header {
                if len > 0 {
                    tracing::warn!(path = %self.path.display(), "rewriting partial log header");
                }
                let res = async {
                    file.set_len(0).await?;
                    file.write_all(header.as_bytes()).await?;
                    file.flush().await
                }
                .await;
                if let Err(e) = res {
                    let _ = file.set_len(0).await;
                    return Err(e).context("failed to write log header");
                }
                tracing::info!(path = %self.path.display(), "created log file");
            }
            self.file = Some(file);
        }
        self.file.as_mut().context("log file not open")
    }
}

impl LogSink for CsvLog {
    async fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = format!("{}\n", csv_row(record));
        let file = self.open().await?;
        let res = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = res {
            // Reopen on the next tick rather than keep a broken handle.
            self.file = None;
            return Err(e).context("failed to append log row");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.context("failed to flush log")?;
            file.sync_all().await.context("failed to sync log")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteLog {
    pool: Pool<Sqlite>,
}

impl SqliteLog {
    /// db_url examples:
    /// - "sqlite:/home/pi/hydro/samples.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

impl LogSink for SqliteLog {
    async fn append(&mut self, r: &LogRecord) -> Result<()> {
        let s = &r.sensors;
        let l = &r.limits;
        sqlx::query(
            r#"
            INSERT INTO samples (
              ts, date, time,
              ph, ec, water_level, circulation, ph_pump, ec_pump, temperature, o2,
              ph_pump_on, ec_pump_on, transpiration,
              ph_min, ph_max, ec_min, ec_max
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.timestamp.unix_timestamp())
        .bind(r.date())
        .bind(r.time_of_day())
        .bind(s.ph)
        .bind(s.ec)
        .bind(s.water_level)
        .bind(s.circulation)
        .bind(s.ph_pump)
        .bind(s.ec_pump)
        .bind(s.temperature)
        .bind(s.o2)
        .bind(r.decision.ph_pump_on)
        .bind(r.decision.ec_pump_on)
        .bind(r.transpiration)
        .bind(l.ph_min)
        .bind(l.ph_max)
        .bind(l.ec_min)
        .bind(l.ec_max)
        .execute(&self.pool)
        .await
        .context("insert sample failed")?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configured backend
// ---------------------------------------------------------------------------

/// The sink selected by `[log] backend`.
pub enum LogBook {
    Csv(CsvLog),
    Sqlite(SqliteLog),
}

impl LogSink for LogBook {
    async fn append(&mut self, record: &LogRecord) -> Result<()> {
        match self {
            Self::Csv(log) => log.append(record).await,
            Self::Sqlite(log) => log.append(record).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            Self::Csv(log) => log.close().await,
            Self::Sqlite(log) => log.close().await,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
