//! TOML config file loading and validation.
//!
//! Every section is optional; a missing section takes its defaults. A
//! missing `[radio]` section disables the MQTT radio bridge.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::codec::{Codec, EcUnit, FrameProfile};
use crate::limits::Limits;

/// Used when `CONFIG_PATH` is not set. Unlike an explicit path, this file
/// may be absent.
pub const DEFAULT_CONFIG_PATH: &str = "hub.toml";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub radio: Option<RadioConfig>,
    #[serde(default)]
    pub pumps: PumpsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub period_sec: u64,
    pub udp_bind: String,
    pub web_bind: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            period_sec: 60,
            udp_bind: "0.0.0.0:5001".into(),
            web_bind: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub profile: FrameProfile,
    pub ec_unit: EcUnit,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            profile: FrameProfile::Legacy,
            ec_unit: EcUnit::MsPerCm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    #[default]
    Csv,
    Sqlite,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub backend: LogBackend,
    pub path: Option<String>,
}

impl LogConfig {
    pub fn path(&self) -> &str {
        match (&self.path, self.backend) {
            (Some(p), _) => p,
            (None, LogBackend::Csv) => "sensor_database.csv",
            (None, LogBackend::Sqlite) => "sensor_database.db",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub client_id: String,
    pub uplink_topic: String,
    pub downlink_topic: String,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".into(),
            mqtt_port: 1883,
            client_id: "hydro-hub".into(),
            uplink_topic: "hydro/uplink".into(),
            downlink_topic: "hydro/downlink".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PumpsConfig {
    pub ph_gpio: i64,
    pub ec_gpio: i64,
    /// Many common relay boards are active-low. If yours is active-high,
    /// set false.
    pub active_low: bool,
}

impl Default for PumpsConfig {
    fn default() -> Self {
        Self {
            ph_gpio: 5,
            ec_gpio: 6,
            active_low: true,
        }
    }
}

impl Config {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.hub.period_sec)
    }

    pub fn codec(&self) -> Codec {
        Codec::new(self.telemetry.profile, self.telemetry.ec_unit)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Physical pH scale.
const PH_RANGE: std::ops::RangeInclusive<f64> = 0.0..=14.0;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_limits(&mut errors);
        self.validate_log(&mut errors);
        self.validate_radio(&mut errors);
        self.validate_pumps(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let h = &self.hub;
        if h.period_sec == 0 {
            errors.push("hub: period_sec must be positive, got 0".into());
        }
        for (key, addr) in [("udp_bind", &h.udp_bind), ("web_bind", &h.web_bind)] {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("hub: {key} '{addr}' is not a socket address"));
            }
        }
    }

    fn validate_limits(&self, errors: &mut Vec<String>) {
        let l = &self.limits;
        let all = [
            ("ph_min", l.ph_min),
            ("ph_max", l.ph_max),
            ("ec_min", l.ec_min),
            ("ec_max", l.ec_max),
        ];
        if let Some((key, v)) = all.iter().find(|(_, v)| !v.is_finite()) {
            errors.push(format!("limits: {key} must be finite, got {v}"));
            return;
        }

        for (key, v) in [("ph_min", l.ph_min), ("ph_max", l.ph_max)] {
            if !PH_RANGE.contains(&v) {
                errors.push(format!("limits: {key} {v} out of range [0, 14]"));
            }
        }
        for (key, v) in [("ec_min", l.ec_min), ("ec_max", l.ec_max)] {
            if v < 0.0 {
                errors.push(format!("limits: {key} must not be negative, got {v}"));
            }
        }

        if l.ph_min >= l.ph_max {
            errors.push(format!(
                "limits: ph_min ({}) must be less than ph_max ({})",
                l.ph_min, l.ph_max
            ));
        }
        if l.ec_min >= l.ec_max {
            errors.push(format!(
                "limits: ec_min ({}) must be less than ec_max ({})",
                l.ec_min, l.ec_max
            ));
        }
    }

    fn validate_log(&self, errors: &mut Vec<String>) {
        if self.log.path().trim().is_empty() {
            errors.push("log: path is empty".into());
        }
    }

    fn validate_radio(&self, errors: &mut Vec<String>) {
        let Some(r) = &self.radio else {
            return;
        };
        if r.mqtt_host.trim().is_empty() {
            errors.push("radio: mqtt_host is empty".into());
        }
        if r.mqtt_port == 0 {
            errors.push("radio: mqtt_port must be non-zero".into());
        }
        if r.client_id.trim().is_empty() {
            errors.push("radio: client_id is empty".into());
        }
        if r.uplink_topic.trim().is_empty() {
            errors.push("radio: uplink_topic is empty".into());
        }
        if r.downlink_topic.trim().is_empty() {
            errors.push("radio: downlink_topic is empty".into());
        } else if r.downlink_topic.contains(['+', '#']) {
            errors.push(format!(
                "radio: downlink_topic '{}' must not contain wildcards",
                r.downlink_topic
            ));
        }
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let p = &self.pumps;
        for (key, pin) in [("ph_gpio", p.ph_gpio), ("ec_gpio", p.ec_gpio)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pumps: {key} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if p.ph_gpio == p.ec_gpio {
            errors.push(format!(
                "pumps: ph_gpio and ec_gpio are both {}; each pump needs its own pin",
                p.ph_gpio
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Load the config named by `explicit` (from `CONFIG_PATH`), falling back
/// to [`DEFAULT_CONFIG_PATH`] and then to built-in defaults.
pub fn resolve(explicit: Option<&str>) -> Result<Config> {
    match explicit {
        Some(path) => load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load(DEFAULT_CONFIG_PATH),
        None => {
            tracing::info!("no {DEFAULT_CONFIG_PATH} found; using built-in defaults");
            Ok(Config::default())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.hub.period_sec, 60);
        assert_eq!(config.hub.udp_bind, "0.0.0.0:5001");
        assert_eq!(config.hub.web_bind, "0.0.0.0:8080");
        assert_eq!(config.limits, Limits::default());
        assert_eq!(config.telemetry.profile, FrameProfile::Legacy);
        assert_eq!(config.telemetry.ec_unit, EcUnit::MsPerCm);
        assert_eq!(config.log.backend, LogBackend::Csv);
        assert_eq!(config.log.path(), "sensor_database.csv");
        assert!(config.radio.is_none());
        assert_eq!(config.pumps.ph_gpio, 5);
        assert!(config.pumps.active_low);
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[hub]
period_sec = 30
udp_bind = "127.0.0.1:6001"
web_bind = "127.0.0.1:9090"

[limits]
ph_min = 5.8
ph_max = 6.2
ec_min = 1.2
ec_max = 1.6

[telemetry]
profile = "extended"
ec_unit = "us_per_cm"

[log]
backend = "sqlite"
path = "/var/lib/hydro/samples.db"

[radio]
mqtt_host = "gateway.local"
mqtt_port = 8883
client_id = "greenhouse-1"
uplink_topic = "lora/up"
downlink_topic = "lora/down"

[pumps]
ph_gpio = 17
ec_gpio = 27
active_low = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.period(), Duration::from_secs(30));
        assert_eq!(config.limits.ec_max, 1.6);
        assert_eq!(
            config.codec(),
            Codec::new(FrameProfile::Extended, EcUnit::UsPerCm)
        );
        assert_eq!(config.log.backend, LogBackend::Sqlite);
        assert_eq!(config.log.path(), "/var/lib/hydro/samples.db");
        let radio = config.radio.unwrap();
        assert_eq!(radio.mqtt_port, 8883);
        assert_eq!(radio.downlink_topic, "lora/down");
        assert_eq!(config.pumps.ec_gpio, 27);
        assert!(!config.pumps.active_low);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: Config = toml::from_str(
            r#"
[limits]
ph_max = 7.3

[radio]
mqtt_host = "broker"
"#,
        )
        .unwrap();
        assert_eq!(config.limits.ph_max, 7.3);
        assert_eq!(config.limits.ph_min, 6.9);
        let radio = config.radio.unwrap();
        assert_eq!(radio.mqtt_host, "broker");
        assert_eq!(radio.mqtt_port, 1883);
        assert_eq!(radio.uplink_topic, "hydro/uplink");
    }

    #[test]
    fn sqlite_default_path() {
        let config: Config = toml::from_str("[log]\nbackend = \"sqlite\"").unwrap();
        assert_eq!(config.log.path(), "sensor_database.db");
    }

    #[test]
    fn unknown_profile_rejected() {
        assert!(toml::from_str::<Config>("[telemetry]\nprofile = \"v3\"").is_err());
    }

    // -- Validation: hub ----------------------------------------------------

    #[test]
    fn zero_period_rejected() {
        let mut cfg = Config::default();
        cfg.hub.period_sec = 0;
        assert_validation_err(&cfg, "period_sec must be positive");
    }

    #[test]
    fn bad_bind_address_rejected() {
        let mut cfg = Config::default();
        cfg.hub.udp_bind = "localhost".into();
        assert_validation_err(&cfg, "udp_bind 'localhost' is not a socket address");
    }

    // -- Validation: limits -------------------------------------------------

    #[test]
    fn non_finite_limit_rejected() {
        let mut cfg = Config::default();
        cfg.limits.ec_max = f64::INFINITY;
        assert_validation_err(&cfg, "ec_max must be finite");
    }

    #[test]
    fn ph_out_of_scale_rejected() {
        let mut cfg = Config::default();
        cfg.limits.ph_max = 15.0;
        assert_validation_err(&cfg, "ph_max 15 out of range [0, 14]");
    }

    #[test]
    fn negative_ec_rejected() {
        let mut cfg = Config::default();
        cfg.limits.ec_min = -0.1;
        assert_validation_err(&cfg, "ec_min must not be negative");
    }

    #[test]
    fn inverted_limits_rejected() {
        let mut cfg = Config::default();
        cfg.limits.ph_min = 7.2;
        assert_validation_err(&cfg, "ph_min (7.2) must be less than ph_max (7.1)");

        let mut cfg = Config::default();
        cfg.limits.ec_max = cfg.limits.ec_min;
        assert_validation_err(&cfg, "ec_min (0.9) must be less than ec_max (0.9)");
    }

    // -- Validation: log ----------------------------------------------------

    #[test]
    fn empty_log_path_rejected() {
        let mut cfg = Config::default();
        cfg.log.path = Some("  ".into());
        assert_validation_err(&cfg, "log: path is empty");
    }

    // -- Validation: radio --------------------------------------------------

    #[test]
    fn radio_fields_checked() {
        let mut cfg = Config::default();
        cfg.radio = Some(RadioConfig {
            mqtt_host: "".into(),
            mqtt_port: 0,
            ..RadioConfig::default()
        });
        assert_validation_err(&cfg, "mqtt_host is empty");
        assert_validation_err(&cfg, "mqtt_port must be non-zero");
    }

    #[test]
    fn wildcard_downlink_rejected() {
        let mut cfg = Config::default();
        cfg.radio = Some(RadioConfig {
            downlink_topic: "hydro/+/down".into(),
            ..RadioConfig::default()
        });
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    // -- Validation: pumps --------------------------------------------------

    #[test]
    fn reserved_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pumps.ph_gpio = 0;
        assert_validation_err(&cfg, "ph_gpio 0 is not a valid BCM GPIO pin");
    }

    #[test]
    fn pin_out_of_header_rejected() {
        let mut cfg = Config::default();
        cfg.pumps.ec_gpio = 28;
        assert_validation_err(&cfg, "ec_gpio 28 is not a valid BCM GPIO pin");
    }

    #[test]
    fn shared_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pumps.ec_gpio = 5;
        assert_validation_err(&cfg, "ph_gpio and ec_gpio are both 5");
    }

    // -- Validation: multiple errors ------------------------------------------

    #[test]
    fn multiple_errors_all_reported() {
        let mut cfg = Config::default();
        cfg.hub.period_sec = 0;
        cfg.limits.ec_min = -1.0;
        cfg.pumps.ph_gpio = 1;

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "expected 3 errors, got: {msg}");
        assert!(msg.contains("period_sec"));
        assert!(msg.contains("ec_min"));
        assert!(msg.contains("ph_gpio"));
    }

    #[test]
    fn single_error_no_plural() {
        let mut cfg = Config::default();
        cfg.hub.period_sec = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("1 error)"), "expected '1 error)', got: {msg}");
    }

    // -- Load ---------------------------------------------------------------

    #[test]
    fn load_missing_explicit_file_fails() {
        let err = load("/nonexistent/hub.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }

    #[test]
    fn load_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!("hydro-hub-cfg-{}.toml", std::process::id()));
        std::fs::write(&path, "[hub]\nperiod_sec = 0\n").unwrap();
        let err = load(path.to_str().unwrap()).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(format!("{err:#}").contains("invalid config"));
    }

    #[test]
    fn resolve_explicit_path() {
        let path =
            std::env::temp_dir().join(format!("hydro-hub-resolve-{}.toml", std::process::id()));
        std::fs::write(&path, "[hub]\nperiod_sec = 15\n").unwrap();
        let cfg = resolve(Some(path.to_str().unwrap())).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.hub.period_sec, 15);
    }
}
