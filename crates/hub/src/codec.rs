//! Binary telemetry frames for the LoRaWAN uplink.
//!
//! Two wire profiles exist and the gateway decoder must be configured for
//! the same one. Both are big-endian with the flags byte last:
//!
//! ```text
//! legacy   (FPort 2,  8 bytes): ec:u8  ph:u8 temp:u16 o2:u8  level:u8 trans:u8 flags:u8
//! extended (FPort 3, 10 bytes): ec:u16 ph:u8 temp:u16 o2:u16 level:u8 trans:u8 flags:u8
//!
//! flags: bit7 ph_pump_on | bit6 ec_pump_on | bit5 circulation | bits4..0 zero
//! ```
//!
//! Every scaled value is rounded and clamped into its field width; encoding
//! never fails.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::logbook::LogRecord;

const FLAG_PH_PUMP: u8 = 1 << 7;
const FLAG_EC_PUMP: u8 = 1 << 6;
const FLAG_CIRCULATION: u8 = 1 << 5;

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameProfile {
    /// Original 8-byte frame (v1).
    Legacy,
    /// Wider ec/o2 fields, 10 bytes (v2).
    Extended,
}

/// Unit the hub's `ec` reading is expressed in, which decides its scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EcUnit {
    /// mS/cm, sent as hundredths.
    #[default]
    MsPerCm,
    /// Integer µS/cm, sent as-is.
    UsPerCm,
}

impl EcUnit {
    fn scale(self) -> f64 {
        match self {
            Self::MsPerCm => 100.0,
            Self::UsPerCm => 1.0,
        }
    }
}

/// Byte width of a packed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    U8,
    U16,
}

impl Width {
    fn max(self) -> f64 {
        match self {
            Self::U8 => u8::MAX as f64,
            Self::U16 => u16::MAX as f64,
        }
    }

    fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
        }
    }
}

struct Layout {
    ec: Width,
    o2: Width,
}

impl FrameProfile {
    fn layout(self) -> Layout {
        match self {
            Self::Legacy => Layout {
                ec: Width::U8,
                o2: Width::U8,
            },
            Self::Extended => Layout {
                ec: Width::U16,
                o2: Width::U16,
            },
        }
    }

    /// Frame width in bytes.
    pub fn frame_len(self) -> usize {
        let l = self.layout();
        // ph + temp + level + trans + flags
        l.ec.bytes() + l.o2.bytes() + 1 + 2 + 1 + 1 + 1
    }

    /// LoRaWAN application port the frame is sent on; the gateway uses it
    /// to pick the matching decoder.
    pub fn fport(self) -> u8 {
        match self {
            Self::Legacy => 2,
            Self::Extended => 3,
        }
    }
}

impl fmt::Display for FrameProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Extended => write!(f, "extended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    pub profile: FrameProfile,
    pub ec_unit: EcUnit,
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    profile: FrameProfile,
    bytes: Vec<u8>,
}

impl TelemetryFrame {
    pub fn profile(&self) -> FrameProfile {
        self.profile
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Upper-case hex, the form the radio modem's `AT+SEND` expects.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02X}")).collect()
    }
}

/// Unscaled field values recovered from a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub ec: f64,
    pub ph: f64,
    pub temperature: f64,
    pub o2: f64,
    pub water_level: f64,
    pub transpiration: u8,
    pub ph_pump_on: bool,
    pub ec_pump_on: bool,
    pub circulation: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{profile} frame must be {expected} bytes, got {got}")]
    Length {
        profile: FrameProfile,
        expected: usize,
        got: usize,
    },
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// Scale, round, and clamp into `[0, width max]`. NaN packs as zero.
fn quantize(value: f64, scale: f64, width: Width) -> u16 {
    let v = (value * scale).round();
    if v.is_nan() {
        return 0;
    }
    v.clamp(0.0, width.max()) as u16
}

fn put(buf: &mut Vec<u8>, value: u16, width: Width) {
    match width {
        // quantize already clamped to 255
        Width::U8 => buf.push(value as u8),
        Width::U16 => buf.extend_from_slice(&value.to_be_bytes()),
    }
}

fn take(bytes: &[u8], pos: &mut usize, width: Width) -> u16 {
    let v = match width {
        Width::U8 => u16::from(bytes[*pos]),
        Width::U16 => u16::from_be_bytes([bytes[*pos], bytes[*pos + 1]]),
    };
    *pos += width.bytes();
    v
}

impl Codec {
    pub fn new(profile: FrameProfile, ec_unit: EcUnit) -> Self {
        Self { profile, ec_unit }
    }

    /// Pack one tick's record. Pure: the same record always yields the
    /// same bytes.
    pub fn encode(&self, record: &LogRecord) -> TelemetryFrame {
        let layout = self.profile.layout();
        let s = &record.sensors;
        let mut buf = Vec::with_capacity(self.profile.frame_len());

        put(&mut buf, quantize(s.ec, self.ec_unit.scale(), layout.ec), layout.ec);
        put(&mut buf, quantize(s.ph, 10.0, Width::U8), Width::U8);
        put(&mut buf, quantize(s.temperature, 10.0, Width::U16), Width::U16);
        put(&mut buf, quantize(s.o2, 10.0, layout.o2), layout.o2);
        put(&mut buf, quantize(s.water_level, 10.0, Width::U8), Width::U8);
        put(
            &mut buf,
            quantize(record.transpiration as f64, 1.0, Width::U8),
            Width::U8,
        );

        let mut flags = 0u8;
        if record.decision.ph_pump_on {
            flags |= FLAG_PH_PUMP;
        }
        if record.decision.ec_pump_on {
            flags |= FLAG_EC_PUMP;
        }
        if s.circulation {
            flags |= FLAG_CIRCULATION;
        }
        buf.push(flags);

        TelemetryFrame {
            profile: self.profile,
            bytes: buf,
        }
    }

    /// Gateway-side counterpart of [`Codec::encode`].
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, FrameError> {
        let expected = self.profile.frame_len();
        if bytes.len() != expected {
            return Err(FrameError::Length {
                profile: self.profile,
                expected,
                got: bytes.len(),
            });
        }

        let layout = self.profile.layout();
        let mut pos = 0;
        let ec = f64::from(take(bytes, &mut pos, layout.ec)) / self.ec_unit.scale();
        let ph = f64::from(take(bytes, &mut pos, Width::U8)) / 10.0;
        let temperature = f64::from(take(bytes, &mut pos, Width::U16)) / 10.0;
        let o2 = f64::from(take(bytes, &mut pos, layout.o2)) / 10.0;
        let water_level = f64::from(take(bytes, &mut pos, Width::U8)) / 10.0;
        let transpiration = take(bytes, &mut pos, Width::U8) as u8;
        let flags = bytes[pos];

        Ok(DecodedFrame {
            ec,
            ph,
            temperature,
            o2,
            water_level,
            transpiration,
            ph_pump_on: flags & FLAG_PH_PUMP != 0,
            ec_pump_on: flags & FLAG_EC_PUMP != 0,
            circulation: flags & FLAG_CIRCULATION != 0,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
