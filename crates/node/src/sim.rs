//! Stateful hydroponic sensor simulator for local development.
//!
//! Models a nutrient reservoir the way the real probes see it:
//! - Temporal coherence via random walk with mean reversion
//! - Per-scenario drift (acid creep, nutrient depletion, evaporation)
//! - Per-reading probe noise
//! - Closed-loop dosing response (pH/EC rise while a dosing pump runs)
//! - Occasional circulation pump dropouts
//! - Transpiration pulse counts per interval

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Uniform sample in `[lo, hi)`.
fn uniform(lo: f64, hi: f64) -> f64 {
    lo + (hi - lo) * fastrand::f64()
}

/// Round to two decimals, the resolution the probes report at.
fn cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// pH and EC hover inside the default limits. Low noise.
    Stable,
    /// pH settles below `ph_min`, so the pH dosing pump keeps cycling.
    Acidic,
    /// EC and water level fall steadily as the plants feed and drink.
    Drifting,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "acidic" => Self::Acidic,
            "drifting" => Self::Drifting,
            _ => Self::Stable, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Acidic => write!(f, "acidic"),
            Self::Drifting => write!(f, "drifting"),
        }
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One continuously varying quantity.
struct Channel {
    value: f64,
    center: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    drift: f64,
    noise_sigma: f64,
    lo: f64,
    hi: f64,
}

impl Channel {
    fn new(center: f64, walk_sigma: f64, noise_sigma: f64, lo: f64, hi: f64) -> Self {
        Self {
            value: center,
            center,
            walk_sigma,
            mean_reversion: 0.05,
            drift: 0.0,
            noise_sigma,
            lo,
            hi,
        }
    }

    fn drifting(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }

    /// Evolve the underlying value by one interval, adding `push` on top.
    fn step(&mut self, push: f64) {
        let pull = self.mean_reversion * (self.center - self.value);
        let walk = gaussian(0.0, self.walk_sigma);
        self.value = (self.value + pull + walk + self.drift + push).clamp(self.lo, self.hi);
    }

    /// Instantaneous probe reading.
    fn read(&self) -> f64 {
        cents((self.value + gaussian(0.0, self.noise_sigma)).clamp(self.lo, self.hi))
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// Dosing thresholds the node reports alongside its readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub ph_min: f64,
    pub ph_max: f64,
    pub ec_min: f64,
    pub ec_max: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ph_min: 6.9,
            ph_max: 7.1,
            ec_min: 0.9,
            ec_max: 1.1,
        }
    }
}

impl Thresholds {
    /// A fresh set of limits, as a grower retuning the reservoir would pick.
    pub fn random() -> Self {
        Self {
            ph_min: cents(uniform(6.6, 7.0)),
            ph_max: cents(uniform(7.1, 7.3)),
            ec_min: cents(uniform(0.7, 0.9)),
            ec_max: cents(uniform(1.1, 1.3)),
        }
    }
}

/// One interval's worth of readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub ph: f64,
    pub ec: f64,
    pub water_level: f64,
    pub circulation: bool,
    pub temperature: f64,
    pub o2: f64,
    pub ph_pump: bool,
    pub ec_pump: bool,
    pub transpiration: u32,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing realistic reservoir readings.
pub struct HydroSim {
    ph: Channel,
    ec: Channel,
    water_level: Channel,
    temperature: Channel,
    o2: Channel,

    /// Chance per interval that circulation reads as stopped.
    dropout_prob: f32,
    max_transpiration: u32,

    // Dosing response per interval while a pump runs
    ph_dose: f64,
    ec_dose: f64,
    ph_dosing: bool,
    ec_dosing: bool,
}

impl HydroSim {
    pub fn new(scenario: Scenario) -> Self {
        let (ph_center, ph_drift, ec_drift, level_drift, dropout_prob) = match scenario {
            Scenario::Stable => (7.0, 0.0, 0.0, 0.0, 0.01_f32),
            Scenario::Acidic => (6.6, -0.01, 0.0, 0.0, 0.02),
            Scenario::Drifting => (6.95, 0.0, -0.015, -0.03, 0.05),
        };

        Self {
            ph: Channel::new(ph_center, 0.02, 0.01, 4.0, 9.0).drifting(ph_drift),
            ec: Channel::new(1.0, 0.01, 0.005, 0.0, 3.0).drifting(ec_drift),
            water_level: Channel::new(6.25, 0.03, 0.02, 0.0, 10.0).drifting(level_drift),
            temperature: Channel::new(95.5, 0.4, 0.1, 60.0, 110.0),
            o2: Channel::new(6.5, 0.1, 0.05, 0.0, 12.0),
            dropout_prob,
            max_transpiration: 20,
            ph_dose: 0.06,
            ec_dose: 0.04,
            ph_dosing: false,
            ec_dosing: false,
        }
    }

    /// Inform the simulator which dosing pumps are currently running.
    pub fn set_dosing(&mut self, ph: bool, ec: bool) {
        self.ph_dosing = ph;
        self.ec_dosing = ec;
    }

    /// Advance one interval and read every probe. Pump states in the
    /// sample come from `limits` applied to the fresh pH and EC readings;
    /// the simulator also starts dosing accordingly.
    pub fn sample(&mut self, limits: &Thresholds) -> Sample {
        // -- Evolve the reservoir -----------------------------------------
        self.ph.step(if self.ph_dosing { self.ph_dose } else { 0.0 });
        self.ec.step(if self.ec_dosing { self.ec_dose } else { 0.0 });
        self.water_level.step(0.0);
        self.temperature.step(0.0);
        self.o2.step(0.0);

        // -- Read the probes ----------------------------------------------
        let ph = self.ph.read();
        let ec = self.ec.read();
        let ph_pump = ph < limits.ph_min;
        let ec_pump = ec < limits.ec_min;
        self.set_dosing(ph_pump, ec_pump);

        Sample {
            ph,
            ec,
            water_level: self.water_level.read(),
            circulation: fastrand::f32() >= self.dropout_prob,
            temperature: self.temperature.read(),
            o2: self.o2.read(),
            ph_pump,
            ec_pump,
            transpiration: fastrand::u32(0..=self.max_transpiration),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
