//! Dosing pump relays. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation logs state changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::logbook::PumpDecision;

/// Consumer of each tick's pump decisions.
pub trait Actuator: Send {
    fn apply(&mut self, decision: PumpDecision);

    /// Fail-safe: switch every pump off.
    fn all_off(&mut self) {
        self.apply(PumpDecision::default());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    Ph,
    Ec,
}

impl Pump {
    fn name(self) -> &'static str {
        match self {
            Self::Ph => "ph",
            Self::Ec => "ec",
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO pump board (production: rppal on Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct PumpBoard {
    ph: OutputPin,
    ec: OutputPin,
    on: PumpDecision,
    active_low: bool, // the dosing relay board switches on LOW
}

#[cfg(feature = "gpio")]
impl PumpBoard {
    pub fn new(ph_gpio: u8, ec_gpio: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut board = Self {
            ph: gpio.get(ph_gpio)?.into_output(),
            ec: gpio.get(ec_gpio)?.into_output(),
            on: PumpDecision::default(),
            active_low,
        };
        // Fail-safe: ensure "OFF" at startup
        board.drive(Pump::Ph, false);
        board.drive(Pump::Ec, false);
        Ok(board)
    }

    fn drive(&mut self, pump: Pump, on: bool) {
        let active_low = self.active_low;
        let pin = match pump {
            Pump::Ph => &mut self.ph,
            Pump::Ec => &mut self.ec,
        };
        if on != active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

// ---------------------------------------------------------------------------
// Mock pump board (development: no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct PumpBoard {
    pub(crate) on: PumpDecision,
}

#[cfg(not(feature = "gpio"))]
impl PumpBoard {
    pub fn new(ph_gpio: u8, ec_gpio: u8, _active_low: bool) -> Result<Self> {
        info!(ph_gpio, ec_gpio, "[mock-gpio] pump board initialised (no hardware)");
        Ok(Self {
            on: PumpDecision::default(),
        })
    }

    fn drive(&mut self, _pump: Pump, _on: bool) {}
}

impl PumpBoard {
    fn set(&mut self, pump: Pump, on: bool) {
        let current = match pump {
            Pump::Ph => &mut self.on.ph_pump_on,
            Pump::Ec => &mut self.on.ec_pump_on,
        };
        if *current == on {
            return;
        }
        *current = on;
        self.drive(pump, on);
        info!(pump = pump.name(), state = if on { "ON" } else { "OFF" }, "pump switched");
    }
}

impl Actuator for PumpBoard {
    fn apply(&mut self, decision: PumpDecision) {
        self.set(Pump::Ph, decision.ph_pump_on);
        self.set(Pump::Ec, decision.ec_pump_on);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn new_board_is_off() {
        let board = PumpBoard::new(5, 6, true).unwrap();
        assert_eq!(board.on, PumpDecision::default());
    }

    #[test]
    fn apply_follows_decision() {
        let mut board = PumpBoard::new(5, 6, true).unwrap();
        board.apply(PumpDecision {
            ph_pump_on: true,
            ec_pump_on: false,
        });
        assert!(board.on.ph_pump_on);
        assert!(!board.on.ec_pump_on);

        board.apply(PumpDecision {
            ph_pump_on: false,
            ec_pump_on: true,
        });
        assert!(!board.on.ph_pump_on);
        assert!(board.on.ec_pump_on);
    }

    #[test]
    fn all_off_resets_everything() {
        let mut board = PumpBoard::new(5, 6, true).unwrap();
        board.apply(PumpDecision {
            ph_pump_on: true,
            ec_pump_on: true,
        });
        board.all_off();
        assert_eq!(board.on, PumpDecision::default());
    }
}
