//! Dosing thresholds. Written field-by-field by the ingest listener and in
//! bulk by the radio downlink; read once per tick by the scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKey {
    PhMin,
    PhMax,
    EcMin,
    EcMax,
}

impl LimitKey {
    pub const ALL: [LimitKey; 4] = [
        LimitKey::PhMin,
        LimitKey::PhMax,
        LimitKey::EcMin,
        LimitKey::EcMax,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PhMin => "ph_min",
            Self::PhMax => "ph_max",
            Self::EcMin => "ec_min",
            Self::EcMax => "ec_max",
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub ph_min: f64,
    pub ph_max: f64,
    pub ec_min: f64,
    pub ec_max: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            ph_min: 6.9,
            ph_max: 7.1,
            ec_min: 0.9,
            ec_max: 1.1,
        }
    }
}

impl Limits {
    pub fn get(&self, key: LimitKey) -> f64 {
        match key {
            LimitKey::PhMin => self.ph_min,
            LimitKey::PhMax => self.ph_max,
            LimitKey::EcMin => self.ec_min,
            LimitKey::EcMax => self.ec_max,
        }
    }

    fn slot(&mut self, key: LimitKey) -> &mut f64 {
        match key {
            LimitKey::PhMin => &mut self.ph_min,
            LimitKey::PhMax => &mut self.ph_max,
            LimitKey::EcMin => &mut self.ec_min,
            LimitKey::EcMax => &mut self.ec_max,
        }
    }
}

#[derive(Clone)]
pub struct LimitStore {
    inner: Arc<RwLock<Limits>>,
}

impl Default for LimitStore {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl LimitStore {
    pub fn new(initial: Limits) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self, key: LimitKey) -> f64 {
        self.inner.read().await.get(key)
    }

    pub async fn set(&self, key: LimitKey, value: f64) {
        *self.inner.write().await.slot(key) = value;
    }

    pub async fn snapshot(&self) -> Limits {
        *self.inner.read().await
    }

    /// Apply several updates under one write lock; keys not listed keep
    /// their current value.
    pub async fn apply(&self, updates: &[(LimitKey, f64)]) {
        let mut limits = self.inner.write().await;
        for &(key, value) in updates {
            *limits.slot(key) = value;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
