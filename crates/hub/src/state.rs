//! Current sensor/actuator readings shared between the ingest listener
//! (writer) and the sampling scheduler (reader + transpiration drain).

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Field catalogue
// ---------------------------------------------------------------------------

/// Declared kind of a sensor field; inbound values are coerced to this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Float,
    Bool,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorField {
    Ph,
    Ec,
    WaterLevel,
    Circulation,
    PhPump,
    EcPump,
    Temperature,
    O2,
    Transpiration,
}

impl SensorField {
    pub const ALL: [SensorField; 9] = [
        SensorField::Ph,
        SensorField::Ec,
        SensorField::WaterLevel,
        SensorField::Circulation,
        SensorField::PhPump,
        SensorField::EcPump,
        SensorField::Temperature,
        SensorField::O2,
        SensorField::Transpiration,
    ];

    /// Look up a field by its wire name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ph => "ph",
            Self::Ec => "ec",
            Self::WaterLevel => "water_level",
            Self::Circulation => "circulation",
            Self::PhPump => "ph_pump",
            Self::EcPump => "ec_pump",
            Self::Temperature => "temperature",
            Self::O2 => "o2",
            Self::Transpiration => "transpiration",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Self::Circulation | Self::PhPump | Self::EcPump => FieldKind::Bool,
            Self::Transpiration => FieldKind::Count,
            _ => FieldKind::Float,
        }
    }
}

impl fmt::Display for SensorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value already coerced to a field's declared kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Bool(bool),
    Count(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Count(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of every sensor field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub ph: f64,
    pub ec: f64,
    pub water_level: f64,
    pub circulation: bool,
    pub ph_pump: bool,
    pub ec_pump: bool,
    pub temperature: f64,
    pub o2: f64,
    pub transpiration: i64,
}

impl Default for SensorSnapshot {
    /// Startup values until the sensor unit reports. Temperature and O2
    /// read zero meaning "not reported yet".
    fn default() -> Self {
        Self {
            ph: 7.0,
            ec: 1.0,
            water_level: 75.0,
            circulation: true,
            ph_pump: false,
            ec_pump: false,
            temperature: 0.0,
            o2: 0.0,
            transpiration: 0,
        }
    }
}

impl SensorSnapshot {
    pub fn get(&self, field: SensorField) -> FieldValue {
        match field {
            SensorField::Ph => FieldValue::Float(self.ph),
            SensorField::Ec => FieldValue::Float(self.ec),
            SensorField::WaterLevel => FieldValue::Float(self.water_level),
            SensorField::Circulation => FieldValue::Bool(self.circulation),
            SensorField::PhPump => FieldValue::Bool(self.ph_pump),
            SensorField::EcPump => FieldValue::Bool(self.ec_pump),
            SensorField::Temperature => FieldValue::Float(self.temperature),
            SensorField::O2 => FieldValue::Float(self.o2),
            SensorField::Transpiration => FieldValue::Count(self.transpiration),
        }
    }

    /// Store `value` into `field`. Returns `false` (and leaves the snapshot
    /// untouched) when the value's kind does not match the field's kind.
    fn assign(&mut self, field: SensorField, value: FieldValue) -> bool {
        match (field, value) {
            (SensorField::Ph, FieldValue::Float(v)) => self.ph = v,
            (SensorField::Ec, FieldValue::Float(v)) => self.ec = v,
            (SensorField::WaterLevel, FieldValue::Float(v)) => self.water_level = v,
            (SensorField::Temperature, FieldValue::Float(v)) => self.temperature = v,
            (SensorField::O2, FieldValue::Float(v)) => self.o2 = v,
            (SensorField::Circulation, FieldValue::Bool(v)) => self.circulation = v,
            (SensorField::PhPump, FieldValue::Bool(v)) => self.ph_pump = v,
            (SensorField::EcPump, FieldValue::Bool(v)) => self.ec_pump = v,
            (SensorField::Transpiration, FieldValue::Count(v)) => self.transpiration = v,
            _ => return false,
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe handle to the current sensor readings. Cloning shares the
/// same underlying state.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<RwLock<SensorSnapshot>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(SensorSnapshot::default())
    }
}

impl StateStore {
    pub fn new(initial: SensorSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self, field: SensorField) -> FieldValue {
        self.inner.read().await.get(field)
    }

    /// Atomically overwrite one field. A kind mismatch is ignored and
    /// reported as `false`.
    pub async fn set(&self, field: SensorField, value: FieldValue) -> bool {
        self.inner.write().await.assign(field, value)
    }

    pub async fn snapshot(&self) -> SensorSnapshot {
        self.inner.read().await.clone()
    }

    /// Read the transpiration counter and reset it to zero in one step.
    pub async fn drain(&self) -> i64 {
        std::mem::take(&mut self.inner.write().await.transpiration)
    }

    /// Snapshot every field and drain transpiration under a single lock.
    /// The returned snapshot's `transpiration` is exactly the drained count.
    pub async fn take_tick(&self) -> SensorSnapshot {
        let mut st = self.inner.write().await;
        let snap = st.clone();
        st.transpiration = 0;
        snap
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    // -- SensorField --------------------------------------------------------

    #[test]
    fn from_name_known_fields() {
        for f in SensorField::ALL {
            assert_eq!(SensorField::from_name(f.name()), Some(f));
        }
    }

    #[test]
    fn from_name_unknown_field() {
        assert_eq!(SensorField::from_name("humidity"), None);
        assert_eq!(SensorField::from_name("PH"), None);
        assert_eq!(SensorField::from_name(""), None);
    }

    #[test]
    fn limit_keys_are_not_sensor_fields() {
        assert_eq!(SensorField::from_name("ph_min"), None);
    }

    #[test]
    fn declared_kinds() {
        assert_eq!(SensorField::Ph.kind(), FieldKind::Float);
        assert_eq!(SensorField::Circulation.kind(), FieldKind::Bool);
        assert_eq!(SensorField::EcPump.kind(), FieldKind::Bool);
        assert_eq!(SensorField::Transpiration.kind(), FieldKind::Count);
    }

    // -- get / set ----------------------------------------------------------

    #[tokio::test]
    async fn defaults_match_startup_values() {
        let store = StateStore::default();
        assert_eq!(store.get(SensorField::Ph).await, FieldValue::Float(7.0));
        assert_eq!(store.get(SensorField::Ec).await, FieldValue::Float(1.0));
        assert_eq!(store.get(SensorField::Circulation).await, FieldValue::Bool(true));
        assert_eq!(store.get(SensorField::Transpiration).await, FieldValue::Count(0));
    }

    #[tokio::test]
    async fn set_then_get() {
        let store = StateStore::default();
        assert!(store.set(SensorField::Ph, FieldValue::Float(6.5)).await);
        assert!(store.set(SensorField::PhPump, FieldValue::Bool(true)).await);
        assert_eq!(store.get(SensorField::Ph).await, FieldValue::Float(6.5));
        assert_eq!(store.get(SensorField::PhPump).await, FieldValue::Bool(true));
    }

    #[tokio::test]
    async fn set_kind_mismatch_is_ignored() {
        let store = StateStore::default();
        assert!(!store.set(SensorField::Ph, FieldValue::Bool(true)).await);
        assert_eq!(store.get(SensorField::Ph).await, FieldValue::Float(7.0));
    }

    // -- drain --------------------------------------------------------------

    #[tokio::test]
    async fn drain_returns_previous_and_resets() {
        let store = StateStore::default();
        store.set(SensorField::Transpiration, FieldValue::Count(12)).await;
        assert_eq!(store.drain().await, 12);
        assert_eq!(store.drain().await, 0);
    }

    #[tokio::test]
    async fn take_tick_snapshot_carries_drained_count() {
        let store = StateStore::default();
        store.set(SensorField::Transpiration, FieldValue::Count(4)).await;
        store.set(SensorField::Ec, FieldValue::Float(0.8)).await;

        let snap = store.take_tick().await;
        assert_eq!(snap.transpiration, 4);
        assert_eq!(snap.ec, 0.8);
        assert_eq!(store.snapshot().await.transpiration, 0);
    }

    #[tokio::test]
    async fn overwrite_not_accumulate() {
        let store = StateStore::default();
        store.set(SensorField::Transpiration, FieldValue::Count(5)).await;
        store.set(SensorField::Transpiration, FieldValue::Count(8)).await;
        assert_eq!(store.drain().await, 8);
    }

    // -- concurrency --------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshots_are_never_torn() {
        // Writer sets ph=i then ec=i, so any consistent snapshot satisfies
        // ec <= ph <= ec + 1.
        let store = StateStore::new(SensorSnapshot {
            ph: 0.0,
            ec: 0.0,
            ..SensorSnapshot::default()
        });

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 1..=2000 {
                    store.set(SensorField::Ph, FieldValue::Float(i as f64)).await;
                    store.set(SensorField::Ec, FieldValue::Float(i as f64)).await;
                }
            })
        };

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    let s = store.snapshot().await;
                    assert!(s.ec <= s.ph, "ec {} ahead of ph {}", s.ec, s.ph);
                    assert!(s.ph <= s.ec + 1.0, "ph {} too far ahead of ec {}", s.ph, s.ec);
                    tokio::task::yield_now().await;
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drain_never_loses_or_double_counts_a_set() {
        // Each set writes a distinct value. Every value is either drained
        // exactly once, overwritten by a later set before any drain, or is
        // still in the store at the end.
        let store = StateStore::default();
        let n: i64 = 3000;

        let setter = {
            let store = store.clone();
            tokio::spawn(async move {
                for v in 1..=n {
                    store.set(SensorField::Transpiration, FieldValue::Count(v)).await;
                    if v % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let drainer = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut drained = Vec::new();
                for _ in 0..3000 {
                    let v = store.drain().await;
                    if v != 0 {
                        drained.push(v);
                    }
                    tokio::task::yield_now().await;
                }
                drained
            })
        };

        setter.await.unwrap();
        let mut drained = drainer.await.unwrap();
        let remaining = store.drain().await;
        if remaining != 0 {
            drained.push(remaining);
        }

        let unique: HashSet<i64> = drained.iter().copied().collect();
        assert_eq!(unique.len(), drained.len(), "a value was counted twice");
        assert!(drained.windows(2).all(|w| w[0] < w[1]), "drains out of order");
        assert_eq!(drained.last(), Some(&n), "final set was lost");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn take_tick_never_loses_or_double_counts_a_set() {
        let store = StateStore::default();
        let n: i64 = 3000;

        let setter = {
            let store = store.clone();
            tokio::spawn(async move {
                for v in 1..=n {
                    store.set(SensorField::Transpiration, FieldValue::Count(v)).await;
                    if v % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let ticker = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut taken = Vec::new();
                for _ in 0..3000 {
                    let v = store.take_tick().await.transpiration;
                    if v != 0 {
                        taken.push(v);
                    }
                    tokio::task::yield_now().await;
                }
                taken
            })
        };

        setter.await.unwrap();
        let mut taken = ticker.await.unwrap();
        let remaining = store.take_tick().await.transpiration;
        if remaining != 0 {
            taken.push(remaining);
        }

        let unique: HashSet<i64> = taken.iter().copied().collect();
        assert_eq!(unique.len(), taken.len(), "a value was counted twice");
        assert!(taken.windows(2).all(|w| w[0] < w[1]), "ticks out of order");
        assert_eq!(taken.last(), Some(&n), "final set was lost");
        assert_eq!(store.get(SensorField::Transpiration).await, FieldValue::Count(0));
    }
}
