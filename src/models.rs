//! Domain types exchanged between the control-loop phases.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::equipment::EquipmentId;
use crate::error::DecisionError;

/// Immutable sensor snapshot, one per cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub light_level: f32,
    pub co2_ppm: f32,
    pub soil_moisture_pct: f32,
    pub air_humidity_pct: f32,
    pub temperature_c: f32,
    pub captured_at: DateTime<Utc>,
}

impl SensorSnapshot {
    /// A snapshot with any NaN/infinite reading is invalid and must not be
    /// sent to the decision service.
    pub fn all_finite(&self) -> bool {
        [
            self.light_level,
            self.co2_ppm,
            self.soil_moisture_pct,
            self.air_humidity_pct,
            self.temperature_c,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// One validated equipment change requested by the decision service.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionAction {
    pub equipment: EquipmentId,
    pub desired_state: bool,
    pub reason: String,
}

/// Validated decision-service response. Zero actions is a valid batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionBatch {
    pub analysis: String,
    pub actions: Vec<DecisionAction>,
    pub warnings: Vec<String>,
}

/// An actuator change the tracker actually committed this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub equipment: EquipmentId,
    pub state: bool,
    pub reason: String,
}

/// Per-cycle outcome of the tracker's policy pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedChanges {
    pub changed: Vec<AppliedChange>,
    pub deferred: Vec<EquipmentId>,
    pub rejected: Vec<EquipmentId>,
}

/// Overall result of one control cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Success,
    SensorReadFailure,
    DecisionFailure(DecisionError),
    /// At least one actuator or status write failed; successful writes stand.
    PartialFailure,
    /// Shutdown observed mid-cycle; the cycle was cut short before Applying.
    Aborted,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Success => f.write_str("success"),
            CycleOutcome::SensorReadFailure => f.write_str("sensor read failure"),
            CycleOutcome::DecisionFailure(e) => write!(f, "decision failure: {e}"),
            CycleOutcome::PartialFailure => f.write_str("partial failure"),
            CycleOutcome::Aborted => f.write_str("aborted"),
        }
    }
}

/// Transient record of one cycle, logged at cycle end and discarded.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub snapshot: Option<SensorSnapshot>,
    pub outcome: CycleOutcome,
    pub applied: AppliedChanges,
    pub duration: Duration,
}
