//! Control-loop orchestrator: the cycle state machine.
//!
//! Runs `Idle → Reading → Deciding → Applying → Reporting → Idle` on a fixed
//! cadence, indefinitely. Any dependency failure is caught at the phase
//! boundary and folded into the cycle outcome; Reporting always runs, so
//! every cycle produces an observable status update. Failure policy is
//! fail-safe hold: when sensors or the decision service fail, actuators keep
//! their last commanded state and the next cycle re-evaluates from scratch.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::decision::DecisionService;
use crate::error::FieldbusError;
use crate::fieldbus::{
    Fieldbus, ANALYSIS_BLOCKS, MD_AIR_HUMIDITY, MD_CO2, MD_LIGHT, MD_SOIL_MOISTURE,
    MD_TEMPERATURE, WARNING_BLOCKS,
};
use crate::models::{AppliedChanges, CycleOutcome, CycleRecord, DecisionBatch, SensorSnapshot};
use crate::status;
use crate::tracker::EquipmentTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CyclePhase {
    Idle,
    Reading,
    Deciding,
    Applying,
    Reporting,
}

pub struct ControlLoop<F: Fieldbus, D: DecisionService> {
    fieldbus: F,
    decisions: D,
    tracker: EquipmentTracker,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    recent_warnings: Vec<String>,
    phase: CyclePhase,
}

impl<F: Fieldbus, D: DecisionService> ControlLoop<F, D> {
    pub fn new(
        fieldbus: F,
        decisions: D,
        tracker: EquipmentTracker,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            fieldbus,
            decisions,
            tracker,
            interval,
            shutdown,
            recent_warnings: Vec::new(),
            phase: CyclePhase::Idle,
        }
    }

    /// Run cycles until shutdown. Cycles never overlap: an overrunning cycle
    /// is followed immediately by the next one, otherwise the remainder of
    /// the interval is waited out. There is no catch-up burst.
    pub async fn run(&mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "control loop started"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let cycle_start = Instant::now();
            let record = self.run_cycle().await;
            self.log_record(&record);
            if record.outcome == CycleOutcome::Aborted || *self.shutdown.borrow() {
                break;
            }

            let next_start = cycle_start + self.interval;
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = sleep_until(next_start) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("control loop stopped");
    }

    /// One full pass of the cycle state machine. Shutdown is honored at the
    /// Reading and Deciding suspension points; Applying and Reporting always
    /// run to completion so no actuator write is left half-applied and the
    /// cycle is still reported.
    async fn run_cycle(&mut self) -> CycleRecord {
        let started = std::time::Instant::now();
        let mut shutdown = self.shutdown.clone();
        let mut outcome = CycleOutcome::Success;
        let mut batch: Option<DecisionBatch> = None;

        self.set_phase(CyclePhase::Reading);
        let snapshot = tokio::select! {
            result = read_snapshot(&mut self.fieldbus) => match result {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, "sensor acquisition failed, holding equipment state");
                    outcome = CycleOutcome::SensorReadFailure;
                    None
                }
            },
            _ = shutdown.changed() => {
                outcome = CycleOutcome::Aborted;
                None
            }
        };

        if let Some(snapshot) = &snapshot {
            self.set_phase(CyclePhase::Deciding);
            tokio::select! {
                result = self.decisions.request_decision(snapshot, &self.recent_warnings) => {
                    match result {
                        Ok(b) => batch = Some(b),
                        Err(e) => {
                            warn!(error = %e, "decision request failed, holding equipment state");
                            outcome = CycleOutcome::DecisionFailure(e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    outcome = CycleOutcome::Aborted;
                }
            }
        }

        let mut applied = AppliedChanges::default();
        if let Some(batch) = &batch {
            self.set_phase(CyclePhase::Applying);
            applied = self.tracker.apply(batch, Utc::now());

            // Each write stands alone: one failed actuator must not block
            // the rest, and committed writes are never rolled back.
            let mut failed_writes = 0usize;
            for change in &applied.changed {
                match self
                    .fieldbus
                    .write_bit(change.equipment.output(), change.state)
                    .await
                {
                    Ok(()) => info!(
                        equipment = %change.equipment,
                        state = change.state,
                        reason = %change.reason,
                        "actuator updated"
                    ),
                    Err(e) => {
                        error!(equipment = %change.equipment, error = %e, "actuator write failed");
                        failed_writes += 1;
                    }
                }
            }
            outcome = if failed_writes > 0 {
                CycleOutcome::PartialFailure
            } else {
                CycleOutcome::Success
            };
        }

        self.set_phase(CyclePhase::Reporting);
        let report_ok = self.report(batch.as_ref(), &outcome).await;
        if !report_ok && outcome == CycleOutcome::Success {
            outcome = CycleOutcome::PartialFailure;
        }

        if let Some(batch) = batch {
            // Warnings feed the next cycle's decision context.
            self.recent_warnings = batch
                .warnings
                .into_iter()
                .take(WARNING_BLOCKS.len())
                .collect();
        }

        self.set_phase(CyclePhase::Idle);
        CycleRecord {
            snapshot,
            outcome,
            applied,
            duration: started.elapsed(),
        }
    }

    /// Write analysis and warning text to their fixed-width blocks. Returns
    /// false when any status write failed; never aborts the cycle.
    async fn report(&mut self, batch: Option<&DecisionBatch>, outcome: &CycleOutcome) -> bool {
        let analysis = match batch {
            Some(b) if !b.analysis.is_empty() => b.analysis.clone(),
            Some(_) => "No analysis provided".to_string(),
            None => format!("Cycle failed: {outcome}"),
        };

        let mut ok = true;
        let segments = status::analysis_segments(&analysis);
        for (block, segment) in ANALYSIS_BLOCKS.iter().zip(segments.iter()) {
            if let Err(e) = self.fieldbus.write_text(*block, segment).await {
                warn!(db = block.db_number, error = %e, "analysis write failed");
                ok = false;
            }
        }

        // Unused warning blocks are cleared so stale warnings never linger
        // on the HMI.
        let warnings: &[String] = batch.map(|b| b.warnings.as_slice()).unwrap_or(&[]);
        for (i, block) in WARNING_BLOCKS.iter().enumerate() {
            let line = warnings
                .get(i)
                .map(|w| status::warning_line(i, w))
                .unwrap_or_default();
            if let Err(e) = self.fieldbus.write_text(*block, &line).await {
                warn!(db = block.db_number, error = %e, "warning write failed");
                ok = false;
            }
            if let Some(w) = warnings.get(i) {
                warn!(warning = %w, "greenhouse warning");
            }
        }
        ok
    }

    fn set_phase(&mut self, phase: CyclePhase) {
        debug!(from = ?self.phase, to = ?phase, "cycle phase transition");
        self.phase = phase;
    }

    fn log_record(&self, record: &CycleRecord) {
        info!(
            outcome = %record.outcome,
            duration_ms = record.duration.as_millis() as u64,
            changed = record.applied.changed.len(),
            deferred = record.applied.deferred.len(),
            rejected = record.applied.rejected.len(),
            "cycle complete"
        );
    }
}

/// Acquire one sensor snapshot. Fails on the first unreadable register or on
/// any non-finite value; a partial snapshot is never used.
async fn read_snapshot<F: Fieldbus>(fieldbus: &mut F) -> Result<SensorSnapshot, FieldbusError> {
    let snapshot = SensorSnapshot {
        light_level: fieldbus.read_float(MD_LIGHT).await?,
        co2_ppm: fieldbus.read_float(MD_CO2).await?,
        soil_moisture_pct: fieldbus.read_float(MD_SOIL_MOISTURE).await?,
        air_humidity_pct: fieldbus.read_float(MD_AIR_HUMIDITY).await?,
        temperature_c: fieldbus.read_float(MD_TEMPERATURE).await?,
        captured_at: Utc::now(),
    };
    if !snapshot.all_finite() {
        return Err(FieldbusError::Read {
            addr: "MD0..MD8".into(),
            detail: "non-finite sensor value".into(),
        });
    }
    debug!(
        light = snapshot.light_level,
        co2 = snapshot.co2_ppm,
        soil = snapshot.soil_moisture_pct,
        humidity = snapshot.air_humidity_pct,
        temperature = snapshot.temperature_c,
        "sensor snapshot acquired"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::equipment::{EquipmentId, OutputBit};
    use crate::error::DecisionError;
    use crate::fieldbus::TextBlock;
    use crate::models::DecisionAction;
    use crate::tracker::default_interlocks;

    struct MockFieldbus {
        floats: HashMap<u32, f32>,
        fail_reads: bool,
        fail_bit_writes: bool,
        bit_writes: Vec<(OutputBit, bool)>,
        texts: Vec<(u16, String)>,
    }

    impl MockFieldbus {
        fn with_nominal_sensors() -> Self {
            let floats = HashMap::from([
                (MD_LIGHT, 856.0),
                (MD_CO2, 950.0),
                (MD_SOIL_MOISTURE, 80.0),
                (MD_AIR_HUMIDITY, 55.0),
                (MD_TEMPERATURE, 24.0),
            ]);
            Self {
                floats,
                fail_reads: false,
                fail_bit_writes: false,
                bit_writes: Vec::new(),
                texts: Vec::new(),
            }
        }
    }

    impl Fieldbus for MockFieldbus {
        async fn read_float(&mut self, md_address: u32) -> Result<f32, FieldbusError> {
            if self.fail_reads {
                return Err(FieldbusError::Read {
                    addr: format!("MD{md_address}"),
                    detail: "link down".into(),
                });
            }
            Ok(self.floats[&md_address])
        }

        async fn write_bit(
            &mut self,
            output: OutputBit,
            value: bool,
        ) -> Result<(), FieldbusError> {
            if self.fail_bit_writes {
                return Err(FieldbusError::Write {
                    addr: output.to_string(),
                    detail: "link down".into(),
                });
            }
            self.bit_writes.push((output, value));
            Ok(())
        }

        async fn write_text(
            &mut self,
            block: TextBlock,
            text: &str,
        ) -> Result<(), FieldbusError> {
            self.texts.push((block.db_number, text.to_string()));
            Ok(())
        }
    }

    struct MockDecision {
        response: Mutex<Result<DecisionBatch, DecisionError>>,
        calls: AtomicUsize,
    }

    impl MockDecision {
        fn returning(response: Result<DecisionBatch, DecisionError>) -> Self {
            Self {
                response: Mutex::new(response),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl DecisionService for MockDecision {
        async fn request_decision(
            &self,
            _snapshot: &SensorSnapshot,
            _recent_warnings: &[String],
        ) -> Result<DecisionBatch, DecisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.lock().unwrap().clone()
        }
    }

    fn control_loop(
        fieldbus: MockFieldbus,
        decisions: MockDecision,
    ) -> ControlLoop<MockFieldbus, MockDecision> {
        let tracker = EquipmentTracker::new(Duration::from_secs(60), default_interlocks());
        let (_tx, rx) = watch::channel(false);
        // Leak the sender so the receiver stays live for the test's duration.
        std::mem::forget(_tx);
        ControlLoop::new(fieldbus, decisions, tracker, Duration::from_secs(60), rx)
    }

    fn humidifier_batch() -> DecisionBatch {
        DecisionBatch {
            analysis: "Humidity 55% is below the optimal 60-80% band.".into(),
            actions: vec![DecisionAction {
                equipment: EquipmentId::Humidifier,
                desired_state: true,
                reason: "humidity low".into(),
            }],
            warnings: vec!["humidity trending down".into()],
        }
    }

    #[tokio::test]
    async fn nominal_cycle_turns_humidifier_on() {
        let mut control = control_loop(
            MockFieldbus::with_nominal_sensors(),
            MockDecision::returning(Ok(humidifier_batch())),
        );

        let record = control.run_cycle().await;

        assert_eq!(record.outcome, CycleOutcome::Success);
        assert_eq!(
            control.fieldbus.bit_writes,
            vec![(EquipmentId::Humidifier.output(), true)]
        );
        assert!(control.tracker.state(EquipmentId::Humidifier).current);
        for id in EquipmentId::ALL {
            if id != EquipmentId::Humidifier {
                assert!(!control.tracker.state(id).current, "{id} changed unexpectedly");
            }
        }
    }

    #[tokio::test]
    async fn decision_timeout_holds_all_equipment_state() {
        let mut control = control_loop(
            MockFieldbus::with_nominal_sensors(),
            MockDecision::returning(Err(DecisionError::Timeout)),
        );

        let record = control.run_cycle().await;

        assert_eq!(
            record.outcome,
            CycleOutcome::DecisionFailure(DecisionError::Timeout)
        );
        assert!(control.fieldbus.bit_writes.is_empty());
        for id in EquipmentId::ALL {
            assert_eq!(control.tracker.state(id).current, false);
        }
    }

    #[tokio::test]
    async fn sensor_failure_skips_the_decision_service() {
        let mut fieldbus = MockFieldbus::with_nominal_sensors();
        fieldbus.fail_reads = true;
        let mut control = control_loop(
            fieldbus,
            MockDecision::returning(Ok(humidifier_batch())),
        );

        let record = control.run_cycle().await;

        assert_eq!(record.outcome, CycleOutcome::SensorReadFailure);
        assert_eq!(control.decisions.calls.load(Ordering::SeqCst), 0);
        assert!(control.fieldbus.bit_writes.is_empty());
    }

    #[tokio::test]
    async fn non_finite_reading_is_a_sensor_failure() {
        let mut fieldbus = MockFieldbus::with_nominal_sensors();
        fieldbus.floats.insert(MD_TEMPERATURE, f32::NAN);
        let mut control = control_loop(
            fieldbus,
            MockDecision::returning(Ok(humidifier_batch())),
        );

        let record = control.run_cycle().await;
        assert_eq!(record.outcome, CycleOutcome::SensorReadFailure);
        assert_eq!(control.decisions.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn actuator_write_failure_degrades_to_partial() {
        let mut fieldbus = MockFieldbus::with_nominal_sensors();
        fieldbus.fail_bit_writes = true;
        let mut control = control_loop(
            fieldbus,
            MockDecision::returning(Ok(humidifier_batch())),
        );

        let record = control.run_cycle().await;

        assert_eq!(record.outcome, CycleOutcome::PartialFailure);
        // The tracker keeps the commanded value; the next cycle's
        // re-evaluation converges the physical output.
        assert!(control.tracker.state(EquipmentId::Humidifier).current);
    }

    #[tokio::test]
    async fn conflicting_batch_rejects_heater_and_applies_ventilation() {
        let batch = DecisionBatch {
            analysis: "Temperature drifting".into(),
            actions: vec![
                DecisionAction {
                    equipment: EquipmentId::Heater,
                    desired_state: true,
                    reason: "warm up".into(),
                },
                DecisionAction {
                    equipment: EquipmentId::Ventilation,
                    desired_state: true,
                    reason: "vent CO2".into(),
                },
            ],
            warnings: vec![],
        };
        let mut control = control_loop(
            MockFieldbus::with_nominal_sensors(),
            MockDecision::returning(Ok(batch)),
        );

        let record = control.run_cycle().await;

        assert_eq!(record.outcome, CycleOutcome::Success);
        assert_eq!(record.applied.rejected, vec![EquipmentId::Heater]);
        assert_eq!(
            control.fieldbus.bit_writes,
            vec![(EquipmentId::Ventilation.output(), true)]
        );
    }

    #[tokio::test]
    async fn every_cycle_reports_status_text() {
        // Even a fully failed cycle writes all 8 status blocks.
        let mut fieldbus = MockFieldbus::with_nominal_sensors();
        fieldbus.fail_reads = true;
        let mut control = control_loop(
            fieldbus,
            MockDecision::returning(Ok(humidifier_batch())),
        );

        control.run_cycle().await;

        let dbs: Vec<u16> = control.fieldbus.texts.iter().map(|(db, _)| *db).collect();
        assert_eq!(dbs, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(control.fieldbus.texts[0].1.contains("sensor read failure"));
        // Warning blocks are cleared when there are no warnings.
        assert_eq!(control.fieldbus.texts[3].1, "");
    }

    #[tokio::test]
    async fn warnings_are_written_numbered_and_fed_to_next_cycle() {
        let mut control = control_loop(
            MockFieldbus::with_nominal_sensors(),
            MockDecision::returning(Ok(humidifier_batch())),
        );

        control.run_cycle().await;

        let warning_db4 = control
            .fieldbus
            .texts
            .iter()
            .find(|(db, _)| *db == 4)
            .unwrap();
        assert_eq!(warning_db4.1, "1.UYARI: humidity trending down");
        assert_eq!(
            control.recent_warnings,
            vec!["humidity trending down".to_string()]
        );
    }

    #[tokio::test]
    async fn reapplying_the_same_decision_is_idempotent() {
        let mut control = control_loop(
            MockFieldbus::with_nominal_sensors(),
            MockDecision::returning(Ok(humidifier_batch())),
        );

        let first = control.run_cycle().await;
        assert_eq!(first.applied.changed.len(), 1);

        let second = control.run_cycle().await;
        assert_eq!(second.outcome, CycleOutcome::Success);
        assert!(second.applied.changed.is_empty());
        assert_eq!(control.fieldbus.bit_writes.len(), 1);
    }

    struct HangingDecision;

    impl DecisionService for HangingDecision {
        async fn request_decision(
            &self,
            _snapshot: &SensorSnapshot,
            _recent_warnings: &[String],
        ) -> Result<DecisionBatch, DecisionError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn shutdown_during_deciding_aborts_but_still_reports() {
        let tracker = EquipmentTracker::new(Duration::from_secs(60), default_interlocks());
        let (tx, rx) = watch::channel(false);
        let mut control = ControlLoop::new(
            MockFieldbus::with_nominal_sensors(),
            HangingDecision,
            tracker,
            Duration::from_secs(60),
            rx,
        );
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let record = control.run_cycle().await;

        assert_eq!(record.outcome, CycleOutcome::Aborted);
        // The cycle was cut short before Applying: no actuator writes.
        assert!(control.fieldbus.bit_writes.is_empty());
        // Reporting still runs: all 8 status blocks written, the analysis
        // carries the failure text, unused warning blocks are cleared.
        let dbs: Vec<u16> = control.fieldbus.texts.iter().map(|(db, _)| *db).collect();
        assert_eq!(dbs, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(control.fieldbus.texts[0].1.contains("aborted"));
        assert_eq!(control.fieldbus.texts[3].1, "");
    }

    #[tokio::test]
    async fn run_exits_immediately_when_already_shut_down() {
        let tracker = EquipmentTracker::new(Duration::from_secs(60), default_interlocks());
        let (tx, rx) = watch::channel(true);
        let mut control = ControlLoop::new(
            MockFieldbus::with_nominal_sensors(),
            MockDecision::returning(Ok(humidifier_batch())),
            tracker,
            Duration::from_secs(60),
            rx,
        );

        control.run().await;
        drop(tx);

        assert_eq!(control.decisions.calls.load(Ordering::SeqCst), 0);
        assert!(control.fieldbus.bit_writes.is_empty());
    }
}
