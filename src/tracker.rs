//! Equipment state tracker: the single writer of actuator commands.
//!
//! Holds the authoritative last-commanded state per actuator and applies
//! decision batches under two policies before anything reaches the fieldbus:
//! mutual-exclusion interlocks (configuration-defined pairs) and a minimum
//! dwell time per actuator to avoid relay chatter. Policy outcomes are normal
//! control decisions, not errors.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::equipment::EquipmentId;
use crate::models::{AppliedChange, AppliedChanges, DecisionBatch};

/// A mutual-exclusion pair. When both sides would end up on, the `yields`
/// actuator loses: its on-request is rejected, and turning the `wins` side on
/// forces the yielder off.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InterlockRule {
    pub yields: EquipmentId,
    pub wins: EquipmentId,
}

/// Heating and ventilation-driven cooling must never run together.
pub fn default_interlocks() -> Vec<InterlockRule> {
    vec![InterlockRule {
        yields: EquipmentId::Heater,
        wins: EquipmentId::Ventilation,
    }]
}

/// Last-commanded state of one actuator. `last_changed_at = None` means never
/// commanded; the first change is always dwell-exempt.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EquipmentState {
    pub current: bool,
    pub last_changed_at: Option<DateTime<Utc>>,
}

pub struct EquipmentTracker {
    states: [EquipmentState; 8],
    dwell: Duration,
    interlocks: Vec<InterlockRule>,
}

impl EquipmentTracker {
    pub fn new(dwell: std::time::Duration, interlocks: Vec<InterlockRule>) -> Self {
        Self {
            states: [EquipmentState::default(); 8],
            dwell: Duration::from_std(dwell).unwrap_or(Duration::MAX),
            interlocks,
        }
    }

    pub fn state(&self, id: EquipmentId) -> EquipmentState {
        self.states[id.index()]
    }

    /// Apply a validated decision batch in order. Returns what actually
    /// changed, what was deferred by dwell, and what was rejected by an
    /// interlock; only `changed` entries may be written to the fieldbus.
    pub fn apply(&mut self, batch: &DecisionBatch, now: DateTime<Utc>) -> AppliedChanges {
        let mut applied = AppliedChanges::default();

        for action in &batch.actions {
            let id = action.equipment;
            if self.state(id).current == action.desired_state {
                debug!(equipment = %id, state = action.desired_state, "already in desired state");
                continue;
            }

            if action.desired_state {
                // Losing side of an interlock: reject when the winner is on
                // now or will be on once this batch is applied.
                if let Some(rule) = self.rule_where_yields(id) {
                    if self.effective_on(rule.wins, batch) || self.state(rule.wins).current {
                        warn!(
                            equipment = %id,
                            conflicts_with = %rule.wins,
                            "interlock conflict, request rejected"
                        );
                        applied.rejected.push(id);
                        continue;
                    }
                }

                // Winning side: force the yielder off first, or defer if its
                // dwell still holds it.
                if let Some(rule) = self.rule_where_wins(id) {
                    if self.state(rule.yields).current {
                        if self.dwell_blocks(rule.yields, now) {
                            debug!(equipment = %id, blocked_by = %rule.yields, "deferred behind interlock dwell");
                            applied.deferred.push(id);
                            continue;
                        }
                        self.commit(rule.yields, false, now);
                        applied.changed.push(AppliedChange {
                            equipment: rule.yields,
                            state: false,
                            reason: format!("interlock: {} takes precedence", id.wire_name()),
                        });
                    }
                }
            }

            if self.dwell_blocks(id, now) {
                debug!(equipment = %id, "change deferred, dwell time not elapsed");
                applied.deferred.push(id);
                continue;
            }

            self.commit(id, action.desired_state, now);
            applied.changed.push(AppliedChange {
                equipment: id,
                state: action.desired_state,
                reason: action.reason.clone(),
            });
        }

        applied
    }

    fn rule_where_yields(&self, id: EquipmentId) -> Option<InterlockRule> {
        self.interlocks.iter().find(|r| r.yields == id).cloned()
    }

    fn rule_where_wins(&self, id: EquipmentId) -> Option<InterlockRule> {
        self.interlocks.iter().find(|r| r.wins == id).cloned()
    }

    /// State `id` will hold after the batch: the last entry for it in the
    /// batch, falling back to its current state.
    fn effective_on(&self, id: EquipmentId, batch: &DecisionBatch) -> bool {
        batch
            .actions
            .iter()
            .rev()
            .find(|a| a.equipment == id)
            .map(|a| a.desired_state)
            .unwrap_or(self.state(id).current)
    }

    fn dwell_blocks(&self, id: EquipmentId, now: DateTime<Utc>) -> bool {
        match self.state(id).last_changed_at {
            Some(changed_at) => now - changed_at < self.dwell,
            None => false,
        }
    }

    fn commit(&mut self, id: EquipmentId, state: bool, now: DateTime<Utc>) {
        let entry = &mut self.states[id.index()];
        entry.current = state;
        entry.last_changed_at = Some(now);
    }
}
