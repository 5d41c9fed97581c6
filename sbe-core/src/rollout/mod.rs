//! Phased rollout engine.
//!
//! A rollout moves a bundle's devices to a target version in ordered phases.
//! The engine owns every state transition:
//!
//! ```text
//! Pending ── start ──▶ InProgress ─── pause ──▶ Paused
//!                          │            ◀── resume
//!                          ├── all phases Completed ──▶ Completed
//!                          ├── rollback (manual or auto) ──▶ RolledBack
//!                          └── fatal error ──▶ Failed
//! ```
//!
//! All transitions for one rollout are serialized through its advisory lock
//! and applied inside one transaction; different rollouts proceed
//! independently. The periodic tick ([`RolloutEngine::tick`]) drives
//! advancement, the failure gate, the min-healthy dwell, retries, and
//! auto-rollback.

mod selection;
mod tick;

pub use tick::TickOutcome;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::info;

use sbe_common::clock::Clock;
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::{GroupId, PhaseId, RolloutId, TenantId};
use sbe_common::rollout::{
    EligibilityPolicy, PhaseStatus, PhaseTarget, Rollout, RolloutDeviceAssignment, RolloutPhase,
    RolloutStatus,
};
use sbe_common::ids::BundleId;
use sbe_store::{Store, bundles, groups, rollouts};

use crate::events::EventBus;
use crate::storage_err;

#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Dwell applied to phases that do not declare their own.
    pub default_min_healthy: StdDuration,
    /// Failure-rate breach point applied when creation omits one.
    pub default_failure_threshold: f64,
    /// Retry budget per device assignment.
    pub max_retries: u32,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            default_min_healthy: StdDuration::from_secs(5 * 60),
            default_failure_threshold: 0.05,
            max_retries: 3,
        }
    }
}

/// One phase as declared at creation.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: String,
    pub target: PhaseTarget,
    pub min_healthy_duration_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CreateRolloutRequest {
    pub tenant_id: TenantId,
    pub bundle_id: BundleId,
    pub target_version: semver::Version,
    pub previous_version: Option<semver::Version>,
    pub name: String,
    pub description: Option<String>,
    pub phases: Vec<PhaseSpec>,
    pub failure_threshold: Option<f64>,
    pub eligibility: EligibilityPolicy,
    pub target_group_id: Option<GroupId>,
    pub created_by: String,
}

/// Immutable read of a rollout with its children.
#[derive(Debug, Clone)]
pub struct RolloutSnapshot {
    pub rollout: Rollout,
    pub phases: Vec<RolloutPhase>,
    pub assignments: Vec<RolloutDeviceAssignment>,
}

#[derive(Clone)]
pub struct RolloutEngine {
    pub(crate) store: Store,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventBus,
    pub(crate) config: RolloutConfig,
}

impl RolloutEngine {
    pub fn new(store: Store, clock: Arc<dyn Clock>, events: EventBus, config: RolloutConfig) -> Self {
        Self { store, clock, events, config }
    }

    /// Validate and insert a rollout in `Pending` with all phases `Pending`.
    pub fn create(&self, req: CreateRolloutRequest) -> Result<RolloutSnapshot, CoreError> {
        let now = self.clock.now();

        if req.phases.is_empty() {
            return Err(invalid_spec("a rollout needs at least one phase"));
        }
        for phase in &req.phases {
            match phase.target {
                PhaseTarget::Percentage(p) if !(p > 0.0 && p <= 100.0) => {
                    return Err(invalid_spec(format!("phase percentage {p} outside (0, 100]")));
                }
                PhaseTarget::DeviceCount(0) => {
                    return Err(invalid_spec("phase device count must be at least 1"));
                }
                _ => {}
            }
        }
        let failure_threshold =
            req.failure_threshold.unwrap_or(self.config.default_failure_threshold);
        if !(0.0..=1.0).contains(&failure_threshold) {
            return Err(invalid_spec(format!("failure threshold {failure_threshold} outside [0, 1]")));
        }
        if req.eligibility == EligibilityPolicy::GroupMembers && req.target_group_id.is_none() {
            return Err(invalid_spec("group_members eligibility requires a target group"));
        }

        let rollout = Rollout {
            rollout_id: RolloutId::generate(),
            tenant_id: req.tenant_id,
            bundle_id: req.bundle_id,
            target_version: req.target_version.clone(),
            previous_version: req.previous_version.clone(),
            name: req.name.clone(),
            description: req.description.clone(),
            failure_threshold,
            status: RolloutStatus::Pending,
            current_phase_number: 0,
            eligibility: req.eligibility,
            target_group_id: req.target_group_id,
            created_at: now,
            started_at: None,
            completed_at: None,
            created_by: req.created_by.clone(),
        };

        let default_dwell = self.config.default_min_healthy.as_secs();
        let phases: Vec<RolloutPhase> = req
            .phases
            .iter()
            .enumerate()
            .map(|(idx, spec)| RolloutPhase {
                phase_id: PhaseId::generate(),
                rollout_id: rollout.rollout_id,
                phase_number: idx as u32 + 1,
                name: spec.name.clone(),
                target: spec.target,
                status: PhaseStatus::Pending,
                started_at: None,
                completed_at: None,
                success_count: 0,
                failure_count: 0,
                min_healthy_duration_secs: Some(
                    spec.min_healthy_duration_secs.unwrap_or(default_dwell),
                ),
                healthy_since: None,
            })
            .collect();

        let result = self.store.with_tx(|tx| {
            let Some(bundle) = bundles::get(tx, req.bundle_id)? else {
                return Ok(Err(CoreError::bundle_not_found(req.bundle_id)));
            };
            if bundle.tenant_id != req.tenant_id {
                return Ok(Err(CoreError::bundle_not_found(req.bundle_id)));
            }
            if bundles::get_version(tx, req.bundle_id, &req.target_version)?.is_none() {
                return Ok(Err(CoreError::new(
                    ErrorCode::InvalidVersion,
                    format!("bundle {} has no version {}", req.bundle_id, req.target_version),
                )));
            }
            if let Some(previous) = &req.previous_version {
                if bundles::get_version(tx, req.bundle_id, previous)?.is_none() {
                    return Ok(Err(CoreError::new(
                        ErrorCode::InvalidVersion,
                        format!("bundle {} has no version {previous}", req.bundle_id),
                    )));
                }
            }
            if let Some(group_id) = req.target_group_id {
                if groups::get(tx, group_id)?.filter(|g| g.tenant_id == req.tenant_id).is_none() {
                    return Ok(Err(CoreError::new(
                        ErrorCode::GroupNotFound,
                        format!("group {group_id} not found"),
                    )));
                }
            }
            if let Some(active) = rollouts::active_for_bundle(tx, req.bundle_id)? {
                return Ok(Err(CoreError::new(
                    ErrorCode::ActiveRolloutExists,
                    format!("rollout {active} is already active for this bundle"),
                )));
            }

            rollouts::insert_rollout(tx, &rollout)?;
            for phase in &phases {
                rollouts::insert_phase(tx, phase)?;
            }
            Ok(Ok(()))
        });

        match result {
            Ok(Ok(())) => {
                info!(rollout = %rollout.rollout_id, phases = phases.len(), "rollout created");
                Ok(RolloutSnapshot { rollout, phases, assignments: Vec::new() })
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Load a rollout with phases and assignments.
    pub fn snapshot(&self, rollout_id: RolloutId) -> Result<RolloutSnapshot, CoreError> {
        self.store
            .with_conn(|c| {
                let Some(rollout) = rollouts::get_rollout(c, rollout_id)? else {
                    return Ok(None);
                };
                let phases = rollouts::phases_for_rollout(c, rollout_id)?;
                let assignments = rollouts::assignments_for_rollout(c, rollout_id)?;
                Ok(Some(RolloutSnapshot { rollout, phases, assignments }))
            })
            .map_err(storage_err)?
            .ok_or_else(|| CoreError::rollout_not_found(rollout_id))
    }

    pub fn list(&self, tenant_id: TenantId) -> Result<Vec<Rollout>, CoreError> {
        self.store.with_conn(|c| rollouts::list_in_tenant(c, tenant_id)).map_err(storage_err)
    }

    /// `Pending -> InProgress`: stamps `started_at`, enters phase 1, and
    /// assigns its devices.
    pub fn start(&self, rollout_id: RolloutId) -> Result<RolloutSnapshot, CoreError> {
        let lock = self.store.rollout_locks().for_rollout(rollout_id);
        let _held = lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        let result = self.store.with_tx(|tx| {
            let Some(mut rollout) = rollouts::get_rollout(tx, rollout_id)? else {
                return Ok(Err(CoreError::rollout_not_found(rollout_id)));
            };
            if rollout.status != RolloutStatus::Pending {
                return Ok(Err(concurrent(format!(
                    "rollout {rollout_id} cannot start from {:?}",
                    rollout.status
                ))));
            }
            rollout.status = RolloutStatus::InProgress;
            rollout.started_at = Some(now);
            let mut phases = rollouts::phases_for_rollout(tx, rollout_id)?;
            tick::enter_next_phase(tx, &mut rollout, &mut phases, now)?;
            rollouts::update_rollout(tx, &rollout)?;
            Ok(Ok(()))
        });
        self.finish_transition(rollout_id, result, "started")
    }

    /// `InProgress -> Paused`: the tick skips paused rollouts; in-flight
    /// device reconciliations keep reporting.
    pub fn pause(&self, rollout_id: RolloutId) -> Result<RolloutSnapshot, CoreError> {
        self.transition(rollout_id, "paused", |rollout| match rollout.status {
            RolloutStatus::InProgress => {
                rollout.status = RolloutStatus::Paused;
                Ok(())
            }
            status => Err(concurrent(format!("cannot pause a {status:?} rollout"))),
        })
    }

    /// `Paused -> InProgress`: the next tick re-evaluates immediately,
    /// including any failure gate that would have fired during the pause.
    pub fn resume(&self, rollout_id: RolloutId) -> Result<RolloutSnapshot, CoreError> {
        self.transition(rollout_id, "resumed", |rollout| match rollout.status {
            RolloutStatus::Paused => {
                rollout.status = RolloutStatus::InProgress;
                Ok(())
            }
            status => Err(concurrent(format!("cannot resume a {status:?} rollout"))),
        })
    }

    /// Manual rollback from `InProgress | Paused`. Requires a previous
    /// version to return to.
    pub fn rollback(&self, rollout_id: RolloutId) -> Result<RolloutSnapshot, CoreError> {
        let lock = self.store.rollout_locks().for_rollout(rollout_id);
        let _held = lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        let result = self.store.with_tx(|tx| {
            let Some(mut rollout) = rollouts::get_rollout(tx, rollout_id)? else {
                return Ok(Err(CoreError::rollout_not_found(rollout_id)));
            };
            if !rollout.status.is_active() {
                return Ok(Err(concurrent(format!(
                    "cannot roll back a {:?} rollout",
                    rollout.status
                ))));
            }
            if rollout.previous_version.is_none() {
                return Ok(Err(CoreError::new(
                    ErrorCode::NoPreviousVersion,
                    "rollout has no previous version to roll back to",
                )));
            }
            tick::roll_back(tx, &mut rollout, now)?;
            Ok(Ok(()))
        });
        self.finish_transition(rollout_id, result, "rolled back")
    }

    /// Admin override: complete the current phase without waiting for the
    /// min-healthy dwell and enter the next one.
    pub fn advance(&self, rollout_id: RolloutId) -> Result<RolloutSnapshot, CoreError> {
        let lock = self.store.rollout_locks().for_rollout(rollout_id);
        let _held = lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();

        let result = self.store.with_tx(|tx| {
            let Some(mut rollout) = rollouts::get_rollout(tx, rollout_id)? else {
                return Ok(Err(CoreError::rollout_not_found(rollout_id)));
            };
            if rollout.status != RolloutStatus::InProgress {
                return Ok(Err(concurrent(format!(
                    "cannot advance a {:?} rollout",
                    rollout.status
                ))));
            }
            let mut phases = rollouts::phases_for_rollout(tx, rollout_id)?;
            if let Some(current) = phases
                .iter_mut()
                .find(|p| p.phase_number == rollout.current_phase_number)
            {
                current.status = PhaseStatus::Completed;
                current.completed_at = Some(now);
                rollouts::update_phase(tx, current)?;
            }
            tick::enter_next_phase(tx, &mut rollout, &mut phases, now)?;
            rollouts::update_rollout(tx, &rollout)?;
            Ok(Ok(()))
        });
        self.finish_transition(rollout_id, result, "advanced")
    }

    fn transition(
        &self,
        rollout_id: RolloutId,
        verb: &'static str,
        apply: impl FnOnce(&mut Rollout) -> Result<(), CoreError>,
    ) -> Result<RolloutSnapshot, CoreError> {
        let lock = self.store.rollout_locks().for_rollout(rollout_id);
        let _held = lock.lock().unwrap_or_else(|e| e.into_inner());

        let result = self.store.with_tx(|tx| {
            let Some(mut rollout) = rollouts::get_rollout(tx, rollout_id)? else {
                return Ok(Err(CoreError::rollout_not_found(rollout_id)));
            };
            if let Err(e) = apply(&mut rollout) {
                return Ok(Err(e));
            }
            rollouts::update_rollout(tx, &rollout)?;
            Ok(Ok(()))
        });
        self.finish_transition(rollout_id, result, verb)
    }

    fn finish_transition(
        &self,
        rollout_id: RolloutId,
        result: Result<Result<(), CoreError>, sbe_store::StoreError>,
        verb: &'static str,
    ) -> Result<RolloutSnapshot, CoreError> {
        match result {
            Ok(Ok(())) => {
                info!(rollout = %rollout_id, "rollout {verb}");
                self.events.emit(
                    &format!("signalbeam.devices.events.rollout_{}", verb.replace(' ', "_")),
                    self.clock.now(),
                    &serde_json::json!({ "rolloutId": rollout_id }),
                );
                self.snapshot(rollout_id)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(storage_err(e)),
        }
    }
}

fn invalid_spec(message: impl Into<String>) -> CoreError {
    CoreError::new(ErrorCode::InvalidRolloutSpec, message)
}

fn concurrent(message: impl Into<String>) -> CoreError {
    CoreError::new(ErrorCode::ConcurrentModification, message)
}
