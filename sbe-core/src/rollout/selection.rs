//! Candidate enumeration and deterministic device ordering for phases.
//!
//! Per-phase targets resolve at phase start against the still-uncovered
//! candidate set. Ordering prefers healthier, more recently alive devices
//! (`health score desc, last_seen desc, device_id asc`) so early phases get
//! the most observable canaries. The final phase absorbs every remaining
//! candidate regardless of its declared target.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use rusqlite::Connection;

use sbe_common::ids::DeviceId;
use sbe_common::rollout::{EligibilityPolicy, Rollout};
use sbe_common::types::RegistrationStatus;
use sbe_store::{desired, devices, groups, rollouts, telemetry};

/// Candidate devices not yet covered by any phase of this rollout, in
/// selection order.
pub(crate) fn remaining_candidates(
    conn: &Connection,
    rollout: &Rollout,
) -> rusqlite::Result<Vec<DeviceId>> {
    let pool: Vec<DeviceId> = match rollout.eligibility {
        EligibilityPolicy::AllBundleUsers => desired::devices_with_desired_bundle(conn, rollout.bundle_id)?,
        EligibilityPolicy::GroupMembers => match rollout.target_group_id {
            Some(group_id) => groups::members(conn, group_id)?,
            None => Vec::new(),
        },
    };

    let covered: BTreeSet<DeviceId> = rollouts::assignments_for_rollout(conn, rollout.rollout_id)?
        .into_iter()
        .map(|a| a.device_id)
        .collect();

    // Tenant-scoped, approved, and not already assigned in this rollout.
    let mut eligible = Vec::new();
    for device_id in pool {
        if covered.contains(&device_id) {
            continue;
        }
        let Some(device) = devices::get(conn, device_id)? else { continue };
        if device.tenant_id != rollout.tenant_id
            || device.registration_status != RegistrationStatus::Approved
        {
            continue;
        }
        eligible.push(device);
    }

    let scores = telemetry::latest_totals(conn)?;
    order_candidates(&mut eligible, &scores);
    Ok(eligible.into_iter().map(|d| d.device_id).collect())
}

/// Sort by `(health score desc, last_seen desc, device_id asc)`. Devices
/// without a score sort after every scored device.
fn order_candidates(
    candidates: &mut [sbe_common::types::Device],
    scores: &HashMap<DeviceId, f64>,
) {
    candidates.sort_by(|a, b| {
        let score_a = scores.get(&a.device_id).copied().unwrap_or(-1.0);
        let score_b = scores.get(&b.device_id).copied().unwrap_or(-1.0);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_seen_at.cmp(&a.last_seen_at))
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
}
