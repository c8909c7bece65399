//! Queue hygiene: held pilots that can never recover, held pilots worth another try, and
//! pilots stuck in one state for too long.
use crate::factory::config::HeldPolicy;
use crate::submit::{PilotRecord, PilotState};

/// Hold code the batch system uses for failures reported by the remote site.
const HOLD_CODE_GRID: i64 = 2;

/// Remote failures retrying cannot fix (missing proxy, authentication, unknown queue, ...).
const UNRECOVERABLE_SUBCODES: [i64; 24] = [
    0, 2, 4, 5, 7, 8, 9, 10, 14, 17, 22, 27, 28, 31, 37, 47, 48, 72, 76, 81, 86, 87, 121, 122,
];

pub fn is_unrecoverable(pilot: &PilotRecord, policy: &HeldPolicy) -> bool {
    if pilot.state != PilotState::Held {
        return false;
    }
    if pilot.num_system_holds > policy.max_release_count {
        return true;
    }
    pilot.hold_code == Some(HOLD_CODE_GRID)
        && pilot
            .hold_subcode
            .is_some_and(|code| UNRECOVERABLE_SUBCODES.contains(&code))
}

/// A recoverable pilot is released after it was held `n * min_release_time`, `n` being the
/// number of times it was held.
pub fn should_release(pilot: &PilotRecord, policy: &HeldPolicy, now: i64) -> bool {
    if pilot.state != PilotState::Held || is_unrecoverable(pilot, policy) {
        return false;
    }
    let wait = pilot.num_system_holds.max(1) * policy.min_release_time.as_secs() as i64;
    now - pilot.entered_status_time >= wait
}

fn is_stale(pilot: &PilotRecord, policy: &HeldPolicy, now: i64) -> bool {
    let age = now - pilot.entered_status_time;
    match pilot.state {
        PilotState::Idle => age > policy.stale_idle.as_secs() as i64,
        PilotState::Running => age > policy.stale_running.as_secs() as i64,
        _ => false,
    }
}

/// What sanitizing one Entry's queue does.
#[derive(Debug, Default, PartialEq)]
pub struct SanitizePlan {
    pub remove_unrecoverable: Vec<PilotRecord>,
    pub remove_stale: Vec<PilotRecord>,
    pub release: Vec<PilotRecord>,
}

impl SanitizePlan {
    pub fn is_empty(&self) -> bool {
        self.remove_unrecoverable.is_empty()
            && self.remove_stale.is_empty()
            && self.release.is_empty()
    }

    /// Every pilot the plan removes.
    pub fn removed(&self) -> impl Iterator<Item = &PilotRecord> {
        self.remove_unrecoverable.iter().chain(&self.remove_stale)
    }
}

pub fn plan_sanitize(pilots: &[PilotRecord], policy: &HeldPolicy, now: i64) -> SanitizePlan {
    let mut plan = SanitizePlan::default();
    for pilot in pilots {
        if is_unrecoverable(pilot, policy) {
            plan.remove_unrecoverable.push(pilot.clone());
        } else if should_release(pilot, policy, now) {
            plan.release.push(pilot.clone());
        } else if is_stale(pilot, policy, now) {
            plan.remove_stale.push(pilot.clone());
        }
    }
    plan
}

/// The `count` held pilots that were held first.
pub fn oldest_held<'a>(
    pilots: impl IntoIterator<Item = &'a PilotRecord>,
    count: usize,
) -> Vec<PilotRecord> {
    let mut held: Vec<&PilotRecord> = pilots
        .into_iter()
        .filter(|pilot| pilot.state == PilotState::Held)
        .collect();
    held.sort_by_key(|pilot| (pilot.entered_status_time, pilot.cluster, pilot.proc));
    held.into_iter().take(count).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::{is_unrecoverable, oldest_held, plan_sanitize, should_release};
    use crate::factory::config::HeldPolicy;
    use crate::submit::{PilotRecord, PilotState};
    use crate::tests::utils::pilot;

    const NOW: i64 = 1_000_000_000;

    fn held(cluster: u64, code: i64, subcode: i64, holds: i64, since: i64) -> PilotRecord {
        let mut record = pilot("ce1", "fe.main", "cred1", PilotState::Held);
        record.cluster = cluster;
        record.hold_code = Some(code);
        record.hold_subcode = Some(subcode);
        record.num_system_holds = holds;
        record.entered_status_time = NOW - since;
        record
    }

    #[test]
    fn classify_holds() {
        let policy = HeldPolicy::default();
        assert!(is_unrecoverable(&held(1, 2, 17, 1, 0), &policy));
        assert!(!is_unrecoverable(&held(1, 2, 3, 1, 0), &policy));
        assert!(!is_unrecoverable(&held(1, 13, 17, 1, 0), &policy));
        assert!(is_unrecoverable(&held(1, 13, 1, 11, 0), &policy));

        assert!(should_release(&held(1, 13, 1, 2, 600), &policy, NOW));
        assert!(!should_release(&held(1, 13, 1, 2, 599), &policy, NOW));
        assert!(should_release(&held(1, 13, 1, 0, 300), &policy, NOW));
        assert!(!should_release(&held(1, 2, 17, 1, 10_000), &policy, NOW));
    }

    #[test]
    fn sanitize_plan() {
        let policy = HeldPolicy::default();
        let mut stale_idle = pilot("ce1", "fe.main", "cred1", PilotState::Idle);
        stale_idle.entered_status_time = NOW - 8 * 24 * 3600;
        let mut fresh_running = pilot("ce1", "fe.main", "cred1", PilotState::Running);
        fresh_running.entered_status_time = NOW - 30 * 24 * 3600;
        let pilots = vec![
            held(1, 2, 4, 1, 10),
            held(2, 13, 1, 1, 400),
            held(3, 13, 1, 1, 100),
            stale_idle.clone(),
            fresh_running,
        ];
        let plan = plan_sanitize(&pilots, &policy, NOW);
        assert_eq!(plan.remove_unrecoverable.len(), 1);
        assert_eq!(plan.remove_unrecoverable[0].cluster, 1);
        assert_eq!(plan.release.len(), 1);
        assert_eq!(plan.release[0].cluster, 2);
        assert_eq!(plan.remove_stale, vec![stale_idle]);
        assert_eq!(plan.removed().count(), 2);
    }

    #[test]
    fn oldest_held_first() {
        let pilots = [held(5, 13, 1, 1, 10), held(6, 13, 1, 1, 300), held(7, 13, 1, 1, 200)];
        let clusters: Vec<u64> = oldest_held(&pilots, 2).iter().map(|p| p.cluster).collect();
        assert_eq!(clusters, vec![6, 7]);
    }
}
