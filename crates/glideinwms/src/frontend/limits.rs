//! How many pilots a group asks for on one Entry, under the limits of the Entry, the group,
//! the Frontend and the whole pool.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Limits reached during a computation, by name, as `count=<n>, limit=<m>`.
pub type LimitsTriggered = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EntryLimits {
    /// Pilots of the group on one Entry, in any state.
    pub max_running: u64,
    /// Largest idle request sent to one Entry.
    pub max_idle: u64,
    /// Idle pilots of the group on one Entry.
    pub max_vms_idle: u64,
    pub curb_vms_idle: u64,
}

impl Default for EntryLimits {
    fn default() -> Self {
        Self {
            max_running: 10000,
            max_idle: 100,
            max_vms_idle: 100,
            curb_vms_idle: 5,
        }
    }
}

/// Limits on the pilots of a group, a Frontend or the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScopeLimits {
    pub max_glideins: u64,
    pub curb_glideins: u64,
    pub max_vms_idle: u64,
    pub curb_vms_idle: u64,
}

impl Default for ScopeLimits {
    fn default() -> Self {
        Self {
            max_glideins: 100000,
            curb_glideins: 90000,
            max_vms_idle: 1000,
            curb_vms_idle: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GroupLimits {
    pub entry: EntryLimits,
    pub total: ScopeLimits,
    /// Idle pilots kept in reserve for jobs that have been waiting for a while.
    pub reserve_idle: u64,
    pub fraction_running: f64,
    pub idle_ramp_divisor: u64,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self {
            entry: EntryLimits::default(),
            total: ScopeLimits::default(),
            reserve_idle: 5,
            fraction_running: 1.15,
            idle_ramp_divisor: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrontendLimits {
    pub frontend: ScopeLimits,
    pub global: ScopeLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeCounts {
    pub total: u64,
    pub idle: u64,
}

/// Pilot counts the limits are checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PilotCounts {
    pub entry: ScopeCounts,
    pub group: ScopeCounts,
    pub frontend: ScopeCounts,
    pub global: ScopeCounts,
}

struct Check {
    name: &'static str,
    count: u64,
    limit: u64,
}

impl Check {
    fn reached(&self) -> bool {
        self.count >= self.limit
    }

    fn describe(&self) -> String {
        format!("count={}, limit={}", self.count, self.limit)
    }
}

fn max_checks(counts: &PilotCounts, group: &GroupLimits, frontend: &FrontendLimits) -> [Check; 8] {
    [
        Check {
            name: "TotalGlideinsPerEntry",
            count: counts.entry.total,
            limit: group.entry.max_running,
        },
        Check {
            name: "IdleGlideinsPerEntry",
            count: counts.entry.idle,
            limit: group.entry.max_vms_idle,
        },
        Check {
            name: "TotalGlideinsPerGroup",
            count: counts.group.total,
            limit: group.total.max_glideins,
        },
        Check {
            name: "IdleGlideinsPerGroup",
            count: counts.group.idle,
            limit: group.total.max_vms_idle,
        },
        Check {
            name: "TotalGlideinsPerFrontend",
            count: counts.frontend.total,
            limit: frontend.frontend.max_glideins,
        },
        Check {
            name: "IdleGlideinsPerFrontend",
            count: counts.frontend.idle,
            limit: frontend.frontend.max_vms_idle,
        },
        Check {
            name: "TotalGlideinsGlobal",
            count: counts.global.total,
            limit: frontend.global.max_glideins,
        },
        Check {
            name: "IdleGlideinsGlobal",
            count: counts.global.idle,
            limit: frontend.global.max_vms_idle,
        },
    ]
}

fn curb_checks(counts: &PilotCounts, group: &GroupLimits, frontend: &FrontendLimits) -> [Check; 7] {
    [
        Check {
            name: "CurbIdleGlideinsPerEntry",
            count: counts.entry.idle,
            limit: group.entry.curb_vms_idle,
        },
        Check {
            name: "CurbTotalGlideinsPerGroup",
            count: counts.group.total,
            limit: group.total.curb_glideins,
        },
        Check {
            name: "CurbIdleGlideinsPerGroup",
            count: counts.group.idle,
            limit: group.total.curb_vms_idle,
        },
        Check {
            name: "CurbTotalGlideinsPerFrontend",
            count: counts.frontend.total,
            limit: frontend.frontend.curb_glideins,
        },
        Check {
            name: "CurbIdleGlideinsPerFrontend",
            count: counts.frontend.idle,
            limit: frontend.frontend.curb_vms_idle,
        },
        Check {
            name: "CurbTotalGlideinsGlobal",
            count: counts.global.total,
            limit: frontend.global.curb_glideins,
        },
        Check {
            name: "CurbIdleGlideinsGlobal",
            count: counts.global.idle,
            limit: frontend.global.curb_vms_idle,
        },
    ]
}

/// Idle pilots to request from one Entry.
///
/// `effective_idle` and `effective_oldidle` are the matched idle jobs (all and old ones) not
/// yet covered by idle pilots.
pub fn compute_glidein_min_idle(
    effective_idle: u64,
    effective_oldidle: u64,
    counts: &PilotCounts,
    group: &GroupLimits,
    frontend: &FrontendLimits,
    removal_requested: bool,
    triggered: &mut LimitsTriggered,
) -> u64 {
    if removal_requested {
        return 0;
    }
    let maxes = max_checks(counts, group, frontend);
    let mut reached = false;
    for check in maxes.iter().filter(|check| check.reached()) {
        triggered.insert(check.name.to_string(), check.describe());
        reached = true;
    }
    if reached || effective_idle == 0 {
        return 0;
    }

    let divisor = group.idle_ramp_divisor.max(1);
    let headroom = maxes
        .iter()
        .map(|check| check.limit - check.count)
        .min()
        .unwrap_or(0);
    let mut min_idle = effective_idle.min(headroom) / divisor;
    min_idle += (effective_oldidle / divisor).min(group.reserve_idle);
    min_idle = min_idle.min(group.entry.max_idle);

    for check in curb_checks(counts, group, frontend)
        .iter()
        .filter(|check| check.reached())
    {
        min_idle /= 2;
        triggered.insert(
            check.name.to_string(),
            format!("{}, curbbed", check.describe()),
        );
    }
    min_idle.max(1)
}

/// Upper bound of pilots (idle, running and held) the Entry may keep for the group.
pub fn compute_glidein_max_run(
    prop_idle: u64,
    idle_glideins: u64,
    running_here: u64,
    group: &GroupLimits,
) -> u64 {
    let max_run = if prop_idle > 0 {
        let wanted = prop_idle.saturating_sub(idle_glideins) + running_here;
        (wanted as f64 * group.fraction_running + 1.0) as u64
    } else {
        running_here
    };
    max_run.min(group.entry.max_running)
}

/// Scales `targets` down so that they sum to at most `cap`.
///
/// Every target gets the floor of its proportional share; the units lost to rounding go to
/// the largest remainders, earlier targets first on ties.
pub fn apply_group_cap(targets: &mut [u64], cap: u64) {
    let sum: u64 = targets.iter().sum();
    if sum <= cap {
        return;
    }
    let mut remainders: Vec<(u128, usize)> = Vec::with_capacity(targets.len());
    let mut assigned = 0;
    for (index, target) in targets.iter_mut().enumerate() {
        let scaled = u128::from(*target) * u128::from(cap);
        let share = (scaled / u128::from(sum)) as u64;
        remainders.push((scaled % u128::from(sum), index));
        *target = share;
        assigned += share;
    }
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, index) in remainders.into_iter().take((cap - assigned) as usize) {
        targets[index] += 1;
    }
}
