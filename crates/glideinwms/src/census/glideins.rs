use std::ops::AddAssign;

use classad::{ClassAd, Map};

use crate::common::attrs::{
    ATTR_GLIDECLIENT_NAME, ATTR_SLOT_CREDENTIAL_ID, ATTR_SLOT_ENTRY_NAME, ATTR_SLOT_FACTORY,
    ATTR_SLOT_GLIDEIN_NAME, entry_fullname,
};

const ATTR_STATE: &str = "State";
const ATTR_ACTIVITY: &str = "Activity";
const ATTR_PARTITIONABLE: &str = "PartitionableSlot";
const ATTR_DYNAMIC: &str = "DynamicSlot";
const ATTR_SLOT_TYPE: &str = "SlotType";
const ATTR_CPUS: &str = "Cpus";
const ATTR_TOTAL_CPUS: &str = "TotalCpus";
const ATTR_MEMORY: &str = "Memory";
const ATTR_TOTAL_SLOTS: &str = "TotalSlots";

/// A partitionable slot with less free memory than this (MB) cannot start another job.
const MIN_FREE_MEMORY: i64 = 2500;

/// Slot counters of a set of pilots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlideinCounts {
    pub total: u64,
    pub idle: u64,
    pub running: u64,
    pub failed: u64,
    pub total_cores: u64,
    pub idle_cores: u64,
    pub running_cores: u64,
}

impl AddAssign for GlideinCounts {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.idle += other.idle;
        self.running += other.running;
        self.failed += other.failed;
        self.total_cores += other.total_cores;
        self.idle_cores += other.idle_cores;
        self.running_cores += other.running_cores;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Static,
    Partitionable,
    Dynamic,
}

fn slot_kind(ad: &ClassAd) -> SlotKind {
    if ad.get_bool(ATTR_PARTITIONABLE).unwrap_or(false)
        || ad
            .get_str(ATTR_SLOT_TYPE)
            .is_some_and(|t| t.eq_ignore_ascii_case("partitionable"))
    {
        SlotKind::Partitionable
    } else if ad.get_bool(ATTR_DYNAMIC).unwrap_or(false)
        || ad
            .get_str(ATTR_SLOT_TYPE)
            .is_some_and(|t| t.eq_ignore_ascii_case("dynamic"))
    {
        SlotKind::Dynamic
    } else {
        SlotKind::Static
    }
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

/// Counters contributed by one slot. Dynamic slots are accounted through their
/// partitionable parent and contribute nothing.
pub fn classify_slot(ad: &ClassAd) -> GlideinCounts {
    let kind = slot_kind(ad);
    if kind == SlotKind::Dynamic {
        return GlideinCounts::default();
    }
    let state = ad.get_str(ATTR_STATE).unwrap_or_default();
    let activity = ad.get_str(ATTR_ACTIVITY).unwrap_or_default();
    let cpus = ad.get_int(ATTR_CPUS).unwrap_or(0);
    let total_cpus = ad.get_int(ATTR_TOTAL_CPUS).unwrap_or(cpus);

    let mut counts = GlideinCounts {
        total: 1,
        total_cores: non_negative(if kind == SlotKind::Partitionable {
            total_cpus
        } else {
            cpus
        }),
        ..Default::default()
    };

    let unclaimed_idle = state == "Unclaimed" && activity == "Idle";
    let is_idle = match kind {
        SlotKind::Partitionable => {
            unclaimed_idle && cpus > 0 && ad.get_int(ATTR_MEMORY).unwrap_or(0) > MIN_FREE_MEMORY
        }
        _ => unclaimed_idle,
    };
    let is_running = match kind {
        SlotKind::Partitionable => ad.get_int(ATTR_TOTAL_SLOTS).unwrap_or(1) > 1,
        _ => state == "Claimed" && (activity == "Busy" || activity == "Retiring"),
    };
    if is_idle {
        counts.idle = 1;
        counts.idle_cores = non_negative(cpus);
    }
    if is_running {
        counts.running = 1;
        counts.running_cores = non_negative(match kind {
            SlotKind::Partitionable => total_cpus - cpus,
            _ => cpus,
        });
    }
    if state == "Drained" && activity == "Retiring" {
        counts.failed = 1;
    }
    counts
}

/// Pilots known to the user pool, from the `Machine` ads.
#[derive(Debug, Clone, Default)]
pub struct GlideinCensus {
    pub per_entry: Map<String, GlideinCounts>,
    pub per_credential: Map<(String, String), GlideinCounts>,
    /// All pilots of this group.
    pub group: GlideinCounts,
    /// All pilots of the groups of this Frontend.
    pub frontend: GlideinCounts,
    /// All pilots in the pool.
    pub global: GlideinCounts,
    /// Slot name to Entry, dynamic slots included, for pilots of this group.
    pub slot_entries: Map<String, String>,
}

impl GlideinCensus {
    pub fn new(ads: &[ClassAd], client_name: &str, frontend_name: &str) -> Self {
        let frontend_prefix = format!("{frontend_name}.");
        let mut census = GlideinCensus::default();
        for ad in ads {
            let Some(owner) = ad.get_str(ATTR_GLIDECLIENT_NAME) else {
                continue;
            };
            let counts = classify_slot(ad);
            census.global += counts;
            if owner.starts_with(&frontend_prefix) {
                census.frontend += counts;
            }
            if owner != client_name {
                continue;
            }
            census.group += counts;
            let (Some(entry), Some(glidein), Some(factory)) = (
                ad.get_str(ATTR_SLOT_ENTRY_NAME),
                ad.get_str(ATTR_SLOT_GLIDEIN_NAME),
                ad.get_str(ATTR_SLOT_FACTORY),
            ) else {
                continue;
            };
            let entry = entry_fullname(entry, glidein, factory);
            census
                .slot_entries
                .insert(ad.name().to_string(), entry.clone());
            *census.per_entry.entry(entry.clone()).or_default() += counts;
            let credential = ad
                .get_str(ATTR_SLOT_CREDENTIAL_ID)
                .unwrap_or_default()
                .to_string();
            *census.per_credential.entry((entry, credential)).or_default() += counts;
        }
        census
    }

    pub fn entry(&self, entry: &str) -> GlideinCounts {
        self.per_entry.get(entry).copied().unwrap_or_default()
    }

    pub fn credential(&self, entry: &str, credential: &str) -> GlideinCounts {
        self.per_credential
            .get(&(entry.to_string(), credential.to_string()))
            .copied()
            .unwrap_or_default()
    }
}
