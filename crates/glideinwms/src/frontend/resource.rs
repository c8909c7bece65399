//! Monitoring ads of a group: `glideresource` per Entry in the user pool and
//! `glideclientglobal` per Factory pool.
use classad::ClassAd;
use classad::ad::{ATTR_CURRENT_TIME, ATTR_DAEMON_START_TIME};

use crate::census::{EntryDescription, GlideinCounts, PoolCensus};
use crate::common::attrs::{
    ATTR_CLIENT_NAME, ATTR_FRONTEND_NAME, ATTR_GLIDE_CLIENT_NAME, ATTR_GLIDE_ENTRY_NAME,
    ATTR_GLIDE_FACTORY_NAME, ATTR_GLIDE_FRONTEND_NAME, ATTR_GLIDE_GROUP_NAME,
    ATTR_GLIDEIN_IN_DOWNTIME, ATTR_GLIDEIN_MY_TYPE, ATTR_GROUP_NAME, ATTR_MATCH_ERRORS,
    PREFIX_CLIENT_LIMIT, PREFIX_CLIENT_MONITOR, PREFIX_FACTORY_MONITOR, TYPE_GLIDECLIENT_GLOBAL,
    TYPE_GLIDERESOURCE,
};
use crate::crypto::sign_ad;
use crate::frontend::config::{FrontendSnapshot, GroupSnapshot};
use crate::frontend::limits::LimitsTriggered;

pub const ATTR_NUMBER_OF_CREDENTIALS: &str = "NumberOfCredentials";
pub const ATTR_CREDENTIAL_IDS: &str = "GlideinCredentialIdentifiers";
pub const ATTR_CLIENT_IDENTITY: &str = "ClientIdentity";

/// Entry attributes copied to the resource ad so that users can match against them.
const COPIED_ENTRY_PREFIX: &str = "GLIDEIN_";

/// What one group iteration computed for one Entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntrySummary {
    pub jobs_idle: u64,
    pub jobs_idle_matching: u64,
    pub jobs_idle_effective: u64,
    pub jobs_idle_old: u64,
    pub jobs_idle_hereonly: u64,
    pub jobs_idle_unique: u64,
    pub jobs_running: u64,
    pub jobs_run_here: u64,
    pub glideins: GlideinCounts,
    pub request_idle: u64,
    pub request_max_run: u64,
    pub limits_triggered: LimitsTriggered,
}

impl EntrySummary {
    /// Counters in the order they are published, without prefix.
    pub fn counters(&self) -> [(&'static str, u64); 14] {
        [
            ("JobsIdle", self.jobs_idle),
            ("JobsIdleMatching", self.jobs_idle_matching),
            ("JobsIdleEffective", self.jobs_idle_effective),
            ("JobsOldIdle", self.jobs_idle_old),
            ("JobsIdleHereonly", self.jobs_idle_hereonly),
            ("JobsIdleUnique", self.jobs_idle_unique),
            ("JobsRunning", self.jobs_running),
            ("JobsRunHere", self.jobs_run_here),
            ("GlideinsTotal", self.glideins.total),
            ("GlideinsIdle", self.glideins.idle),
            ("GlideinsRunning", self.glideins.running),
            ("GlideinsFailed", self.glideins.failed),
            ("GlideinsRequestIdle", self.request_idle),
            ("GlideinsRequestMaxRun", self.request_max_run),
        ]
    }
}

pub fn resource_ad_name(entry: &str, client_name: &str) -> String {
    format!("{entry}@{client_name}")
}

/// `glideresource` ad of one Entry.
#[allow(clippy::too_many_arguments)]
pub fn resource_ad(
    frontend: &FrontendSnapshot,
    group: &GroupSnapshot,
    entry: &EntryDescription,
    summary: &EntrySummary,
    census: &PoolCensus,
    match_errors: u64,
    now: i64,
    start_time: i64,
) -> ClassAd {
    let mut ad = ClassAd::new(
        TYPE_GLIDERESOURCE,
        &resource_ad_name(&entry.name, &group.client_name),
    )
    .with(ATTR_GLIDEIN_MY_TYPE, TYPE_GLIDERESOURCE)
    .with(ATTR_GLIDE_CLIENT_NAME, &group.client_name)
    .with(ATTR_GLIDE_FRONTEND_NAME, &frontend.config.frontend_name)
    .with(ATTR_GLIDE_GROUP_NAME, group.name())
    .with(ATTR_GLIDE_FACTORY_NAME, &entry.factory_name)
    .with(ATTR_GLIDE_ENTRY_NAME, &entry.entry_name)
    .with(ATTR_GLIDEIN_IN_DOWNTIME, entry.in_downtime)
    .with(ATTR_MATCH_ERRORS, match_errors)
    .with(ATTR_CURRENT_TIME, now)
    .with(ATTR_DAEMON_START_TIME, start_time);
    for (name, value) in entry.attrs.iter() {
        if name.starts_with(COPIED_ENTRY_PREFIX) {
            ad.insert(name, value.clone());
        }
    }
    for (name, value) in summary.counters() {
        ad.insert(format!("{PREFIX_CLIENT_MONITOR}{name}"), value);
    }
    for (name, value) in census.factory_status(&entry.name) {
        ad.insert(format!("{PREFIX_FACTORY_MONITOR}Status{name}"), value);
    }
    for (name, description) in &summary.limits_triggered {
        ad.insert(format!("{PREFIX_CLIENT_LIMIT}{name}"), description.as_str());
    }
    ad
}

pub fn global_ad_name(client_name: &str, factory_pool: &str) -> String {
    format!("{client_name}@{factory_pool}")
}

/// `glideclientglobal` ad announcing the credentials of a group to one Factory pool.
pub fn client_global_ad(
    frontend: &FrontendSnapshot,
    group: &GroupSnapshot,
    factory_pool: &str,
    now: i64,
) -> crate::Result<ClassAd> {
    let ids = group
        .config
        .credentials
        .iter()
        .map(|credential| credential.id.as_str())
        .collect::<Vec<_>>();
    let mut ad = ClassAd::new(
        TYPE_GLIDECLIENT_GLOBAL,
        &global_ad_name(&group.client_name, factory_pool),
    )
    .with(ATTR_GLIDEIN_MY_TYPE, TYPE_GLIDECLIENT_GLOBAL)
    .with(ATTR_CLIENT_NAME, &group.client_name)
    .with(ATTR_FRONTEND_NAME, &frontend.config.frontend_name)
    .with(ATTR_GROUP_NAME, group.name())
    .with(ATTR_CLIENT_IDENTITY, &frontend.config.identity)
    .with(ATTR_NUMBER_OF_CREDENTIALS, ids.len())
    .with(ATTR_CREDENTIAL_IDS, ids.join(","))
    .with(ATTR_CURRENT_TIME, now);
    sign_ad(&mut ad, &group.signing_key)?;
    Ok(ad)
}
