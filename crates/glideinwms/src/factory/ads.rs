//! Ads the Factory publishes: one `glidefactory` per Entry, one `glidefactoryclient` per
//! served (client, credential) and one `glidefactoryglobal`.
use classad::ClassAd;

use crate::common::attrs::{
    ATTR_AUTH_METHODS, ATTR_CREDENTIAL_ID, ATTR_ENTRY_NAME, ATTR_ENTRY_STATE, ATTR_FACTORY_NAME,
    ATTR_GLIDEIN_MY_TYPE, ATTR_GLIDEIN_NAME, ATTR_IN_DOWNTIME, ATTR_PUB_KEY_ID, ATTR_PUB_KEY_TYPE,
    ATTR_PUB_KEY_VALUE, ATTR_REQ_CLIENT_NAME, ATTR_REQ_CLIENT_REQ_NAME, ATTR_REQ_REJECTED_SIGNATURE,
    ATTR_REQUIRE_VOMS, ATTR_SUPPORTED_SIGN_TYPES, ATTR_TRUST_DOMAIN, PREFIX_MONITOR_REQUESTED,
    PREFIX_MONITOR_STATUS, TYPE_GLIDEFACTORY, TYPE_GLIDEFACTORY_CLIENT, TYPE_GLIDEFACTORY_GLOBAL,
};
use crate::factory::config::{EntrySnapshot, FactorySnapshot, PilotLimits};
use crate::factory::state::EntryState;
use crate::factory::totals::PilotCounts;

const SIGN_TYPES: &str = "hmac_sha256";
const KEY_TYPE: &str = "RSA";
const ATTR_CPUS: &str = "GLIDEIN_CPUS";
const ATTR_GRID_TYPE: &str = "GLIDEIN_GridType";
const ATTR_GATEKEEPER: &str = "GLIDEIN_Gatekeeper";
const ATTR_CURRENT_TIME: &str = "CurrentTime";
const ATTR_START_TIME: &str = "DaemonStartTime";
const PREFIX_TOTAL_STATUS: &str = "GlideinMonitorTotalStatus";
const PREFIX_ENTRY_LIMIT: &str = "GlideinConfigPerEntry";
const PREFIX_FRONTEND_LIMIT: &str = "GlideinConfigPerFrontend";

fn with_counts(mut ad: ClassAd, prefix: &str, counts: PilotCounts) -> ClassAd {
    ad.insert(format!("{prefix}Idle"), counts.idle);
    ad.insert(format!("{prefix}Running"), counts.running);
    ad.insert(format!("{prefix}Held"), counts.held);
    ad.insert(format!("{prefix}Total"), counts.total());
    ad
}

fn with_limits(mut ad: ClassAd, prefix: &str, limits: &PilotLimits) -> ClassAd {
    ad.insert(format!("{prefix}MaxGlideins"), limits.max_glideins);
    ad.insert(format!("{prefix}MaxIdle"), limits.max_idle);
    ad.insert(format!("{prefix}MaxHeld"), limits.max_held);
    ad
}

fn with_key(factory: &FactorySnapshot, ad: ClassAd) -> ClassAd {
    let key = factory.key.public();
    ad.with(ATTR_PUB_KEY_ID, key.id())
        .with(ATTR_PUB_KEY_TYPE, KEY_TYPE)
        .with(ATTR_PUB_KEY_VALUE, key.pem())
        .with(ATTR_SUPPORTED_SIGN_TYPES, SIGN_TYPES)
}

/// `glidefactory` ad of an Entry. Configured Entry attributes are published first so the
/// fixed ones cannot be overridden.
pub fn entry_ad(
    factory: &FactorySnapshot,
    entry: &EntrySnapshot,
    state: EntryState,
    counts: PilotCounts,
    now: i64,
    start_time: i64,
) -> ClassAd {
    let config = &entry.config;
    let mut ad = ClassAd::new(TYPE_GLIDEFACTORY, &entry.fullname);
    for (key, value) in &config.attrs {
        ad.insert(key.as_str(), value.clone());
    }
    let ad = ad
        .with(ATTR_GLIDEIN_MY_TYPE, TYPE_GLIDEFACTORY)
        .with(ATTR_FACTORY_NAME, &factory.config.factory_name)
        .with(ATTR_GLIDEIN_NAME, &factory.config.glidein_name)
        .with(ATTR_ENTRY_NAME, &config.name)
        .with(ATTR_IN_DOWNTIME, state != EntryState::Active)
        .with(ATTR_ENTRY_STATE, state.name())
        .with(ATTR_TRUST_DOMAIN, &config.trust_domain)
        .with(ATTR_AUTH_METHODS, config.auth_method.name())
        .with(ATTR_CPUS, config.cpus)
        .with(ATTR_REQUIRE_VOMS, config.require_voms)
        .with(ATTR_GRID_TYPE, &config.grid_type)
        .with(ATTR_GATEKEEPER, &config.gatekeeper)
        .with(ATTR_CURRENT_TIME, now)
        .with(ATTR_START_TIME, start_time);
    let ad = with_limits(ad, PREFIX_ENTRY_LIMIT, &config.limits.total);
    let ad = with_limits(ad, PREFIX_FRONTEND_LIMIT, &config.limits.per_frontend);
    with_key(factory, with_counts(ad, PREFIX_TOTAL_STATUS, counts))
}

/// Status of one (client, credential) pair on an Entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStatus {
    pub client_name: String,
    pub credential_id: String,
    pub counts: PilotCounts,
    /// Idle pilots not yet handed to the site.
    pub pending: u64,
    pub requested_idle: u64,
    pub requested_max: u64,
    pub rejected_signatures: u64,
}

pub fn client_ad_name(entry: &EntrySnapshot, client_name: &str, credential_id: &str) -> String {
    format!("{credential_id}_{}@{client_name}", entry.fullname)
}

/// `glidefactoryclient` ad reporting the pilots of one client back to its Frontend.
pub fn client_ad(
    factory: &FactorySnapshot,
    entry: &EntrySnapshot,
    status: &ClientStatus,
    now: i64,
    start_time: i64,
) -> ClassAd {
    let ad = ClassAd::new(
        TYPE_GLIDEFACTORY_CLIENT,
        &client_ad_name(entry, &status.client_name, &status.credential_id),
    )
    .with(ATTR_GLIDEIN_MY_TYPE, TYPE_GLIDEFACTORY_CLIENT)
    .with(ATTR_FACTORY_NAME, &factory.config.factory_name)
    .with(ATTR_GLIDEIN_NAME, &factory.config.glidein_name)
    .with(ATTR_ENTRY_NAME, entry.name())
    .with(ATTR_REQ_CLIENT_NAME, &status.client_name)
    .with(ATTR_REQ_CLIENT_REQ_NAME, &entry.fullname)
    .with(ATTR_CREDENTIAL_ID, &status.credential_id)
    .with(format!("{PREFIX_MONITOR_STATUS}Pending"), status.pending)
    .with(format!("{PREFIX_MONITOR_REQUESTED}Idle"), status.requested_idle)
    .with(
        format!("{PREFIX_MONITOR_REQUESTED}MaxGlideins"),
        status.requested_max,
    )
    .with(ATTR_REQ_REJECTED_SIGNATURE, status.rejected_signatures)
    .with(ATTR_CURRENT_TIME, now)
    .with(ATTR_START_TIME, start_time);
    with_counts(ad, PREFIX_MONITOR_STATUS, status.counts)
}

/// `glidefactoryglobal` ad summarizing the whole Factory.
pub fn global_ad(factory: &FactorySnapshot, counts: PilotCounts, now: i64, start_time: i64) -> ClassAd {
    let ad = ClassAd::new(TYPE_GLIDEFACTORY_GLOBAL, &factory.global_name())
        .with(ATTR_GLIDEIN_MY_TYPE, TYPE_GLIDEFACTORY_GLOBAL)
        .with(ATTR_FACTORY_NAME, &factory.config.factory_name)
        .with(ATTR_GLIDEIN_NAME, &factory.config.glidein_name)
        .with("GlideinConfigMaxGlideins", factory.config.max_glideins)
        .with(ATTR_CURRENT_TIME, now)
        .with(ATTR_START_TIME, start_time);
    with_key(factory, with_counts(ad, PREFIX_TOTAL_STATUS, counts))
}
