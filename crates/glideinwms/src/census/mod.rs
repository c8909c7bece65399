//! Snapshot of the user pool and of the Factories taken at the start of a group iteration.
mod entries;
mod glideins;
mod jobs;
mod schedd;

use std::collections::BTreeMap;
use std::time::Duration;

use classad::{ClassAd, Expression, Map, Query, Transport, TransportError, TransportFuture};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

pub use entries::EntryDescription;
pub use glideins::{GlideinCensus, GlideinCounts, classify_slot};
pub use jobs::{JobCensus, JobClass, JobRecord};
pub use schedd::{blacklisted_schedds, is_overloaded};

use crate::common::attrs::{
    ATTR_CLIENT_NAME, ATTR_CREDENTIAL_ID, ATTR_IS_MONITOR_VM, ATTR_REQ_CLIENT_NAME,
    ATTR_REQ_CLIENT_REQ_NAME, ATTR_REQ_IDLE, PREFIX_MONITOR_STATUS, TYPE_GLIDECLIENT,
    TYPE_GLIDEFACTORY, TYPE_GLIDEFACTORY_CLIENT, TYPE_MACHINE, TYPE_SCHEDULER,
};
use crate::common::utils::time::now_epoch;

const ATTR_AUTHENTICATED_IDENTITY: &str = "AuthenticatedIdentity";

/// A Factory collector and the identity its Entries must be advertised with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactorySource {
    pub pool: String,
    pub identity: String,
}

/// What to look at during one census.
#[derive(Debug, Clone)]
pub struct CensusQuery {
    pub user_pool: String,
    pub schedds: Vec<String>,
    pub job_query: Expression,
    pub factory_query: Expression,
    pub factories: Vec<FactorySource>,
    /// `<frontend>.<group>`
    pub client_name: String,
    pub frontend_name: String,
    /// Budget of every single query.
    pub timeout: Duration,
}

/// Counters of one (Entry, credential) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounters {
    pub requested_idle: u64,
    pub idle_glideins: u64,
    pub running_glideins: u64,
    pub held_glideins: u64,
    pub idle_cores: u64,
    pub running_cores: u64,
    pub total_cores: u64,
    pub matched_jobs_idle: u64,
    pub matched_jobs_running: u64,
    pub matched_jobs_hereonly: u64,
    pub unique_users: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PoolCensus {
    pub time: i64,
    pub entries: Vec<EntryDescription>,
    pub jobs: JobCensus,
    pub glideins: GlideinCensus,
    /// `glidefactoryclient` ads of this group by (Entry, credential).
    pub factory_clients: Map<(String, String), ClassAd>,
    /// Requests this group published last time, by name, with the pool they live in.
    pub own_requests: Map<String, (String, ClassAd)>,
    pub blacklisted_schedds: Vec<String>,
}

async fn timed(
    future: TransportFuture<Vec<ClassAd>>,
    timeout: Duration,
    what: &str,
) -> crate::Result<Vec<ClassAd>> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::Timeout(format!(
            "Query of {what} did not finish within {}",
            humantime::format_duration(timeout)
        ))
        .into()),
    }
}

fn identity_constraint(identities: &[&str]) -> Expression {
    identities
        .iter()
        .map(|identity| Expression::attr_equals(ATTR_AUTHENTICATED_IDENTITY, identity))
        .reduce(|acc, term| acc.or(&term))
        .unwrap_or_else(Expression::always_false)
}

struct FactoryPoolAds {
    pool: String,
    entries: Vec<ClassAd>,
    clients: Vec<ClassAd>,
    own: Vec<ClassAd>,
}

async fn query_factory_pool(
    transport: &dyn Transport,
    pool: String,
    identities: Vec<&str>,
    query: &CensusQuery,
) -> crate::Result<FactoryPoolAds> {
    let identity = identity_constraint(&identities);
    let entries = Query::new(TYPE_GLIDEFACTORY)
        .constraint(identity.clone())
        .constraint(query.factory_query.clone());
    let clients = Query::new(TYPE_GLIDEFACTORY_CLIENT)
        .constraint(identity)
        .constraint(Expression::attr_equals(ATTR_REQ_CLIENT_NAME, &query.client_name));
    let own = Query::new(TYPE_GLIDECLIENT)
        .constraint(Expression::attr_equals(ATTR_CLIENT_NAME, &query.client_name));
    let (entries, clients, own) = futures::try_join!(
        timed(transport.query(&pool, &entries), query.timeout, "Entries"),
        timed(transport.query(&pool, &clients), query.timeout, "Factory clients"),
        timed(transport.query(&pool, &own), query.timeout, "own requests"),
    )?;
    Ok(FactoryPoolAds {
        pool,
        entries,
        clients,
        own,
    })
}

/// Queries the user pool, its schedds and the Factories. Any failed or late query aborts
/// the census, except job queries of schedds that are overloaded.
pub async fn collect(transport: &dyn Transport, query: &CensusQuery) -> crate::Result<PoolCensus> {
    let time = now_epoch();

    let mut pools: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for factory in &query.factories {
        pools
            .entry(factory.pool.as_str())
            .or_default()
            .push(factory.identity.as_str());
    }

    let schedd_query = Query::new(TYPE_SCHEDULER);
    let machine_query = Query::new(TYPE_MACHINE)
        .constraint(Expression::parse(&format!("{ATTR_IS_MONITOR_VM} =!= true"))?);
    let (schedd_ads, machine_ads, factory_ads) = futures::try_join!(
        timed(
            transport.query(&query.user_pool, &schedd_query),
            query.timeout,
            "schedds"
        ),
        timed(
            transport.query(&query.user_pool, &machine_query),
            query.timeout,
            "slots"
        ),
        try_join_all(
            pools
                .into_iter()
                .map(|(pool, identities)| query_factory_pool(
                    transport,
                    pool.to_string(),
                    identities,
                    query
                ))
        ),
    )?;

    let blacklisted = blacklisted_schedds(&query.schedds, &schedd_ads);
    let queues = try_join_all(
        query
            .schedds
            .iter()
            .filter(|schedd| !blacklisted.contains(*schedd))
            .map(|schedd| async move {
                let jobs = Query::jobs(schedd).constraint(query.job_query.clone());
                let ads = timed(
                    transport.query(&query.user_pool, &jobs),
                    query.timeout,
                    &format!("jobs of {schedd}"),
                )
                .await?;
                crate::Result::Ok((schedd.clone(), ads))
            }),
    )
    .await?;

    let mut census = PoolCensus {
        time,
        jobs: JobCensus::new(queues, time),
        glideins: GlideinCensus::new(&machine_ads, &query.client_name, &query.frontend_name),
        blacklisted_schedds: blacklisted,
        ..Default::default()
    };
    for pool_ads in factory_ads {
        for ad in pool_ads.entries {
            if census.entries.iter().any(|entry| entry.name == ad.name()) {
                continue;
            }
            match EntryDescription::from_ad(&pool_ads.pool, ad) {
                Ok(entry) => census.entries.push(entry),
                Err(error) => log::warn!("Ignoring Entry: {error}"),
            }
        }
        for ad in pool_ads.clients {
            let (Some(entry), Some(credential)) = (
                ad.get_str(ATTR_REQ_CLIENT_REQ_NAME),
                ad.get_str(ATTR_CREDENTIAL_ID),
            ) else {
                continue;
            };
            census
                .factory_clients
                .insert((entry.to_string(), credential.to_string()), ad);
        }
        for ad in pool_ads.own {
            census
                .own_requests
                .insert(ad.name().to_string(), (pool_ads.pool.clone(), ad));
        }
    }
    census.entries.sort_by(|a, b| a.name.cmp(&b.name));
    log::debug!(
        "Census: {} jobs, {} entries, {} group slots, {} blacklisted schedds",
        census.jobs.jobs.len(),
        census.entries.len(),
        census.glideins.group.total,
        census.blacklisted_schedds.len()
    );
    Ok(census)
}

impl PoolCensus {
    pub fn entry(&self, name: &str) -> Option<&EntryDescription> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Pilot counters of one (Entry, credential) pair. Matched job counters are left at zero.
    pub fn counters(&self, entry: &str, credential: &str, request_name: &str) -> EntryCounters {
        let slots = self.glideins.credential(entry, credential);
        let held = self
            .factory_clients
            .get(&(entry.to_string(), credential.to_string()))
            .and_then(|ad| ad.get_int(&format!("{PREFIX_MONITOR_STATUS}Held")))
            .unwrap_or(0);
        let requested_idle = self
            .own_requests
            .get(request_name)
            .and_then(|(_, ad)| ad.get_int(ATTR_REQ_IDLE))
            .unwrap_or(0);
        EntryCounters {
            requested_idle: requested_idle.max(0) as u64,
            idle_glideins: slots.idle,
            running_glideins: slots.running,
            held_glideins: held.max(0) as u64,
            idle_cores: slots.idle_cores,
            running_cores: slots.running_cores,
            total_cores: slots.total_cores,
            ..Default::default()
        }
    }

    /// `GlideinMonitorStatus*` counters the Factories reported for this group on one Entry,
    /// summed over credentials and keyed without the prefix (`Idle`, `Running`, ...).
    pub fn factory_status(&self, entry: &str) -> BTreeMap<String, i64> {
        let mut status = BTreeMap::new();
        for ((name, _), ad) in self.factory_clients.iter() {
            if name != entry {
                continue;
            }
            for (key, value) in ad.with_prefix(PREFIX_MONITOR_STATUS) {
                if let Some(value) = value.as_int() {
                    *status.entry(key.to_string()).or_default() += value;
                }
            }
        }
        status
    }

    /// Running jobs that run on pilots of the given Entry.
    pub fn running_here(&self, entry: &str) -> u64 {
        self.jobs
            .jobs
            .iter()
            .filter(|job| job.has(JobClass::Running))
            .filter_map(|job| job.remote_host.as_deref())
            .filter(|host| {
                self.glideins
                    .slot_entries
                    .get(*host)
                    .is_some_and(|slot_entry| slot_entry == entry)
            })
            .count() as u64
    }
}
