//! One Factory iteration: census of every Entry, then per Entry sanitizing, admission,
//! submission and removal, and finally publication of the Factory ads.
use std::collections::{BTreeMap, BTreeSet};

use classad::{ClassAd, Expression, Query, Transport};
use futures::future::join_all;

use crate::common::attrs::{ATTR_CLIENT_NAME, ATTR_REQ_GLIDEIN, TYPE_GLIDECLIENT};
use crate::common::error::GwmsError;
use crate::common::utils::time::{bounded, now_epoch, now_monotonic};
use crate::downtime::DowntimePeriod;
use crate::factory::admission::{Admission, AdmittedRequest, RejectReason};
use crate::factory::ads::{ClientStatus, client_ad, entry_ad, global_ad};
use crate::factory::config::{EntrySnapshot, FactorySnapshot};
use crate::factory::held::plan_sanitize;
use crate::factory::state::{AdKey, EntryRuntime, EntryState, reconcile_entries};
use crate::factory::totals::{GlideinTotals, GlobalBudget, PilotCounts};
use crate::factory::work::{EntryPilots, EntryWork, count_pilots};
use crate::stats::{EntryIterationRecord, StatsEvent, StatsSink, next_iteration};
use crate::submit::{
    ATTR_GLIDEIN_ENTRY, PilotRecord, PilotState, RemoveMode, ScheddRegistry, SubmitBackend,
};

fn ad_key(pool: &str, ad: &ClassAd) -> AdKey {
    (
        pool.to_string(),
        ad.my_type().to_string(),
        ad.name().to_string(),
    )
}

/// What the Factory keeps between iterations.
#[derive(Debug, Default)]
pub struct FactoryState {
    pub entries: BTreeMap<String, EntryRuntime>,
    global_advertised: Option<AdKey>,
}

impl FactoryState {
    pub fn new(factory: &FactorySnapshot) -> Self {
        Self {
            entries: reconcile_entries(factory, BTreeMap::new()),
            global_advertised: None,
        }
    }

    pub fn reconfigure(&mut self, factory: &FactorySnapshot) {
        self.entries = reconcile_entries(factory, std::mem::take(&mut self.entries));
    }

    pub fn entry(&self, name: &str) -> Option<&EntryRuntime> {
        self.entries.get(name)
    }
}

pub struct FactoryContext<'a> {
    pub transport: &'a dyn Transport,
    pub backend: &'a dyn SubmitBackend,
    pub registry: &'a ScheddRegistry,
    pub stats: &'a dyn StatsSink,
    /// Start of the daemon (epoch seconds).
    pub start_time: i64,
}

/// Requests addressed to an Entry and its pilots.
struct EntryCensus {
    requests: Vec<ClassAd>,
    pilots: Vec<PilotRecord>,
}

async fn entry_census(
    factory: &FactorySnapshot,
    entry: &EntrySnapshot,
    ctx: &FactoryContext<'_>,
) -> crate::Result<EntryCensus> {
    let timeout = factory.config.query_timeout;
    let query = Query::new(TYPE_GLIDECLIENT)
        .constraint(Expression::attr_equals(ATTR_REQ_GLIDEIN, &entry.fullname));
    let requests = bounded(ctx.transport.query(&factory.config.pool, &query), timeout);
    let constraint = Expression::attr_equals(ATTR_GLIDEIN_ENTRY, entry.name());
    let pilots = async {
        match tokio::time::timeout(
            timeout,
            ctx.backend.enum_pilots(&entry.config.schedd, &constraint),
        )
        .await
        {
            Ok(result) => result.map_err(GwmsError::from),
            Err(_) => Err(GwmsError::GenericError(format!(
                "Listing pilots on {} timed out after {}",
                entry.config.schedd,
                humantime::format_duration(timeout)
            ))),
        }
    };
    let (requests, pilots) = futures::join!(requests, pilots);
    Ok(EntryCensus {
        requests: requests?,
        pilots: pilots?
            .into_iter()
            .filter(|pilot| !matches!(pilot.state, PilotState::Removed | PilotState::Completed))
            .collect(),
    })
}

/// Entry and factory-wide windows; Frontend specific ones are handled by admission.
fn entry_in_downtime(downtimes: &[DowntimePeriod], entry: &str, now: i64) -> bool {
    downtimes
        .iter()
        .any(|period| period.is_active(now) && period.covers(entry, None, None))
}

fn to_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

struct EntryInputs<'a> {
    factory: &'a FactorySnapshot,
    downtimes: &'a [DowntimePeriod],
    global: &'a GlobalBudget,
    iteration: u64,
    now: i64,
}

fn admit(
    inputs: &EntryInputs<'_>,
    runtime: &mut EntryRuntime,
    requests: &[ClassAd],
    record: &mut EntryIterationRecord,
) -> Vec<AdmittedRequest> {
    let admission = Admission {
        factory: inputs.factory,
        entry: &runtime.entry,
        downtimes: inputs.downtimes,
        now: inputs.now,
    };
    let mut admitted = Vec::new();
    for ad in requests {
        match admission.check(ad) {
            Ok(request) => admitted.push(request),
            Err(rejection) => {
                log::warn!(
                    "Entry {}: dropping request {}: {rejection}",
                    runtime.name(),
                    ad.name()
                );
                *record
                    .rejected
                    .entry(rejection.reason.name().to_string())
                    .or_default() += 1;
                if rejection.reason == RejectReason::Signature {
                    let client = ad.get_str(ATTR_CLIENT_NAME).unwrap_or_default().to_string();
                    *runtime.rejected_signatures.entry(client).or_default() += 1;
                }
            }
        }
    }
    record.requests_received = to_u32(requests.len() as u64);
    record.requests_accepted = to_u32(admitted.len() as u64);
    admitted
}

/// Sanitizes the queue and returns the pilots that are left.
async fn sanitize(
    inputs: &EntryInputs<'_>,
    work: &EntryWork<'_>,
    pilots: Vec<PilotRecord>,
    record: &mut EntryIterationRecord,
) -> Vec<PilotRecord> {
    let plan = plan_sanitize(&pilots, &inputs.factory.config.held, inputs.now);
    if plan.is_empty() {
        return pilots;
    }
    record.removed += work
        .remove(&plan.remove_unrecoverable, RemoveMode::Immediate, "unrecoverable hold")
        .await;
    record.removed += work
        .remove(&plan.remove_stale, RemoveMode::Immediate, "stuck in one state")
        .await;
    record.released += work.release(&plan.release).await;
    let removed: BTreeSet<String> = plan.removed().map(PilotRecord::id).collect();
    pilots
        .into_iter()
        .filter(|pilot| !removed.contains(&pilot.id()))
        .collect()
}

/// Publishes `ads` and invalidates what the Entry published before but not now.
async fn publish(
    factory: &FactorySnapshot,
    advertised: &mut BTreeSet<AdKey>,
    ads: Vec<ClassAd>,
    transport: &dyn Transport,
) -> u32 {
    let pool = &factory.config.pool;
    let timeout = factory.config.query_timeout;
    let mut errors = 0;
    let mut current = BTreeSet::new();
    for (index, ad) in ads.iter().enumerate() {
        if index > 0 && !factory.advertise_delay.is_zero() {
            tokio::time::sleep(factory.advertise_delay).await;
        }
        if let Err(error) = bounded(transport.advertise(pool, ad), timeout).await {
            log::warn!("Cannot advertise {} {}: {error}", ad.my_type(), ad.name());
            errors += 1;
        }
        current.insert(ad_key(pool, ad));
    }
    let stale: Vec<AdKey> = advertised.difference(&current).cloned().collect();
    for key in stale {
        let (pool, my_type, name) = &key;
        if let Err(error) = bounded(transport.invalidate(pool, my_type, name), timeout).await {
            log::warn!("Cannot invalidate {my_type} {name}: {error}");
            errors += 1;
            current.insert(key);
        }
    }
    *advertised = current;
    errors
}

async fn run_entry(
    inputs: &EntryInputs<'_>,
    runtime: &mut EntryRuntime,
    census: crate::Result<EntryCensus>,
    ctx: &FactoryContext<'_>,
) -> (EntryIterationRecord, PilotCounts) {
    let factory = inputs.factory;
    let mut record = EntryIterationRecord {
        iteration: inputs.iteration,
        factory: factory.config.factory_name.clone(),
        entry: runtime.name().to_string(),
        time: inputs.now,
        state: runtime.state.name().to_string(),
        ..Default::default()
    };
    let census = match census {
        Ok(census) => census,
        Err(error) => {
            log::error!(
                "Entry {}: census failed ({}), skipping the iteration: {error}",
                runtime.name(),
                error.kind().name()
            );
            return (record, PilotCounts::default());
        }
    };

    let entry = runtime.entry.clone();
    let in_downtime = entry_in_downtime(inputs.downtimes, entry.name(), inputs.now);
    let counts = count_pilots(&census.pilots);
    let state = EntryState::next(runtime.configured, runtime.drain(), in_downtime, counts.total());
    if state != runtime.state {
        log::info!("Entry {}: {} -> {state}", entry.name(), runtime.state);
    }
    runtime.state = state;
    record.state = state.name().to_string();
    record.in_downtime = in_downtime;
    record.pilots_idle = to_u32(counts.idle);
    record.pilots_running = to_u32(counts.running);
    record.pilots_held = to_u32(counts.held);

    let work = EntryWork {
        factory,
        entry: &entry,
        backend: ctx.backend,
        registry: ctx.registry,
        now: inputs.now,
    };
    let pilots = EntryPilots::new(sanitize(inputs, &work, census.pilots, &mut record).await);
    let admitted = admit(inputs, runtime, &census.requests, &mut record);

    let mut totals = GlideinTotals::new(&entry.config.limits, pilots.frontend_counts(), inputs.global);
    let mut statuses = Vec::new();
    let mut served = BTreeSet::new();
    for request in &admitted {
        let client_pilots: Vec<&PilotRecord> = pilots
            .of_client(&request.client_name, &request.credential_id)
            .collect();
        let outcome = work
            .process(request, &client_pilots, &mut totals, state.accepts_requests())
            .await;
        record.submitted += outcome.submitted;
        record.removed += outcome.removed;
        if outcome.submit_error.is_some() {
            record.submit_errors += 1;
        }
        served.insert((request.client_name.clone(), request.credential_id.clone()));
        statuses.push(ClientStatus {
            client_name: request.client_name.clone(),
            credential_id: request.credential_id.clone(),
            counts: outcome.counts,
            pending: outcome.pending,
            requested_idle: request.req_idle,
            requested_max: request.req_max,
            rejected_signatures: 0,
        });
    }

    // Clients that stopped asking still see their pilots.
    let mut orphans: BTreeMap<(String, String), Vec<&PilotRecord>> = BTreeMap::new();
    for pilot in &pilots.pilots {
        let key = (pilot.client_name.clone(), pilot.credential_id.clone());
        if !served.contains(&key) {
            orphans.entry(key).or_default().push(pilot);
        }
    }
    for ((client_name, credential_id), client_pilots) in orphans {
        statuses.push(ClientStatus {
            client_name,
            credential_id,
            counts: count_pilots(client_pilots),
            ..Default::default()
        });
    }
    for status in &mut statuses {
        status.rejected_signatures = runtime
            .rejected_signatures
            .get(&status.client_name)
            .copied()
            .unwrap_or(0);
    }

    let entry_counts = totals.entry_counts();
    let ads = if state == EntryState::Stopped {
        Vec::new()
    } else {
        let now = inputs.now;
        std::iter::once(entry_ad(factory, &entry, state, entry_counts, now, ctx.start_time))
            .chain(
                statuses
                    .iter()
                    .map(|status| client_ad(factory, &entry, status, now, ctx.start_time)),
            )
            .collect()
    };
    let errors = publish(factory, &mut runtime.advertised, ads, ctx.transport).await;
    if errors > 0 {
        log::warn!("Entry {}: {errors} publication error(s)", entry.name());
    }
    (record, entry_counts)
}

/// Runs one iteration over every Entry and emits a record per Entry.
///
/// Entries run concurrently. The schedd registry keeps submissions to a shared schedd in
/// order and gives every Entry its own budget.
pub async fn run_factory_iteration(
    factory: &FactorySnapshot,
    state: &mut FactoryState,
    ctx: &FactoryContext<'_>,
) -> Vec<EntryIterationRecord> {
    let started = now_monotonic();
    let now = now_epoch();
    let iteration = next_iteration();
    ctx.registry.reset_budgets();
    let downtimes = match factory.downtime.read() {
        Ok(periods) => periods,
        Err(error) => {
            log::error!(
                "Cannot read downtimes from {}: {error}",
                factory.downtime.path().display()
            );
            Vec::new()
        }
    };

    let censuses = join_all(
        state
            .entries
            .values()
            .map(|runtime| entry_census(factory, &runtime.entry, ctx)),
    )
    .await;
    let total: u64 = censuses
        .iter()
        .filter_map(|census| census.as_ref().ok())
        .map(|census| count_pilots(&census.pilots).total())
        .sum();
    let global = GlobalBudget::new(factory.config.max_glideins, total);
    let inputs = EntryInputs {
        factory,
        downtimes: &downtimes,
        global: &global,
        iteration,
        now,
    };

    let results = join_all(
        state
            .entries
            .values_mut()
            .zip(censuses)
            .map(|(runtime, census)| run_entry(&inputs, runtime, census, ctx)),
    )
    .await;

    let mut factory_counts = PilotCounts::default();
    let mut records = Vec::with_capacity(results.len());
    for (mut record, counts) in results {
        factory_counts.idle += counts.idle;
        factory_counts.running += counts.running;
        factory_counts.held += counts.held;
        record.duration_ms = (now_monotonic() - started).as_millis() as u64;
        ctx.stats.emit(StatsEvent::EntryIteration(record.clone()));
        records.push(record);
    }
    state
        .entries
        .retain(|_, runtime| runtime.configured || runtime.state != EntryState::Stopped);

    let ad = global_ad(factory, factory_counts, now, ctx.start_time);
    let key = ad_key(&factory.config.pool, &ad);
    match bounded(
        ctx.transport.advertise(&factory.config.pool, &ad),
        factory.config.query_timeout,
    )
    .await
    {
        Ok(()) => state.global_advertised = Some(key),
        Err(error) => log::warn!("Cannot advertise {}: {error}", ad.name()),
    }
    records
}

/// Invalidates every ad the Factory published. Returns the number of failed invalidations.
pub async fn withdraw(
    factory: &FactorySnapshot,
    state: &mut FactoryState,
    transport: &dyn Transport,
) -> u32 {
    let mut failures = 0;
    let keys = state
        .entries
        .values_mut()
        .flat_map(|runtime| std::mem::take(&mut runtime.advertised))
        .chain(state.global_advertised.take())
        .collect::<Vec<_>>();
    for (pool, my_type, name) in keys {
        if let Err(error) = bounded(
            transport.invalidate(&pool, &my_type, &name),
            factory.config.query_timeout,
        )
        .await
        {
            log::warn!("Cannot invalidate {my_type} {name} in {pool}: {error}");
            failures += 1;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use classad::{MemoryCollector, MemoryTransport};
    use tempfile::TempDir;

    use super::{FactoryContext, FactoryState, run_factory_iteration, withdraw};
    use crate::common::utils::time::now_epoch;
    use crate::downtime::DowntimePeriod;
    use crate::factory::config::{EntryLimits, FactorySnapshot, PilotLimits};
    use crate::stats::EntryIterationRecord;
    use crate::submit::{PilotState, ScheddRegistry};
    use crate::tests::utils::{
        FACTORY_IDENTITY, FACTORY_POOL, FACTORY_SCHEDD, FactoryFixtureBuilder, MockSubmitBackend,
        RecordingSink, factory_setup, pilot, signed_request, signed_request_to,
    };

    struct Env {
        _dir: TempDir,
        factory: FactorySnapshot,
        state: FactoryState,
        collector: MemoryCollector,
        transport: MemoryTransport,
        backend: MockSubmitBackend,
        registry: ScheddRegistry,
        sink: RecordingSink,
    }

    fn env(builder: FactoryFixtureBuilder) -> Env {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let factory = factory_setup(dir.path(), builder);
        let collector = MemoryCollector::new();
        Env {
            _dir: dir,
            state: FactoryState::new(&factory),
            registry: ScheddRegistry::new(factory.config.max_submits_per_cycle),
            factory,
            transport: collector.client(FACTORY_IDENTITY),
            collector,
            backend: MockSubmitBackend::new(),
            sink: RecordingSink::default(),
        }
    }

    impl Env {
        async fn iterate(&mut self) -> Vec<EntryIterationRecord> {
            let ctx = FactoryContext {
                transport: &self.transport,
                backend: &self.backend,
                registry: &self.registry,
                stats: &self.sink,
                start_time: 1,
            };
            run_factory_iteration(&self.factory, &mut self.state, &ctx).await
        }

        fn request(&self, credential_id: &str, idle: u64, max: u64) {
            self.collector.insert(
                FACTORY_POOL,
                signed_request(&self.factory, credential_id, idle, max, now_epoch()),
            );
        }

        fn idle(&self) -> usize {
            self.backend.count(FACTORY_SCHEDD, PilotState::Idle)
        }
    }

    #[tokio::test]
    async fn requests_are_served_and_reported() {
        let mut env = env(FactoryFixtureBuilder::default());
        env.request("cred1", 5, 20);
        let records = env.iterate().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].requests_accepted, 1);
        assert_eq!(records[0].submitted, 5);
        assert_eq!(records[0].state, "Active");
        assert_eq!(env.idle(), 5);

        let entry = env.collector.get(FACTORY_POOL, "glidefactory", "ce1@g@f").unwrap();
        assert_eq!(entry.authenticated_identity(), Some(FACTORY_IDENTITY));
        let client = env
            .collector
            .get(FACTORY_POOL, "glidefactoryclient", "cred1_ce1@g@f@fe.main")
            .unwrap();
        assert_eq!(client.get_int("GlideinMonitorRequestedIdle"), Some(5));
        assert!(env.collector.get(FACTORY_POOL, "glidefactoryglobal", "g@f").is_some());

        // Pilots already idle are not submitted again.
        let records = env.iterate().await;
        assert_eq!(records[0].submitted, 0);
        assert_eq!(records[0].pilots_idle, 5);
        let client = env
            .collector
            .get(FACTORY_POOL, "glidefactoryclient", "cred1_ce1@g@f@fe.main")
            .unwrap();
        assert_eq!(client.get_int("GlideinMonitorStatusIdle"), Some(5));
        assert_eq!(env.sink.entry_records().len(), 2);
    }

    #[tokio::test]
    async fn client_ad_counts_this_iterations_actions() {
        let mut env = env(FactoryFixtureBuilder::default());
        let client = |env: &Env| {
            env.collector
                .get(FACTORY_POOL, "glidefactoryclient", "cred1_ce1@g@f@fe.main")
                .unwrap()
        };

        env.request("cred1", 5, 20);
        env.iterate().await;
        let ad = client(&env);
        assert_eq!(ad.get_int("GlideinMonitorStatusIdle"), Some(5));
        assert_eq!(ad.get_int("GlideinMonitorStatusPending"), Some(5));
        assert_eq!(ad.get_int("GlideinMonitorStatusTotal"), Some(5));

        // Idle pilots above the new maximum are removed in the same iteration.
        env.request("cred1", 5, 2);
        let records = env.iterate().await;
        assert_eq!(records[0].removed, 3);
        let ad = client(&env);
        assert_eq!(ad.get_int("GlideinMonitorStatusIdle"), Some(2));
        assert_eq!(ad.get_int("GlideinMonitorStatusPending"), Some(2));
        assert_eq!(env.idle(), 2);
    }

    #[tokio::test]
    async fn factory_cap_spans_concurrent_entries() {
        let mut env = env(
            FactoryFixtureBuilder::default()
                .entries(vec!["ce1".to_string(), "ce2".to_string()])
                .separate_schedds(true)
                .max_glideins(10),
        );
        for entry in ["ce1@g@f", "ce2@g@f"] {
            env.collector.insert(
                FACTORY_POOL,
                signed_request_to(entry, "cred1", 10, 100, now_epoch()),
            );
        }
        let records = env.iterate().await;
        let submitted: u32 = records.iter().map(|r| r.submitted).sum();
        assert_eq!(submitted, 10);
        let queued: usize = ["ce1", "ce2"]
            .iter()
            .map(|entry| {
                env.backend
                    .count(&format!("{FACTORY_SCHEDD}_{entry}"), PilotState::Idle)
            })
            .sum();
        assert_eq!(queued, 10);

        // The cap is reached, so the next iteration adds nothing anywhere.
        let records = env.iterate().await;
        assert!(records.iter().all(|r| r.submitted == 0));
        let global = env
            .collector
            .get(FACTORY_POOL, "glidefactoryglobal", "g@f")
            .unwrap();
        assert_eq!(global.get_int("GlideinMonitorTotalStatusIdle"), Some(10));
    }

    #[tokio::test]
    async fn entry_limits_cap_submissions() {
        let limits = EntryLimits {
            total: PilotLimits {
                max_glideins: 6,
                max_idle: 4,
                max_held: 10,
            },
            ..Default::default()
        };
        let mut env = env(FactoryFixtureBuilder::default().limits(limits));
        env.backend
            .add_pilot(FACTORY_SCHEDD, pilot("ce1", "fe.main", "cred1", PilotState::Running));
        env.request("cred1", 10, 100);
        env.request("cred2", 10, 100);
        let records = env.iterate().await;
        assert_eq!(records[0].requests_accepted, 2);
        assert_eq!(records[0].submitted, 4);
        assert_eq!(env.idle(), 4);
    }

    #[tokio::test]
    async fn downtime_stops_submission_but_cleans_held() {
        let mut env = env(FactoryFixtureBuilder::default());
        env.factory
            .downtime
            .add_period(&DowntimePeriod::new(now_epoch() - 60, None))
            .unwrap();
        let mut held = pilot("ce1", "fe.main", "cred1", PilotState::Held);
        held.hold_code = Some(2);
        held.hold_subcode = Some(17);
        env.backend.add_pilot(FACTORY_SCHEDD, held);
        env.request("cred1", 5, 20);

        let records = env.iterate().await;
        assert_eq!(records[0].state, "Downtime");
        assert!(records[0].in_downtime);
        assert_eq!(records[0].submitted, 0);
        assert_eq!(records[0].removed, 1);
        assert_eq!(env.backend.count(FACTORY_SCHEDD, PilotState::Held), 0);
        let entry = env.collector.get(FACTORY_POOL, "glidefactory", "ce1@g@f").unwrap();
        assert_eq!(entry.get_bool("InDowntime"), Some(true));
    }

    #[tokio::test]
    async fn bad_signature_counts_and_submits_nothing() {
        let mut env = env(FactoryFixtureBuilder::default());
        let mut ad = signed_request(&env.factory, "cred1", 5, 20, now_epoch());
        ad.insert("ReqIdleGlideins", 500);
        env.collector.insert(FACTORY_POOL, ad);
        let records = env.iterate().await;
        assert_eq!(records[0].requests_accepted, 0);
        assert_eq!(records[0].rejected["signature"], 1);
        assert_eq!(records[0].submitted, 0);
        assert_eq!(env.idle(), 0);
        assert_eq!(env.state.entry("ce1").unwrap().rejected_signatures["fe.main"], 1);
    }

    #[tokio::test]
    async fn entries_on_one_schedd_keep_their_budgets() {
        let mut env = env(
            FactoryFixtureBuilder::default()
                .entries(vec!["ce1".to_string(), "ce2".to_string()])
                .max_submits_per_cycle(50),
        );
        for entry in ["ce1@g@f", "ce2@g@f"] {
            env.collector.insert(
                FACTORY_POOL,
                signed_request_to(entry, "cred1", 80, 200, now_epoch()),
            );
        }
        let records = env.iterate().await;
        let submitted: Vec<u32> = records.iter().map(|r| r.submitted).collect();
        assert_eq!(submitted, vec![50, 50]);
        assert_eq!(env.backend.state.get().max_in_flight, 1);
    }

    #[tokio::test]
    async fn withdraw_removes_ads() {
        let mut env = env(FactoryFixtureBuilder::default());
        env.request("cred1", 1, 1);
        env.iterate().await;
        assert!(!env.collector.ads(FACTORY_POOL, "glidefactory").is_empty());
        let failures = withdraw(&env.factory, &mut env.state, &env.transport).await;
        assert_eq!(failures, 0);
        assert!(env.collector.ads(FACTORY_POOL, "glidefactory").is_empty());
        assert!(env.collector.ads(FACTORY_POOL, "glidefactoryclient").is_empty());
        assert!(env.collector.ads(FACTORY_POOL, "glidefactoryglobal").is_empty());
    }
}
