//! One iteration of a Frontend group: census, matching, request computation, credential
//! selection and publication.
use std::collections::{BTreeMap, BTreeSet};

use classad::{ClassAd, Transport, Value};

use crate::census::{EntryDescription, JobClass, PoolCensus, collect};
use crate::common::attrs::TYPE_GLIDECLIENT;
use crate::common::error::ErrorKind;
use crate::common::utils::time::{bounded, now_epoch, now_monotonic};
use crate::credentials::CredentialStore;
use crate::frontend::config::{FrontendSnapshot, GroupSnapshot};
use crate::frontend::history::{EntryHistory, EntryObservation, RemoveExcess};
use crate::frontend::limits::{
    LimitsTriggered, PilotCounts, ScopeCounts, apply_group_cap, compute_glidein_max_run,
    compute_glidein_min_idle,
};
use crate::frontend::plugins::{EntryRequest, PluginState, fair_split};
use crate::frontend::request::{KeyCache, RequestBuilder, RequestSpec};
use crate::frontend::resource::{EntrySummary, client_global_ad, resource_ad};
use crate::matching::{EntryMatch, match_jobs};
use crate::stats::{EntryRecord, IterationRecord, StatsEvent, StatsSink, next_iteration};

/// (pool, MyType, Name) of a published ad.
pub type AdKey = (String, String, String);

fn ad_key(pool: &str, ad: &ClassAd) -> AdKey {
    (
        pool.to_string(),
        ad.my_type().to_string(),
        ad.name().to_string(),
    )
}

/// What a group keeps between iterations. An aborted iteration leaves it untouched.
pub struct GroupState {
    history: BTreeMap<String, EntryHistory>,
    plugin_state: PluginState,
    advertised: BTreeSet<AdKey>,
    keys: KeyCache,
}

impl GroupState {
    /// Fresh state; the credential plugin state is read back from its file.
    pub fn new(frontend: &FrontendSnapshot, group: &GroupSnapshot) -> Self {
        Self {
            history: Default::default(),
            plugin_state: PluginState::load(&group.plugin_state_path),
            advertised: Default::default(),
            keys: KeyCache::new(
                frontend.config.sym_key_cypher,
                frontend.config.sym_key_lifetime,
            ),
        }
    }

    pub fn reconfigure(&mut self, frontend: &FrontendSnapshot) {
        self.keys.reconfigure(
            frontend.config.sym_key_cypher,
            frontend.config.sym_key_lifetime,
        );
    }

    pub fn advertised(&self) -> &BTreeSet<AdKey> {
        &self.advertised
    }

    pub fn history(&self, entry: &str) -> EntryHistory {
        self.history.get(entry).copied().unwrap_or_default()
    }

    pub fn plugin_state(&self) -> &PluginState {
        &self.plugin_state
    }
}

pub struct GroupContext<'a> {
    pub transport: &'a dyn Transport,
    pub credentials: &'a CredentialStore,
    pub stats: &'a dyn StatsSink,
    /// Start of the daemon (epoch seconds).
    pub start_time: i64,
}

/// Everything one iteration wants to publish and remember.
struct Plan {
    ads: Vec<(String, ClassAd)>,
    /// Names of requests published last time, as seen by the census.
    previous_requests: Vec<AdKey>,
    history: BTreeMap<String, EntryHistory>,
    plugin_state: PluginState,
    record: IterationRecord,
}

fn status_count(status: &BTreeMap<String, i64>, name: &str) -> u64 {
    status.get(name).copied().unwrap_or(0).max(0) as u64
}

/// Pilots the Factories report for this group on one Entry.
#[derive(Debug, Clone, Copy, Default)]
struct FactoryStatus {
    idle: u64,
    running: u64,
    held: u64,
    total: u64,
}

impl FactoryStatus {
    fn of(census: &PoolCensus, entry: &str) -> Self {
        let status = census.factory_status(entry);
        let idle = status_count(&status, "Idle");
        let running = status_count(&status, "Running");
        let held = status_count(&status, "Held");
        let total = match status.get("Total") {
            Some(total) => (*total).max(0) as u64,
            None => idle + running + held,
        };
        Self {
            idle,
            running,
            held,
            total,
        }
    }
}

/// Per-Entry targets before credential selection.
struct EntryTarget<'a> {
    entry: &'a EntryDescription,
    matched: EntryMatch,
    idle_class: JobClass,
    effective_idle: u64,
    running_here: u64,
    min_idle: u64,
    max_run: u64,
    remove_excess: RemoveExcess,
    triggered: LimitsTriggered,
}

fn compute_targets<'a>(
    frontend: &FrontendSnapshot,
    group: &GroupSnapshot,
    state: &GroupState,
    census: &'a PoolCensus,
    matched: &crate::matching::MatchResult,
    history: &mut BTreeMap<String, EntryHistory>,
) -> Vec<EntryTarget<'a>> {
    let statuses: BTreeMap<&str, FactoryStatus> = census
        .entries
        .iter()
        .map(|entry| (entry.name.as_str(), FactoryStatus::of(census, &entry.name)))
        .collect();
    let group_counts = statuses
        .values()
        .fold(ScopeCounts::default(), |acc, status| ScopeCounts {
            total: acc.total + status.total,
            idle: acc.idle + status.idle,
        });
    let limits = &group.config.limits;
    let removal = group.config.request_removal;

    let mut targets = Vec::new();
    for entry in &census.entries {
        if entry.public_key.is_none() {
            log::debug!("Entry {} has no usable key, not requesting pilots", entry.name);
            continue;
        }
        let status = statuses.get(entry.name.as_str()).copied().unwrap_or_default();
        let m = matched.entry(&entry.name).cloned().unwrap_or_default();
        let idle_class = if entry.require_voms {
            JobClass::VomsIdle
        } else {
            JobClass::Idle
        };
        let effective_idle = m.prop_cores(idle_class).saturating_sub(status.idle);
        let effective_oldidle = m.prop_cores(JobClass::OldIdle).saturating_sub(status.idle);
        let counts = PilotCounts {
            entry: ScopeCounts {
                total: status.total,
                idle: status.idle,
            },
            group: group_counts,
            frontend: ScopeCounts {
                total: census.glideins.frontend.total,
                idle: census.glideins.frontend.idle,
            },
            global: ScopeCounts {
                total: census.glideins.global.total,
                idle: census.glideins.global.idle,
            },
        };

        let mut triggered = LimitsTriggered::new();
        let mut min_idle = compute_glidein_min_idle(
            effective_idle,
            effective_oldidle,
            &counts,
            limits,
            &frontend.config.limits,
            removal.is_some(),
            &mut triggered,
        );
        let running_here = census.running_here(&entry.name);
        let mut max_run =
            compute_glidein_max_run(m.prop(idle_class), status.idle, running_here, limits);
        if removal.is_some() && !group.config.excess_only {
            max_run = 0;
        }
        if entry.in_downtime {
            min_idle = 0;
        }

        let observed = state.history(&entry.name).observe(EntryObservation {
            idle_jobs: m.total(idle_class),
            idle_glideins: status.idle,
            total_glideins: status.total,
        });
        history.insert(entry.name.clone(), observed);
        log::debug!(
            "Entry {}: effective idle {}, min idle {}, max run {}, pilots {}/{}/{} idle/running/held",
            entry.name,
            effective_idle,
            min_idle,
            max_run,
            status.idle,
            status.running,
            status.held
        );
        targets.push(EntryTarget {
            entry,
            idle_class,
            effective_idle,
            running_here,
            min_idle,
            max_run,
            remove_excess: removal.unwrap_or_else(|| observed.remove_excess()),
            triggered,
            matched: m,
        });
    }

    let mut min_idles: Vec<u64> = targets.iter().map(|t| t.min_idle).collect();
    apply_group_cap(
        &mut min_idles,
        limits.total.max_vms_idle.saturating_sub(group_counts.idle),
    );
    let mut max_runs: Vec<u64> = targets.iter().map(|t| t.max_run).collect();
    apply_group_cap(&mut max_runs, limits.total.max_glideins);
    for (target, (min_idle, max_run)) in targets.iter_mut().zip(min_idles.into_iter().zip(max_runs)) {
        target.min_idle = min_idle;
        target.max_run = max_run;
    }
    targets
}

fn monitor_counters(
    target: &EntryTarget,
    census: &PoolCensus,
    credential_id: &str,
    scaled_running: u64,
) -> BTreeMap<String, Value> {
    let m = &target.matched;
    let counters = census.counters(&target.entry.name, credential_id, &target.entry.name);
    [
        ("JobsIdle", m.total(target.idle_class)),
        ("JobsIdleMatching", m.prop(target.idle_class)),
        ("JobsIdleEffective", target.effective_idle),
        ("JobsOldIdle", m.total(JobClass::OldIdle)),
        ("JobsRunning", m.total(JobClass::Running)),
        ("JobsRunHere", target.running_here),
        ("GlideinsIdle", counters.idle_glideins),
        ("GlideinsRunning", counters.running_glideins),
        ("GlideinsHeld", counters.held_glideins),
        (
            "GlideinsTotal",
            counters.idle_glideins + counters.running_glideins + counters.held_glideins,
        ),
        ("GlideinsIdleCores", counters.idle_cores),
        ("GlideinsRunningCores", counters.running_cores),
        ("GlideinsTotalCores", counters.total_cores),
        ("ScaledRunning", scaled_running),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), Value::from(value)))
    .collect()
}

async fn build_plan(
    frontend: &FrontendSnapshot,
    group: &GroupSnapshot,
    state: &GroupState,
    ctx: &GroupContext<'_>,
    mut record: IterationRecord,
) -> crate::Result<Plan> {
    let census = collect(ctx.transport, &frontend.census_query(group)).await?;
    let matched = match_jobs(&group.policy, &census.jobs, &census.entries, frontend.fan_out()).await?;
    let now = census.time;

    let mut plugin_state = state.plugin_state.clone();
    group
        .plugin
        .begin_iteration(&mut plugin_state, &census.jobs.users, now);

    let mut history = BTreeMap::new();
    let targets = compute_targets(frontend, group, state, &census, &matched, &mut history);

    let builder = RequestBuilder {
        frontend,
        group,
        credentials: ctx.credentials,
        keys: &state.keys,
        now,
        start_time: ctx.start_time,
    };
    let mut ads = Vec::new();
    for target in &targets {
        let entry = target.entry;
        let shares = group.plugin.select(
            &mut plugin_state,
            ctx.credentials.credentials(),
            &EntryRequest {
                entry: &entry.name,
                trust_domain: &entry.trust_domain,
                auth_methods: &entry.auth_methods,
                min_idle: target.min_idle,
                max_run: target.max_run,
                idle_users: &target.matched.idle_users,
            },
        );
        if shares.is_empty() && target.min_idle > 0 {
            log::warn!(
                "Group {}: no eligible credential for entry {} (trust domain {})",
                group.name(),
                entry.name,
                entry.trust_domain
            );
        }

        let mut requests = 0;
        let share_count = shares.len() as u64;
        for (index, share) in shares.iter().enumerate() {
            let scaled_running = fair_split(index as u64 + 1, target.running_here, share_count);
            let spec = RequestSpec {
                credential_id: share.credential_id.clone(),
                idle: share.idle,
                max_run: share.max_run,
                remove_excess: target.remove_excess,
                monitor: monitor_counters(target, &census, &share.credential_id, scaled_running),
            };
            match builder.build(entry, &spec).await {
                Ok(ad) => {
                    ads.push((entry.factory_pool.clone(), ad));
                    requests += 1;
                }
                Err(error) => log::warn!(
                    "Group {}: skipping credential {} for entry {}: {error}",
                    group.name(),
                    share.credential_id,
                    entry.name
                ),
            }
        }

        let m = &target.matched;
        let glideins = census.glideins.entry(&entry.name);
        let summary = EntrySummary {
            jobs_idle: m.total(target.idle_class),
            jobs_idle_matching: m.prop(target.idle_class),
            jobs_idle_effective: target.effective_idle,
            jobs_idle_old: m.total(JobClass::OldIdle),
            jobs_idle_hereonly: m.hereonly(target.idle_class),
            jobs_idle_unique: m.idle_users.len() as u64,
            jobs_running: m.total(JobClass::Running),
            jobs_run_here: target.running_here,
            glideins,
            request_idle: target.min_idle,
            request_max_run: target.max_run,
            limits_triggered: target.triggered.clone(),
        };
        ads.push((
            frontend.config.user_pool.clone(),
            resource_ad(
                frontend,
                group,
                entry,
                &summary,
                &census,
                matched.match_errors,
                now,
                ctx.start_time,
            ),
        ));
        record.entries.push(EntryRecord {
            entry: entry.name.clone(),
            prop_idle: m.prop(target.idle_class),
            hereonly_idle: m.hereonly(target.idle_class),
            effective_idle: target.effective_idle,
            min_idle: target.min_idle,
            max_run: target.max_run,
            glideins_total: glideins.total,
            glideins_idle: glideins.idle,
            glideins_running: glideins.running,
            requests,
            limits_triggered: target.triggered.clone(),
        });
    }

    let factory_pools: BTreeSet<&str> = frontend
        .config
        .factories
        .iter()
        .map(|factory| factory.pool.as_str())
        .collect();
    for pool in factory_pools {
        ads.push((pool.to_string(), client_global_ad(frontend, group, pool, now)?));
    }

    record.jobs_idle = census.jobs.count(JobClass::Idle);
    record.jobs_running = census.jobs.count(JobClass::Running);
    record.unmatched_idle = matched.unmatched(JobClass::Idle);
    record.unmatched_running = matched.unmatched(JobClass::Running);
    record.match_errors = matched.match_errors;

    let previous_requests = census
        .own_requests
        .sorted()
        .into_iter()
        .map(|(name, (pool, _))| (pool.clone(), TYPE_GLIDECLIENT.to_string(), name.clone()))
        .collect();
    Ok(Plan {
        ads,
        previous_requests,
        history,
        plugin_state,
        record,
    })
}

/// Runs one iteration of a group and emits its record.
///
/// The census, matching and request building must finish within the iteration deadline;
/// otherwise nothing is published and the state stays as it was. Publication failures are
/// counted but do not abort the iteration.
pub async fn run_group_iteration(
    frontend: &FrontendSnapshot,
    group: &GroupSnapshot,
    state: &mut GroupState,
    ctx: &GroupContext<'_>,
) -> IterationRecord {
    let started = now_monotonic();
    let record = IterationRecord {
        iteration: next_iteration(),
        group: group.name().to_string(),
        time: now_epoch(),
        ..Default::default()
    };
    let outcome = tokio::time::timeout(
        frontend.iteration_deadline,
        build_plan(frontend, group, state, ctx, record.clone()),
    )
    .await;

    let mut record = match outcome {
        Ok(Ok(plan)) => publish(frontend, group, state, ctx, plan).await,
        Ok(Err(error)) => IterationRecord {
            aborted: true,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            ..record
        },
        Err(_) => IterationRecord {
            aborted: true,
            error_kind: Some(ErrorKind::Deadline),
            error: Some(format!(
                "Iteration exceeded its deadline of {}",
                humantime::format_duration(frontend.iteration_deadline)
            )),
            ..record
        },
    };
    record.duration_ms = (now_monotonic() - started).as_millis() as u64;
    ctx.stats.emit(StatsEvent::GroupIteration(record.clone()));
    record
}

async fn publish(
    frontend: &FrontendSnapshot,
    group: &GroupSnapshot,
    state: &mut GroupState,
    ctx: &GroupContext<'_>,
    plan: Plan,
) -> IterationRecord {
    let Plan {
        ads,
        previous_requests,
        history,
        plugin_state,
        mut record,
    } = plan;
    let timeout = frontend.config.query_timeout;

    let mut advertised = BTreeSet::new();
    for (pool, ad) in &ads {
        let key = ad_key(pool, ad);
        match bounded(ctx.transport.advertise(pool, ad), timeout).await {
            Ok(()) => {
                if key.1 == TYPE_GLIDECLIENT {
                    record.requests_published += 1;
                }
            }
            Err(error) => {
                log::warn!("Cannot advertise {} {} to {pool}: {error}", key.1, key.2);
                record.publish_errors += 1;
            }
        }
        advertised.insert(key);
    }

    let stale: BTreeSet<AdKey> = state
        .advertised
        .iter()
        .cloned()
        .chain(previous_requests)
        .filter(|key| !advertised.contains(key))
        .collect();
    for key in stale {
        let (pool, my_type, name) = &key;
        match bounded(ctx.transport.invalidate(pool, my_type, name), timeout).await {
            Ok(()) => {
                if my_type == TYPE_GLIDECLIENT {
                    record.requests_invalidated += 1;
                }
            }
            Err(error) => {
                log::warn!("Cannot invalidate {my_type} {name} in {pool}: {error}");
                record.publish_errors += 1;
                advertised.insert(key);
            }
        }
    }

    state.advertised = advertised;
    state.history = history;
    state.plugin_state = plugin_state;
    if let Err(error) = state.plugin_state.store(&group.plugin_state_path) {
        log::warn!("Cannot store credential plugin state: {error}");
    }
    state.keys.expire();
    ctx.credentials.expire_cache();
    record
}

/// Invalidates every ad the group published. Returns the number of failed invalidations.
pub async fn withdraw(
    frontend: &FrontendSnapshot,
    state: &mut GroupState,
    transport: &dyn Transport,
) -> u32 {
    let mut failures = 0;
    for (pool, my_type, name) in std::mem::take(&mut state.advertised) {
        if let Err(error) = bounded(
            transport.invalidate(&pool, &my_type, &name),
            frontend.config.query_timeout,
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
    use std::time::Duration;

    use classad::{MemoryCollector, MemoryTransport, TransportError};
    use tempfile::TempDir;

    use super::{GroupContext, GroupState, run_group_iteration, withdraw};
    use crate::common::error::ErrorKind;
    use crate::frontend::history::RemoveExcess;
    use crate::frontend::limits::GroupLimits;
    use crate::frontend::plugins::PluginKind;
    use crate::stats::IterationRecord;
    use crate::tests::utils::{
        FACTORY_POOL, FRONTEND_IDENTITY, FrontendFixtureBuilder, FrontendSetup, RecordingSink,
        entry_ad, factory_client_ad, frontend_setup, job_ad,
    };

    struct Env {
        _dir: TempDir,
        setup: FrontendSetup,
        collector: MemoryCollector,
        transport: MemoryTransport,
        sink: RecordingSink,
        state: GroupState,
    }

    fn env(builder: FrontendFixtureBuilder) -> Env {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let setup = frontend_setup(dir.path(), builder);
        let collector = MemoryCollector::new();
        collector.set_jobs("schedd1", vec![]);
        let state = GroupState::new(&setup.snapshot, setup.group());
        Env {
            _dir: dir,
            transport: collector.client(FRONTEND_IDENTITY),
            collector,
            setup,
            sink: RecordingSink::default(),
            state,
        }
    }

    impl Env {
        async fn iterate(&mut self) -> IterationRecord {
            let credentials = self.setup.credentials(self.setup.group());
            let ctx = GroupContext {
                transport: &self.transport,
                credentials: &credentials,
                stats: &self.sink,
                start_time: 1,
            };
            run_group_iteration(&self.setup.snapshot, self.setup.group(), &mut self.state, &ctx)
                .await
        }

        fn requests(&self) -> Vec<classad::ClassAd> {
            self.collector.ads(FACTORY_POOL, "glideclient")
        }
    }

    fn idle_jobs(count: usize) -> Vec<classad::ClassAd> {
        (0..count).map(|i| job_ad(i, "alice", 1)).collect()
    }

    #[tokio::test]
    async fn idle_jobs_produce_requests() {
        let mut env = env(FrontendFixtureBuilder::default());
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(10));

        let record = env.iterate().await;
        assert!(!record.aborted, "{:?}", record.error);
        assert_eq!(record.jobs_idle, 10);
        assert_eq!(record.requests_published, 1);
        assert_eq!(record.entries[0].effective_idle, 10);
        assert_eq!(record.entries[0].min_idle, 10);

        let requests = env.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name(), "cred1_ce1@g@f@main@fe");
        assert_eq!(requests[0].get_int("ReqIdleGlideins"), Some(10));
        assert_eq!(requests[0].get_int("GlideinMonitorJobsIdle"), Some(10));
        assert_eq!(
            requests[0].authenticated_identity(),
            Some(FRONTEND_IDENTITY)
        );
        assert!(
            env.collector
                .get("user.example.org", "glideresource", "ce1@g@f@fe.main")
                .is_some()
        );
        assert!(
            env.collector
                .get(FACTORY_POOL, "glideclientglobal", "fe.main@wms.example.org")
                .is_some()
        );
        assert_eq!(env.sink.records().len(), 1);
    }

    #[tokio::test]
    async fn unchanged_inputs_publish_identical_requests() {
        let mut env = env(FrontendFixtureBuilder::default());
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(4));
        env.iterate().await;
        let first = env.requests();
        env.iterate().await;
        let second = env.requests();
        let strip = |ads: Vec<classad::ClassAd>| {
            ads.into_iter()
                .map(|mut ad| {
                    ad.remove("CurrentTime");
                    ad.remove("ReqExpiresAt");
                    ad.remove("ReqSignature");
                    ad
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(first), strip(second));
    }

    #[tokio::test]
    async fn factory_reported_idle_pilots_are_subtracted() {
        let mut env = env(FrontendFixtureBuilder::default());
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector
            .insert(FACTORY_POOL, factory_client_ad("ce1@g@f", "cred1", "fe.main", 3, 0));
        env.collector.set_jobs("schedd1", idle_jobs(10));

        let record = env.iterate().await;
        assert_eq!(record.entries[0].effective_idle, 7);
        assert_eq!(record.entries[0].min_idle, 7);
    }

    #[tokio::test]
    async fn downtime_and_removal_zero_the_request() {
        let mut env = env(FrontendFixtureBuilder::default());
        env.collector
            .insert(FACTORY_POOL, entry_ad("ce1@g@f").with("InDowntime", true));
        env.collector.set_jobs("schedd1", idle_jobs(10));
        let record = env.iterate().await;
        assert_eq!(record.entries[0].min_idle, 0);
        assert!(record.entries[0].max_run > 0);

        let mut env = env_with_removal();
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(10));
        env.iterate().await;
        let request = &env.requests()[0];
        assert_eq!(request.get_int("ReqIdleGlideins"), Some(0));
        assert_eq!(request.get_int("ReqMaxGlideins"), Some(0));
        assert_eq!(request.get_str("ReqRemoveExcess"), Some("ALL"));
    }

    fn env_with_removal() -> Env {
        env(FrontendFixtureBuilder::default().request_removal(Some(RemoveExcess::All)))
    }

    #[tokio::test]
    async fn group_cap_limits_idle_sum() {
        let mut limits = GroupLimits::default();
        limits.total.max_vms_idle = 6;
        limits.total.curb_vms_idle = 100;
        let mut env = env(FrontendFixtureBuilder::default().group_limits(limits));
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.insert(FACTORY_POOL, entry_ad("ce2@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(20));

        let record = env.iterate().await;
        let total: u64 = record.entries.iter().map(|e| e.min_idle).sum();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn vanished_entries_are_invalidated() {
        let mut env = env(FrontendFixtureBuilder::default());
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.insert(FACTORY_POOL, entry_ad("ce2@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(4));
        env.iterate().await;
        assert_eq!(env.requests().len(), 2);

        env.collector.remove(FACTORY_POOL, "glidefactory", "ce2@g@f");
        let record = env.iterate().await;
        assert_eq!(record.requests_invalidated, 1);
        let names: Vec<String> = env.requests().iter().map(|ad| ad.name().to_string()).collect();
        assert_eq!(names, vec!["cred1_ce1@g@f@main@fe".to_string()]);
        assert!(
            env.collector
                .get("user.example.org", "glideresource", "ce2@g@f@fe.main")
                .is_none()
        );
    }

    #[tokio::test]
    async fn failed_census_publishes_nothing() {
        let mut env = env(FrontendFixtureBuilder::default());
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(4));
        env.collector
            .fail_with(Some(TransportError::Unreachable("down".to_string())));
        let record = env.iterate().await;
        assert!(record.aborted);
        assert!(record.error.is_some());
        assert_eq!(record.error_kind, Some(ErrorKind::TransportTransient));
        assert_eq!(env.collector.advertise_count(), 0);
        assert!(env.state.advertised().is_empty());
        assert!(env.sink.records()[0].aborted);
    }

    #[tokio::test]
    async fn slow_census_hits_the_deadline() {
        let mut env = env(
            FrontendFixtureBuilder::default().loop_delay(Duration::from_millis(100)),
        );
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.set_delay(Some(Duration::from_millis(500)));
        let record = env.iterate().await;
        assert!(record.aborted);
        assert_eq!(record.error_kind, Some(ErrorKind::Deadline));
        assert!(record.error.unwrap().contains("deadline"));
        assert_eq!(env.collector.advertise_count(), 0);
    }

    #[tokio::test]
    async fn all_credentials_share_the_request() {
        let mut env = env(
            FrontendFixtureBuilder::default()
                .plugin(PluginKind::ProxyAll)
                .credentials(vec!["cred1".to_string(), "cred2".to_string()]),
        );
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(9));
        let record = env.iterate().await;
        assert_eq!(record.requests_published, 2);
        let idle: i64 = env
            .requests()
            .iter()
            .map(|ad| ad.get_int("ReqIdleGlideins").unwrap())
            .sum();
        assert_eq!(idle, 9);
        assert!(env.setup.group().plugin_state_path.exists());
    }

    #[tokio::test]
    async fn withdraw_invalidates_everything() {
        let mut env = env(FrontendFixtureBuilder::default());
        env.collector.insert(FACTORY_POOL, entry_ad("ce1@g@f"));
        env.collector.set_jobs("schedd1", idle_jobs(4));
        env.iterate().await;
        assert!(!env.requests().is_empty());
        let failures = withdraw(&env.setup.snapshot, &mut env.state, &env.transport).await;
        assert_eq!(failures, 0);
        assert!(env.requests().is_empty());
        assert!(env.collector.ads("user.example.org", "glideresource").is_empty());
    }
}
