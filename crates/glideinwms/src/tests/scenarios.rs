//! A Frontend group and a Factory talking through one in-memory collector.
use std::time::Duration;

use classad::{ClassAd, MemoryCollector, MemoryTransport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::common::utils::time::now_epoch;
use crate::downtime::DowntimePeriod;
use crate::factory::config::{EntryLimits, PilotLimits};
use crate::factory::{FactoryContext, FactorySnapshot, FactoryState, run_factory_iteration};
use crate::frontend::limits::GroupLimits;
use crate::frontend::plugins::PluginKind;
use crate::frontend::{GroupContext, GroupState, run_group_iteration};
use crate::stats::{EntryIterationRecord, IterationRecord};
use crate::submit::{PilotState, ScheddRegistry};
use crate::tests::utils::{
    FACTORY_IDENTITY, FACTORY_POOL, FACTORY_SCHEDD, FRONTEND_IDENTITY, FactoryFixtureBuilder,
    FrontendFixtureBuilder, FrontendSetup, MockSubmitBackend, RecordingSink, factory_setup,
    frontend_setup, job_ad, pilot,
};

struct Pool {
    _frontend_dir: TempDir,
    _factory_dir: TempDir,
    frontend: FrontendSetup,
    group_state: GroupState,
    factory: FactorySnapshot,
    factory_state: FactoryState,
    collector: MemoryCollector,
    frontend_transport: MemoryTransport,
    factory_transport: MemoryTransport,
    backend: MockSubmitBackend,
    registry: ScheddRegistry,
    sink: RecordingSink,
}

fn pool(frontend: FrontendFixtureBuilder, factory: FactoryFixtureBuilder) -> Pool {
    let frontend_dir = TempDir::with_prefix("gwms-fe").unwrap();
    let factory_dir = TempDir::with_prefix("gwms-f").unwrap();
    let frontend = frontend_setup(frontend_dir.path(), frontend);
    let factory = factory_setup(factory_dir.path(), factory);
    let collector = MemoryCollector::new();
    collector.set_jobs("schedd1", vec![]);
    Pool {
        _frontend_dir: frontend_dir,
        _factory_dir: factory_dir,
        group_state: GroupState::new(&frontend.snapshot, frontend.group()),
        frontend,
        factory_state: FactoryState::new(&factory),
        registry: ScheddRegistry::new(factory.config.max_submits_per_cycle),
        factory,
        frontend_transport: collector.client(FRONTEND_IDENTITY),
        factory_transport: collector.client(FACTORY_IDENTITY),
        collector,
        backend: MockSubmitBackend::new(),
        sink: RecordingSink::default(),
    }
}

/// Idle jobs asking for 1 core and 2 GB each.
fn idle_jobs(count: usize) -> Vec<ClassAd> {
    (0..count)
        .map(|i| job_ad(i, "alice", 1).with("RequestMemory", 2048))
        .collect()
}

fn entries(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

impl Pool {
    async fn frontend_iteration(&mut self) -> IterationRecord {
        let group = self.frontend.group();
        let credentials = self.frontend.credentials(group);
        let ctx = GroupContext {
            transport: &self.frontend_transport,
            credentials: &credentials,
            stats: &self.sink,
            start_time: 1,
        };
        run_group_iteration(&self.frontend.snapshot, group, &mut self.group_state, &ctx).await
    }

    async fn factory_iteration(&mut self) -> Vec<EntryIterationRecord> {
        let ctx = FactoryContext {
            transport: &self.factory_transport,
            backend: &self.backend,
            registry: &self.registry,
            stats: &self.sink,
            start_time: 1,
        };
        run_factory_iteration(&self.factory, &mut self.factory_state, &ctx).await
    }

    fn requests(&self) -> Vec<ClassAd> {
        self.collector.ads(FACTORY_POOL, "glideclient")
    }

    fn requested_idle(&self) -> i64 {
        self.requests()
            .iter()
            .filter_map(|ad| ad.get_int("ReqIdleGlideins"))
            .sum()
    }

    fn requests_to(&self, entry: &str) -> Vec<ClassAd> {
        self.requests()
            .into_iter()
            .filter(|ad| ad.get_str("ReqGlidein") == Some(entry))
            .collect()
    }
}

#[tokio::test]
async fn idle_jobs_become_pilots() {
    let mut limits = GroupLimits::default();
    limits.entry.max_idle = 5;
    limits.reserve_idle = 1;
    let mut pool = pool(
        FrontendFixtureBuilder::default().group_limits(limits),
        FactoryFixtureBuilder::default(),
    );
    pool.collector.set_jobs("schedd1", idle_jobs(10));

    pool.factory_iteration().await;
    let record = pool.frontend_iteration().await;
    assert!(!record.aborted, "{:?}", record.error);
    let requests = pool.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].get_int("ReqIdleGlideins"), Some(5));
    assert!(requests[0].get_int("ReqMaxGlideins").unwrap() >= 10);

    let records = pool.factory_iteration().await;
    assert_eq!(records[0].requests_accepted, 1);
    assert_eq!(records[0].submitted, 5);
    assert_eq!(pool.backend.count(FACTORY_SCHEDD, PilotState::Idle), 5);

    // The Frontend sees the pilots the Factory reports back.
    let record = pool.frontend_iteration().await;
    assert_eq!(record.entries[0].effective_idle, 5);
}

#[tokio::test]
async fn two_credentials_on_two_entries() {
    let mut group_limits = GroupLimits::default();
    group_limits.total.max_vms_idle = 8;
    group_limits.total.curb_vms_idle = 100;
    let entry_limits = EntryLimits {
        total: PilotLimits {
            max_glideins: 100,
            max_idle: 3,
            max_held: 10,
        },
        ..Default::default()
    };
    let mut pool = pool(
        FrontendFixtureBuilder::default()
            .plugin(PluginKind::ProxyAll)
            .credentials(entries(&["cred1", "cred2"]))
            .group_limits(group_limits),
        FactoryFixtureBuilder::default()
            .entries(entries(&["ce1", "ce2"]))
            .limits(entry_limits),
    );
    pool.collector.set_jobs("schedd1", idle_jobs(10));

    pool.factory_iteration().await;
    let record = pool.frontend_iteration().await;
    assert_eq!(record.requests_published, 4);
    let requested = pool.requested_idle();
    assert!(requested <= 8, "requested {requested}");
    for entry in ["ce1@g@f", "ce2@g@f"] {
        assert_eq!(pool.requests_to(entry).len(), 2);
    }

    let records = pool.factory_iteration().await;
    let submitted: u32 = records.iter().map(|r| r.submitted).sum();
    assert!(records.iter().all(|r| r.submitted <= 3));
    assert!(i64::from(submitted) <= requested);
    assert!(submitted > 0);
}

#[tokio::test]
async fn entry_in_downtime_gets_no_pilots() {
    let mut pool = pool(
        FrontendFixtureBuilder::default(),
        FactoryFixtureBuilder::default(),
    );
    let mut period = DowntimePeriod::new(now_epoch() - 60, None);
    period.entry = "ce1".to_string();
    pool.factory.downtime.add_period(&period).unwrap();
    let mut held = pilot("ce1", "fe.main", "cred1", PilotState::Held);
    held.hold_code = Some(2);
    held.hold_subcode = Some(17);
    pool.backend.add_pilot(FACTORY_SCHEDD, held);
    pool.collector.set_jobs("schedd1", idle_jobs(10));

    let records = pool.factory_iteration().await;
    assert!(records[0].in_downtime);
    assert_eq!(records[0].removed, 1);
    let entry = pool
        .collector
        .get(FACTORY_POOL, "glidefactory", "ce1@g@f")
        .unwrap();
    assert_eq!(entry.get_bool("InDowntime"), Some(true));

    pool.frontend_iteration().await;
    assert_eq!(pool.requested_idle(), 0);
    let records = pool.factory_iteration().await;
    assert_eq!(records[0].submitted, 0);
    assert!(pool.backend.pilots(FACTORY_SCHEDD).is_empty());
}

#[tokio::test]
async fn tampered_request_is_rejected() {
    let mut pool = pool(
        FrontendFixtureBuilder::default(),
        FactoryFixtureBuilder::default(),
    );
    pool.collector.set_jobs("schedd1", idle_jobs(4));
    pool.factory_iteration().await;
    pool.frontend_iteration().await;
    let records = pool.factory_iteration().await;
    assert_eq!(records[0].submitted, 4);

    let mut request = pool.requests().remove(0);
    request.insert("ReqIdleGlideins", 500);
    pool.collector.insert(FACTORY_POOL, request);
    let before = pool.backend.pilots(FACTORY_SCHEDD);

    let records = pool.factory_iteration().await;
    assert_eq!(records[0].requests_accepted, 0);
    assert_eq!(records[0].rejected["signature"], 1);
    assert_eq!(records[0].submitted, 0);
    assert_eq!(pool.backend.pilots(FACTORY_SCHEDD), before);
    assert!(pool.backend.state.get().removed.is_empty());
    let client = pool
        .collector
        .get(FACTORY_POOL, "glidefactoryclient", "cred1_ce1@g@f@fe.main")
        .unwrap();
    assert_eq!(client.get_int("GlideinMonitorReqRejectedSignature"), Some(1));
    assert_eq!(client.get_int("GlideinMonitorStatusIdle"), Some(4));
}

#[tokio::test]
async fn late_iteration_leaves_requests_alone() {
    let mut pool = pool(
        FrontendFixtureBuilder::default().loop_delay(Duration::from_millis(200)),
        FactoryFixtureBuilder::default(),
    );
    pool.collector.set_jobs("schedd1", idle_jobs(4));
    pool.factory_iteration().await;
    let record = pool.frontend_iteration().await;
    assert!(!record.aborted, "{:?}", record.error);
    let published = pool.requests();
    let advertised = pool.collector.advertise_count();

    pool.collector.set_delay(Some(Duration::from_millis(500)));
    let record = pool.frontend_iteration().await;
    assert!(record.aborted);
    assert_eq!(pool.collector.advertise_count(), advertised);
    assert_eq!(pool.requests(), published);
    assert!(pool.sink.records().last().unwrap().aborted);
}

#[tokio::test]
async fn shared_schedd_serves_entries_in_turn() {
    let mut pool = pool(
        FrontendFixtureBuilder::default(),
        FactoryFixtureBuilder::default()
            .entries(entries(&["ce1", "ce2"]))
            .max_submits_per_cycle(50),
    );
    pool.backend.state.get_mut().submit_delay = Some(Duration::from_millis(2));
    pool.collector.set_jobs("schedd1", idle_jobs(200));

    pool.factory_iteration().await;
    pool.frontend_iteration().await;
    for entry in ["ce1@g@f", "ce2@g@f"] {
        let requests = pool.requests_to(entry);
        assert!(requests[0].get_int("ReqIdleGlideins").unwrap() >= 50);
    }

    let records = pool.factory_iteration().await;
    let submitted: Vec<u32> = records.iter().map(|r| r.submitted).collect();
    assert_eq!(submitted, vec![50, 50]);
    let state = pool.backend.state.get();
    assert_eq!(state.max_in_flight, 1);
    assert!(state.submissions.iter().all(|s| s.schedd == FACTORY_SCHEDD));
}

#[tokio::test]
async fn reconfigure_with_same_config_keeps_ads() {
    let mut pool = pool(
        FrontendFixtureBuilder::default(),
        FactoryFixtureBuilder::default(),
    );
    pool.collector.set_jobs("schedd1", idle_jobs(3));
    pool.factory_iteration().await;
    pool.frontend_iteration().await;
    pool.factory_iteration().await;

    let strip = |mut ad: ClassAd| {
        ad.remove("CurrentTime");
        ad
    };
    let before: Vec<ClassAd> = pool
        .collector
        .ads(FACTORY_POOL, "glidefactory")
        .into_iter()
        .map(strip)
        .collect();
    pool.factory_state.reconfigure(&pool.factory);
    pool.group_state.reconfigure(&pool.frontend.snapshot);
    pool.factory_iteration().await;
    let after: Vec<ClassAd> = pool
        .collector
        .ads(FACTORY_POOL, "glidefactory")
        .into_iter()
        .map(strip)
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn empty_queue_requests_nothing() {
    let mut pool = pool(
        FrontendFixtureBuilder::default(),
        FactoryFixtureBuilder::default().entries(entries(&["ce1", "ce2"])),
    );
    pool.factory_iteration().await;
    let record = pool.frontend_iteration().await;
    assert!(!record.aborted, "{:?}", record.error);
    for request in pool.requests() {
        assert_eq!(request.get_int("ReqIdleGlideins"), Some(0));
        assert_eq!(request.get_int("ReqMaxGlideins"), Some(0));
    }
    let records = pool.factory_iteration().await;
    assert!(records.iter().all(|r| r.submitted == 0));
}

#[tokio::test]
async fn submissions_stay_within_requests_and_headroom() {
    let mut rng = StdRng::seed_from_u64(0x67776d73);
    for case in 0..12 {
        let jobs = rng.random_range(0..40usize);
        let entry_count = rng.random_range(1..=3usize);
        let credential_count = rng.random_range(1..=2usize);
        let running = rng.random_range(0..5u64);
        let limits = EntryLimits {
            total: PilotLimits {
                max_glideins: rng.random_range(1..20u64),
                max_idle: rng.random_range(1..20u64),
                max_held: 10,
            },
            ..Default::default()
        };
        let plugin = if rng.random_bool(0.5) {
            PluginKind::ProxyAll
        } else {
            PluginKind::ProxyFirst
        };
        let names: Vec<String> = (1..=entry_count).map(|i| format!("ce{i}")).collect();
        let credentials: Vec<String> = (1..=credential_count).map(|i| format!("cred{i}")).collect();

        let mut pool = pool(
            FrontendFixtureBuilder::default()
                .plugin(plugin)
                .credentials(credentials),
            FactoryFixtureBuilder::default()
                .entries(names.clone())
                .limits(limits.clone()),
        );
        for _ in 0..running {
            pool.backend
                .add_pilot(FACTORY_SCHEDD, pilot("ce1", "fe.main", "cred1", PilotState::Running));
        }
        pool.collector.set_jobs("schedd1", idle_jobs(jobs));

        pool.factory_iteration().await;
        let record = pool.frontend_iteration().await;
        assert!(!record.aborted, "case {case}: {:?}", record.error);
        let requested = pool.requested_idle();
        if jobs == 0 {
            assert_eq!(requested, 0, "case {case}");
        }

        let records = pool.factory_iteration().await;
        let mut submitted = 0;
        for record in &records {
            let current = if record.entry == "ce1" { running } else { 0 };
            let headroom = limits.total.max_glideins.saturating_sub(current);
            assert!(
                u64::from(record.submitted) <= headroom,
                "case {case}: entry {} submitted {} with headroom {headroom}",
                record.entry,
                record.submitted
            );
            assert!(u64::from(record.submitted) <= limits.total.max_idle);
            submitted += i64::from(record.submitted);
        }
        assert!(
            submitted <= requested,
            "case {case}: submitted {submitted}, requested {requested}"
        );
    }
}
