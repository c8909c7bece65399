use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use classad::{ClassAd, Expression, Map, WrappedRcRefCell};
use derive_builder::Builder;
use log::LevelFilter;

use crate::census::FactorySource;
use crate::common::config::ValidatedConfig;
use crate::common::utils::time::now_epoch;
use crate::common::workdir::WorkDir;
use crate::credentials::{CredentialConfig, CredentialStore, CredentialType};
use crate::crypto::{Cypher, EntryKeyPair, SigningKey, SymKey, sign_ad};
use crate::factory::config::{
    AllowedFrontend, EntryConfig, EntryLimits, FactoryConfig, FactorySnapshot, FrontendAuth,
    HeldPolicy,
};
use crate::frontend::config::{
    FrontendConfig, FrontendSnapshot, GroupConfig, GroupSnapshot, SigningKeyConfig,
};
use crate::frontend::history::RemoveExcess;
use crate::frontend::limits::{FrontendLimits, GroupLimits};
use crate::frontend::plugins::PluginKind;
use crate::matching::MatchingConfig;
use crate::stats::{EntryIterationRecord, IterationRecord, StatsEvent, StatsSink};
use crate::submit::{
    PilotRecord, PilotState, RemoveMode, SubmitBackend, SubmitFuture, SubmitOutcome,
    SubmitRequest,
};

pub fn init_logging() {
    let _ = env_logger::Builder::default()
        .is_test(true)
        .filter(None, LevelFilter::Debug)
        .try_init();
}

fn load_key(cell: &'static OnceLock<EntryKeyPair>, pem: &str) -> EntryKeyPair {
    cell.get_or_init(|| EntryKeyPair::from_pem(pem).unwrap())
        .clone()
}

/// RSA key pair of the test Entries. Generating RSA keys is slow, so the keys are fixed.
pub fn entry_key() -> EntryKeyPair {
    static KEY: OnceLock<EntryKeyPair> = OnceLock::new();
    load_key(&KEY, include_str!("data/entry_key.pem"))
}

pub fn other_entry_key() -> EntryKeyPair {
    static KEY: OnceLock<EntryKeyPair> = OnceLock::new();
    load_key(&KEY, include_str!("data/other_key.pem"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub schedd: String,
    pub entry: String,
    pub client_name: String,
    pub credential_id: String,
    pub requested: u32,
    pub submitted: u32,
}

#[derive(Default)]
pub struct SubmitState {
    pub queues: Map<String, Vec<PilotRecord>>,
    pub next_cluster: u64,
    pub submissions: Vec<Submission>,
    /// Every submit call stops after this many pilots and reports an error.
    pub fail_after: Option<u32>,
    pub submit_delay: Option<Duration>,
    in_flight: Map<String, usize>,
    /// Highest number of concurrent submit calls observed on one schedd.
    pub max_in_flight: usize,
    pub removed: Vec<(String, RemoveMode)>,
    pub released: Vec<String>,
    pub reconfigured: Vec<String>,
}

/// Scripted schedd keeping pilots in memory.
#[derive(Clone, Default)]
pub struct MockSubmitBackend {
    pub state: WrappedRcRefCell<SubmitState>,
}

impl MockSubmitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pilot(&self, schedd: &str, mut pilot: PilotRecord) -> PilotRecord {
        let mut state = self.state.get_mut();
        state.next_cluster += 1;
        pilot.cluster = state.next_cluster;
        state
            .queues
            .entry(schedd.to_string())
            .or_default()
            .push(pilot.clone());
        pilot
    }

    pub fn pilots(&self, schedd: &str) -> Vec<PilotRecord> {
        self.state
            .get()
            .queues
            .get(schedd)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, schedd: &str, state: PilotState) -> usize {
        self.pilots(schedd)
            .iter()
            .filter(|p| p.state == state)
            .count()
    }

    pub fn submitted(&self) -> u32 {
        self.state.get().submissions.iter().map(|s| s.submitted).sum()
    }

    /// Moves up to `count` idle pilots of a schedd into the running state.
    pub fn start_pilots(&self, schedd: &str, count: usize) {
        let mut state = self.state.get_mut();
        if let Some(queue) = state.queues.get_mut(schedd) {
            for pilot in queue
                .iter_mut()
                .filter(|p| p.state == PilotState::Idle)
                .take(count)
            {
                pilot.state = PilotState::Running;
                pilot.submitted_remotely = true;
            }
        }
    }
}

/// Pilot template; the cluster id is assigned by [`MockSubmitBackend::add_pilot`].
pub fn pilot(entry: &str, client_name: &str, credential_id: &str, state: PilotState) -> PilotRecord {
    PilotRecord {
        cluster: 0,
        proc: 0,
        state,
        hold_code: None,
        hold_subcode: None,
        num_system_holds: 0,
        entry: entry.to_string(),
        client_name: client_name.to_string(),
        frontend_name: client_name
            .split_once('.')
            .map(|(frontend, _)| frontend)
            .unwrap_or(client_name)
            .to_string(),
        request_name: entry.to_string(),
        credential_id: credential_id.to_string(),
        security_class: "frontend".to_string(),
        cores: 1,
        submit_time: now_epoch(),
        entered_status_time: now_epoch(),
        submitted_remotely: true,
    }
}

impl SubmitBackend for MockSubmitBackend {
    fn enum_pilots(&self, schedd: &str, constraint: &Expression) -> SubmitFuture<Vec<PilotRecord>> {
        let pilots: Vec<PilotRecord> = self
            .pilots(schedd)
            .into_iter()
            .filter(|p| constraint.matches(&p.to_ad()))
            .collect();
        Box::pin(async move { Ok(pilots) })
    }

    fn submit(&self, schedd: &str, request: &SubmitRequest) -> SubmitFuture<SubmitOutcome> {
        let state = self.state.clone();
        let schedd = schedd.to_string();
        let request = request.clone();
        Box::pin(async move {
            let delay = {
                let mut s = state.get_mut();
                let in_flight = {
                    let counter = s.in_flight.entry(schedd.clone()).or_default();
                    *counter += 1;
                    *counter
                };
                s.max_in_flight = s.max_in_flight.max(in_flight);
                s.submit_delay
            };
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }

            let mut s = state.get_mut();
            *s.in_flight.entry(schedd.clone()).or_default() -= 1;
            let submitted = match s.fail_after {
                Some(limit) => request.count.min(limit),
                None => request.count,
            };
            let first = s.next_cluster + 1;
            for _ in 0..submitted {
                s.next_cluster += 1;
                let record = PilotRecord {
                    cluster: s.next_cluster,
                    proc: 0,
                    state: PilotState::Idle,
                    hold_code: None,
                    hold_subcode: None,
                    num_system_holds: 0,
                    entry: request.entry.clone(),
                    client_name: request.client_name.clone(),
                    frontend_name: request.frontend_name.clone(),
                    request_name: request.request_name.clone(),
                    credential_id: request.credential_id.clone(),
                    security_class: request.security_class.clone(),
                    cores: i64::from(request.cores),
                    submit_time: now_epoch(),
                    entered_status_time: now_epoch(),
                    submitted_remotely: false,
                };
                s.queues.entry(schedd.clone()).or_default().push(record);
            }
            s.submissions.push(Submission {
                schedd: schedd.clone(),
                entry: request.entry.clone(),
                client_name: request.client_name.clone(),
                credential_id: request.credential_id.clone(),
                requested: request.count,
                submitted,
            });
            let last = s.next_cluster;
            Ok(SubmitOutcome {
                cluster_range: (submitted > 0).then_some((first, last)),
                submitted,
                error: (submitted < request.count).then(|| "schedd refused".to_string()),
            })
        })
    }

    fn remove(&self, schedd: &str, constraint: &Expression, mode: RemoveMode) -> SubmitFuture<u32> {
        let mut state = self.state.get_mut();
        let mut removed = Vec::new();
        if let Some(queue) = state.queues.get_mut(schedd) {
            match mode {
                RemoveMode::Hold => {
                    for pilot in queue.iter_mut().filter(|p| constraint.matches(&p.to_ad())) {
                        pilot.state = PilotState::Held;
                        removed.push(pilot.id());
                    }
                }
                RemoveMode::Graceful | RemoveMode::Immediate => {
                    queue.retain(|p| {
                        if constraint.matches(&p.to_ad()) {
                            removed.push(p.id());
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }
        let count = removed.len() as u32;
        state
            .removed
            .extend(removed.into_iter().map(|id| (id, mode)));
        Box::pin(async move { Ok(count) })
    }

    fn release(&self, schedd: &str, constraint: &Expression) -> SubmitFuture<u32> {
        let mut state = self.state.get_mut();
        let mut released = Vec::new();
        if let Some(queue) = state.queues.get_mut(schedd) {
            for pilot in queue
                .iter_mut()
                .filter(|p| p.state == PilotState::Held && constraint.matches(&p.to_ad()))
            {
                pilot.state = PilotState::Idle;
                pilot.hold_code = None;
                pilot.hold_subcode = None;
                released.push(pilot.id());
            }
        }
        let count = released.len() as u32;
        state.released.extend(released);
        Box::pin(async move { Ok(count) })
    }

    fn reconfigure(&self, schedd: &str) -> SubmitFuture<()> {
        self.state.get_mut().reconfigured.push(schedd.to_string());
        Box::pin(async move { Ok(()) })
    }
}

pub fn submit_request(entry: &str, count: u32) -> SubmitRequest {
    SubmitRequest {
        factory_name: "factory".to_string(),
        glidein_name: "glidein".to_string(),
        entry: entry.to_string(),
        grid_resource: "condor ce.example.org".to_string(),
        frontend_name: "fe".to_string(),
        client_name: "fe.main".to_string(),
        request_name: format!("{entry}@glidein@factory"),
        credential_id: "cred1".to_string(),
        credential_type: crate::credentials::CredentialType::GridProxy,
        security_class: "frontend".to_string(),
        username: "pilot".to_string(),
        count,
        cores: 1,
        credential_files: vec![],
        params: Default::default(),
        submit_attrs: Default::default(),
    }
}

pub const FACTORY_POOL: &str = "wms.example.org";
pub const FACTORY_IDENTITY: &str = "factory@example.org";
pub const FRONTEND_IDENTITY: &str = "frontend@example.org";

/// Key shared by the test Frontend group and the test Factory.
pub fn signing_key() -> SigningKey {
    SigningKey::new("main-key", vec![7u8; 32]).unwrap()
}

/// `glidefactory` ad of an Entry accepting scitokens, keyed with [`entry_key`].
pub fn entry_ad(name: &str) -> ClassAd {
    ClassAd::new("glidefactory", name)
        .with("AuthenticatedIdentity", FACTORY_IDENTITY)
        .with("GLIDEIN_SupportedAuthenticationMethod", "scitoken")
        .with("GLIDEIN_TrustDomain", "Grid")
        .with("GLIDEIN_CPUS", 1)
        .with("GLIDEIN_Site", "Site1")
        .with("PubKeyID", entry_key().public().id())
        .with("PubKeyType", "RSA")
        .with("PubKeyValue", entry_key().public().pem())
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct FrontendFixture {
    #[builder(default)]
    plugin: PluginKind,
    #[builder(default = "vec![\"cred1\".to_string()]")]
    credentials: Vec<String>,
    #[builder(default)]
    group_limits: GroupLimits,
    #[builder(default)]
    frontend_limits: FrontendLimits,
    #[builder(default)]
    request_removal: Option<RemoveExcess>,
    #[builder(default)]
    excess_only: bool,
    #[builder(default)]
    match_expr: Option<String>,
    #[builder(default = "Duration::from_secs(60)")]
    loop_delay: Duration,
    #[builder(default = "vec![\"schedd1\".to_string()]")]
    schedds: Vec<String>,
}

pub struct FrontendSetup {
    pub workdir: WorkDir,
    pub snapshot: FrontendSnapshot,
}

impl FrontendSetup {
    pub fn group(&self) -> &GroupSnapshot {
        &self.snapshot.groups[0]
    }

    pub fn credentials(&self, group: &GroupSnapshot) -> CredentialStore {
        group
            .credential_store(self.snapshot.config.generator_timeout)
            .unwrap()
    }
}

pub fn frontend_config(dir: &Path, builder: FrontendFixtureBuilder) -> FrontendConfig {
    let options = builder.build().unwrap();
    let key = signing_key();
    std::fs::write(dir.join("main.key"), key.to_hex()).unwrap();
    let credentials = options
        .credentials
        .iter()
        .map(|id| {
            let file = dir.join(format!("{id}.tok"));
            std::fs::write(&file, format!("token of {id}")).unwrap();
            CredentialConfig {
                id: id.clone(),
                cred_type: CredentialType::Scitoken,
                trust_domain: "Grid".to_string(),
                security_class: "frontend".to_string(),
                files: vec![file],
                generator: None,
                generates: None,
                creation_script: None,
                refresh_frequency: Duration::from_secs(3600),
            }
        })
        .collect();
    let matching = MatchingConfig {
        match_expr: options
            .match_expr
            .map(|expr| Expression::parse(&expr).unwrap()),
        ..Default::default()
    };
    let config = FrontendConfig {
        frontend_name: "fe".to_string(),
        identity: FRONTEND_IDENTITY.to_string(),
        loop_delay: options.loop_delay,
        query_timeout: Duration::from_secs(5),
        user_pool: "user.example.org".to_string(),
        schedds: options.schedds,
        factories: vec![FactorySource {
            pool: FACTORY_POOL.to_string(),
            identity: FACTORY_IDENTITY.to_string(),
        }],
        sym_key_cypher: Cypher::Aes256Cbc,
        sym_key_lifetime: Duration::from_secs(3600),
        request_lifetime: Duration::from_secs(600),
        generator_timeout: Duration::from_secs(5),
        matching: Default::default(),
        limits: options.frontend_limits,
        match_fanout_threshold: 10000,
        match_workers: 2,
        params: BTreeMap::from([(
            "GLIDEIN_Collector".to_string(),
            "user.example.org".into(),
        )]),
        groups: vec![GroupConfig {
            name: "main".to_string(),
            enabled: true,
            credentials,
            signing_key: SigningKeyConfig {
                id: key.id().to_string(),
                file: "main.key".into(),
            },
            plugin: options.plugin,
            recycle_after: 10,
            matching,
            limits: options.group_limits,
            request_removal: options.request_removal,
            excess_only: options.excess_only,
            remove_excess_margin: 0,
            idle_lifetime: Duration::ZERO,
            params: Default::default(),
        }],
    };
    config.validate().unwrap();
    config
}

/// Frontend `fe` with the single group `main`, its files written into `dir`.
pub fn frontend_setup(dir: &Path, builder: FrontendFixtureBuilder) -> FrontendSetup {
    let config = frontend_config(dir, builder);
    let workdir = WorkDir::open(dir).unwrap();
    let snapshot = FrontendSnapshot::load(&workdir, config, None).unwrap();
    FrontendSetup { workdir, snapshot }
}

/// Queue ad of a job; `status` is the HTCondor `JobStatus` (1 idle, 2 running, 5 held).
pub fn job_ad(id: usize, user: &str, status: i64) -> ClassAd {
    ClassAd::new("Job", &format!("{id}.0"))
        .with("ClusterId", id)
        .with("ProcId", 0)
        .with("JobUniverse", 5)
        .with("JobStatus", status)
        .with("User", user)
        .with("RequestCpus", 1)
}

/// `glidefactoryclient` ad reporting pilots of a Frontend group on one Entry.
pub fn factory_client_ad(
    entry: &str,
    credential_id: &str,
    client_name: &str,
    idle: i64,
    running: i64,
) -> ClassAd {
    ClassAd::new(
        "glidefactoryclient",
        &format!("{credential_id}_{entry}@{client_name}"),
    )
    .with("AuthenticatedIdentity", FACTORY_IDENTITY)
    .with("ReqClientName", client_name)
    .with("ReqClientReqName", entry)
    .with("GlideinCredentialIdentifier", credential_id)
    .with("GlideinMonitorStatusIdle", idle)
    .with("GlideinMonitorStatusRunning", running)
}

/// Keeps every Frontend group record.
#[derive(Default, Clone)]
pub struct RecordingSink {
    events: WrappedRcRefCell<Vec<StatsEvent>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<IterationRecord> {
        self.events
            .get()
            .iter()
            .filter_map(|event| match event {
                StatsEvent::GroupIteration(record) => Some(record.clone()),
                StatsEvent::EntryIteration(_) => None,
            })
            .collect()
    }

    pub fn entry_records(&self) -> Vec<EntryIterationRecord> {
        self.events
            .get()
            .iter()
            .filter_map(|event| match event {
                StatsEvent::EntryIteration(record) => Some(record.clone()),
                StatsEvent::GroupIteration(_) => None,
            })
            .collect()
    }
}

impl StatsSink for RecordingSink {
    fn emit(&self, event: StatsEvent) {
        self.events.get_mut().push(event);
    }
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct FactoryFixture {
    #[builder(default = "vec![\"ce1\".to_string()]")]
    entries: Vec<String>,
    /// Every Entry submits to its own schedd instead of the shared one.
    #[builder(default)]
    separate_schedds: bool,
    /// Security classes `fe` may use on the Entries; empty allows all.
    #[builder(default)]
    allowed_classes: Vec<String>,
    /// Security classes of `fe` mapped to the `fepilot` user.
    #[builder(default = "vec![\"frontend\".to_string()]")]
    security_classes: Vec<String>,
    #[builder(default)]
    limits: EntryLimits,
    #[builder(default = "100")]
    max_submits_per_cycle: u32,
    #[builder(default = "100_000")]
    max_glideins: u64,
    #[builder(default)]
    held: HeldPolicy,
    #[builder(default = "Duration::from_secs(60)")]
    loop_delay: Duration,
}

pub const FACTORY_SCHEDD: &str = "schedd_glideins";

pub fn factory_config(dir: &Path, builder: FactoryFixtureBuilder) -> FactoryConfig {
    let options = builder.build().unwrap();
    let key_path = dir.join("entry_key.pem");
    if !key_path.exists() {
        entry_key().save(&key_path).unwrap();
    }
    std::fs::write(dir.join("main.key"), signing_key().to_hex()).unwrap();
    let allowed_frontends = options
        .allowed_classes
        .iter()
        .map(|class| AllowedFrontend {
            frontend: "fe".to_string(),
            security_class: class.clone(),
        })
        .collect::<Vec<_>>();
    let entries = options
        .entries
        .iter()
        .map(|name| EntryConfig {
            name: name.clone(),
            enabled: true,
            drain: false,
            schedd: if options.separate_schedds {
                format!("{FACTORY_SCHEDD}_{name}")
            } else {
                FACTORY_SCHEDD.to_string()
            },
            grid_type: "condor".to_string(),
            gatekeeper: format!("{name}.example.org"),
            trust_domain: "Grid".to_string(),
            auth_method: CredentialType::Scitoken,
            cpus: 1,
            require_voms: false,
            allowed_frontends: allowed_frontends.clone(),
            limits: options.limits.clone(),
            attrs: BTreeMap::from([("GLIDEIN_Site".to_string(), "Site1".into())]),
            submit_attrs: Default::default(),
        })
        .collect();
    let config = FactoryConfig {
        factory_name: "f".to_string(),
        glidein_name: "g".to_string(),
        pool: FACTORY_POOL.to_string(),
        loop_delay: options.loop_delay,
        advertise_delay: Duration::ZERO,
        query_timeout: Duration::from_secs(5),
        max_submits_per_cycle: options.max_submits_per_cycle,
        pilot_executable: "glidein_startup.sh".into(),
        submit_timeout: Duration::from_secs(5),
        max_glideins: options.max_glideins,
        key_file: "entry_key.pem".into(),
        signing_keys: vec![SigningKeyConfig {
            id: signing_key().id().to_string(),
            file: "main.key".into(),
        }],
        downtime_file: "downtimes".into(),
        client_proxies_dir: "client_proxies".into(),
        held: options.held,
        frontends: vec![FrontendAuth {
            name: "fe".to_string(),
            identity: FRONTEND_IDENTITY.to_string(),
            security_classes: options
                .security_classes
                .iter()
                .map(|class| (class.clone(), "fepilot".to_string()))
                .collect(),
        }],
        entries,
    };
    config.validate().unwrap();
    config
}

/// Factory `f`, glidein `g`, with Entries keyed by [`entry_key`] and files written into `dir`.
pub fn factory_setup(dir: &Path, builder: FactoryFixtureBuilder) -> FactorySnapshot {
    let config = factory_config(dir, builder);
    FactorySnapshot::load(&WorkDir::open(dir).unwrap(), config).unwrap()
}

/// Request of `fe.main` with a scitoken credential, built and signed the way the Frontend
/// does it, as the collector returns it to the Factory.
pub fn signed_request_to(
    entry: &str,
    credential_id: &str,
    idle: u64,
    max_run: u64,
    now: i64,
) -> ClassAd {
    let sym_key = SymKey::generate(Cypher::Aes128Cbc).unwrap();
    let encrypted_code = entry_key()
        .public()
        .encrypt_hex(sym_key.to_code().as_bytes())
        .unwrap();
    let mut ad = ClassAd::new(
        "glideclient",
        &format!("{credential_id}_{entry}@main@fe"),
    )
    .with("GlideinMyType", "glideclient")
    .with("ClientName", "fe.main")
    .with("FrontendName", "fe")
    .with("GroupName", "main")
    .with("ReqName", entry)
    .with("ReqGlidein", entry)
    .with("ReqIdleGlideins", idle)
    .with("ReqMaxGlideins", max_run)
    .with("ReqRemoveExcess", "NO")
    .with("ReqPubKeyID", entry_key().public().id())
    .with("ReqExpiresAt", now + 600)
    .with("GlideinParamGLIDEIN_Collector", "user.example.org")
    .with("GlideinEncParamSymKey", encrypted_code);
    for (param, value) in [
        ("SubmitProxy", credential_id.to_string()),
        ("SecurityClass", "frontend".to_string()),
        ("SecurityName", "fe".to_string()),
        ("Identity", FRONTEND_IDENTITY.to_string()),
        ("CredentialType", "scitoken".to_string()),
        ("ScitokenFile", format!("token of {credential_id}")),
    ] {
        ad.insert(
            format!("GlideinEncParam{param}"),
            sym_key.encrypt_hex(&value).unwrap(),
        );
    }
    sign_ad(&mut ad, &signing_key()).unwrap();
    ad.with("AuthenticatedIdentity", FRONTEND_IDENTITY)
}

/// [`signed_request_to`] the first Entry of `factory`.
pub fn signed_request(
    factory: &FactorySnapshot,
    credential_id: &str,
    idle: u64,
    max_run: u64,
    now: i64,
) -> ClassAd {
    signed_request_to(&factory.entries[0].fullname, credential_id, idle, max_run, now)
}
