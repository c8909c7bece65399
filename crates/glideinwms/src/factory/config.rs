use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use classad::{Map, Set, Value};
use serde::{Deserialize, Serialize};

use crate::common::attrs::entry_fullname;
use crate::common::config::ValidatedConfig;
use crate::common::error::{GwmsError, config_error};
use crate::common::utils::str::is_safe_name;
use crate::common::utils::time::get_duration_from_env;
use crate::common::workdir::WorkDir;
use crate::credentials::{CredentialType, DEFAULT_TRUST_DOMAIN, ScratchArea};
use crate::crypto::{EntryKeyPair, SigningKey};
use crate::downtime::{ALL, DowntimeFile};
use crate::frontend::config::SigningKeyConfig;

/// Overrides `loop_delay` (milliseconds).
pub const LOOP_DELAY_ENV: &str = "GWMS_LOOP_DELAY_MS";
/// Overrides `advertise_delay` (milliseconds).
pub const ADVERTISE_DELAY_ENV: &str = "GWMS_ADVERTISE_DELAY_MS";

const DEADLINE_FRACTION: f64 = 0.8;

fn default_loop_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_submits_per_cycle() -> u32 {
    100
}

fn default_max_glideins() -> u64 {
    100_000
}

fn default_key_file() -> PathBuf {
    PathBuf::from("entry_key.pem")
}

fn default_downtime_file() -> PathBuf {
    PathBuf::from("downtimes")
}

fn default_client_proxies_dir() -> PathBuf {
    PathBuf::from("client_proxies")
}

fn default_pilot_executable() -> PathBuf {
    PathBuf::from("glidein_startup.sh")
}

fn default_submit_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

fn default_cpus() -> u32 {
    1
}

fn default_trust_domain() -> String {
    DEFAULT_TRUST_DOMAIN.to_string()
}

fn default_all() -> String {
    ALL.to_string()
}

/// Pilot limits of one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PilotLimits {
    #[serde(default = "PilotLimits::default_max_glideins")]
    pub max_glideins: u64,
    #[serde(default = "PilotLimits::default_max_idle")]
    pub max_idle: u64,
    #[serde(default = "PilotLimits::default_max_held")]
    pub max_held: u64,
}

impl PilotLimits {
    fn default_max_glideins() -> u64 {
        10000
    }

    fn default_max_idle() -> u64 {
        2000
    }

    fn default_max_held() -> u64 {
        1000
    }

    fn per_frontend() -> Self {
        Self {
            max_glideins: 5000,
            max_idle: 100,
            max_held: 50,
        }
    }
}

impl Default for PilotLimits {
    fn default() -> Self {
        Self {
            max_glideins: Self::default_max_glideins(),
            max_idle: Self::default_max_idle(),
            max_held: Self::default_max_held(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryLimits {
    /// Limits of the whole Entry.
    #[serde(default)]
    pub total: PilotLimits,
    /// Limits of every `<frontend>:<security_class>` without an override.
    #[serde(default = "PilotLimits::per_frontend")]
    pub per_frontend: PilotLimits,
    #[serde(default)]
    pub frontends: BTreeMap<String, PilotLimits>,
}

impl Default for EntryLimits {
    fn default() -> Self {
        Self {
            total: PilotLimits::default(),
            per_frontend: PilotLimits::per_frontend(),
            frontends: Default::default(),
        }
    }
}

impl EntryLimits {
    pub fn for_frontend(&self, key: &str) -> PilotLimits {
        self.frontends.get(key).copied().unwrap_or(self.per_frontend)
    }
}

/// When and how long held pilots are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeldPolicy {
    #[serde(default = "HeldPolicy::default_max_release_count")]
    pub max_release_count: i64,
    /// A pilot held `n` times is released after `n * min_release_time`.
    #[serde(
        default = "HeldPolicy::default_min_release_time",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub min_release_time: Duration,
    #[serde(
        default = "HeldPolicy::default_stale_idle",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub stale_idle: Duration,
    #[serde(
        default = "HeldPolicy::default_stale_running",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub stale_running: Duration,
}

impl HeldPolicy {
    fn default_max_release_count() -> i64 {
        10
    }

    fn default_min_release_time() -> Duration {
        Duration::from_secs(300)
    }

    fn default_stale_idle() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }

    fn default_stale_running() -> Duration {
        Duration::from_secs(31 * 24 * 3600)
    }
}

impl Default for HeldPolicy {
    fn default() -> Self {
        Self {
            max_release_count: Self::default_max_release_count(),
            min_release_time: Self::default_min_release_time(),
            stale_idle: Self::default_stale_idle(),
            stale_running: Self::default_stale_running(),
        }
    }
}

/// A Frontend this Factory serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendAuth {
    pub name: String,
    /// Identity the Frontend must authenticate with.
    pub identity: String,
    /// Local username pilots of each security class run as.
    #[serde(default)]
    pub security_classes: BTreeMap<String, String>,
}

/// Whitelist item of an Entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowedFrontend {
    pub frontend: String,
    #[serde(default = "default_all")]
    pub security_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stops submitting and retires the Entry once its pilots are gone.
    #[serde(default)]
    pub drain: bool,
    pub schedd: String,
    pub grid_type: String,
    pub gatekeeper: String,
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,
    pub auth_method: CredentialType,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default)]
    pub require_voms: bool,
    #[serde(default)]
    pub allowed_frontends: Vec<AllowedFrontend>,
    #[serde(default)]
    pub limits: EntryLimits,
    /// Published on the Entry ad, e.g. `GLIDEIN_Site`.
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
    /// Extra submit description lines.
    #[serde(default)]
    pub submit_attrs: BTreeMap<String, String>,
}

impl EntryConfig {
    pub fn grid_resource(&self) -> String {
        format!("{} {}", self.grid_type, self.gatekeeper)
    }

    /// Whitelist check. An empty whitelist admits every configured Frontend; `security_class`
    /// `None` only checks the Frontend name.
    pub fn allows(&self, frontend: &str, security_class: Option<&str>) -> bool {
        if self.allowed_frontends.is_empty() {
            return true;
        }
        self.allowed_frontends.iter().any(|allowed| {
            allowed.frontend == frontend
                && (allowed.security_class == ALL
                    || security_class.is_none_or(|class| class == allowed.security_class))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactoryConfig {
    pub factory_name: String,
    pub glidein_name: String,
    /// Collector where the Entries are advertised and requests are read.
    pub pool: String,
    #[serde(
        default = "default_loop_delay",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub loop_delay: Duration,
    /// Pause between two advertisements.
    #[serde(default, with = "crate::common::utils::time::humantime_serde")]
    pub advertise_delay: Duration,
    #[serde(
        default = "default_query_timeout",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub query_timeout: Duration,
    #[serde(default = "default_max_submits_per_cycle")]
    pub max_submits_per_cycle: u32,
    /// Startup script the pilots run.
    #[serde(default = "default_pilot_executable")]
    pub pilot_executable: PathBuf,
    /// Bound of every call to the schedd tools.
    #[serde(
        default = "default_submit_timeout",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub submit_timeout: Duration,
    /// Pilots of all Entries together.
    #[serde(default = "default_max_glideins")]
    pub max_glideins: u64,
    /// RSA key pair shared by all Entries.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Secrets Frontends sign their requests with.
    #[serde(default)]
    pub signing_keys: Vec<SigningKeyConfig>,
    #[serde(default = "default_downtime_file")]
    pub downtime_file: PathBuf,
    #[serde(default = "default_client_proxies_dir")]
    pub client_proxies_dir: PathBuf,
    #[serde(default)]
    pub held: HeldPolicy,
    #[serde(default)]
    pub frontends: Vec<FrontendAuth>,
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

fn check_name(what: &str, name: &str) -> crate::Result<()> {
    if !is_safe_name(name) {
        return config_error(format!(
            "{what} `{name}` may only contain [A-Za-z0-9._@-]"
        ));
    }
    Ok(())
}

impl EntryConfig {
    fn validate(&self, factory: &FactoryConfig) -> crate::Result<()> {
        check_name("Entry name", &self.name)?;
        if self.name.contains('@') {
            return config_error(format!("Entry name `{}` must not contain `@`", self.name));
        }
        if self.schedd.is_empty() {
            return config_error(format!("Entry `{}` has no schedd", self.name));
        }
        if self.cpus == 0 {
            return config_error(format!("Entry `{}`: cpus must be positive", self.name));
        }
        for allowed in &self.allowed_frontends {
            if !factory.frontends.iter().any(|f| f.name == allowed.frontend) {
                return config_error(format!(
                    "Entry `{}` allows unknown Frontend `{}`",
                    self.name, allowed.frontend
                ));
            }
        }
        Ok(())
    }
}

impl ValidatedConfig for FactoryConfig {
    fn validate(&self) -> crate::Result<()> {
        check_name("Factory name", &self.factory_name)?;
        check_name("Glidein name", &self.glidein_name)?;
        if self.loop_delay.is_zero() {
            return config_error("loop_delay must be positive".to_string());
        }
        if self.max_submits_per_cycle == 0 {
            return config_error("max_submits_per_cycle must be positive".to_string());
        }
        let mut frontends = Set::new();
        for frontend in &self.frontends {
            check_name("Frontend name", &frontend.name)?;
            if frontend.identity.is_empty() {
                return config_error(format!("Frontend `{}` has no identity", frontend.name));
            }
            if !frontends.insert(frontend.name.as_str()) {
                return config_error(format!("Frontend `{}` is defined twice", frontend.name));
            }
        }
        let mut entries = Set::new();
        for entry in &self.entries {
            entry.validate(self)?;
            if !entries.insert(entry.name.as_str()) {
                return config_error(format!("Entry `{}` is defined twice", entry.name));
            }
        }
        Ok(())
    }
}

/// One configured Entry, resolved.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub config: EntryConfig,
    /// `<entry>@<glidein>@<factory>`
    pub fullname: String,
}

impl EntrySnapshot {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[derive(Clone)]
pub struct FactorySnapshot {
    pub config: FactoryConfig,
    pub workdir: WorkDir,
    pub loop_delay: Duration,
    pub advertise_delay: Duration,
    pub iteration_deadline: Duration,
    pub key: Rc<EntryKeyPair>,
    pub signing_keys: Map<String, SigningKey>,
    pub downtime: DowntimeFile,
    pub scratch: ScratchArea,
    pub entries: Vec<EntrySnapshot>,
}

impl FactorySnapshot {
    /// Resolves a validated configuration. Disabled Entries are left out.
    pub fn load(workdir: &WorkDir, config: FactoryConfig) -> crate::Result<Self> {
        let loop_delay = get_duration_from_env(LOOP_DELAY_ENV).unwrap_or(config.loop_delay);
        let advertise_delay =
            get_duration_from_env(ADVERTISE_DELAY_ENV).unwrap_or(config.advertise_delay);
        let key = EntryKeyPair::load(&workdir.resolve(&config.key_file)).map_err(|error| {
            GwmsError::ConfigError(format!(
                "Cannot load the Entry key {}: {error}",
                config.key_file.display()
            ))
        })?;
        let mut signing_keys = Map::new();
        for key_config in &config.signing_keys {
            let key = SigningKey::load(&key_config.id, &workdir.resolve(&key_config.file))
                .map_err(|error| {
                    GwmsError::ConfigError(format!(
                        "Cannot load signing key `{}`: {error}",
                        key_config.id
                    ))
                })?;
            signing_keys.insert(key_config.id.clone(), key);
        }
        let entries = config
            .entries
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| EntrySnapshot {
                fullname: entry_fullname(&entry.name, &config.glidein_name, &config.factory_name),
                config: entry.clone(),
            })
            .collect();
        Ok(Self {
            iteration_deadline: loop_delay.mul_f64(DEADLINE_FRACTION),
            loop_delay,
            advertise_delay,
            key: Rc::new(key),
            signing_keys,
            downtime: DowntimeFile::new(workdir.resolve(&config.downtime_file)),
            scratch: ScratchArea::new(workdir.resolve(&config.client_proxies_dir)),
            workdir: workdir.clone(),
            entries,
            config,
        })
    }

    pub fn entry(&self, name: &str) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|entry| entry.name() == name)
    }

    pub fn frontend(&self, name: &str) -> Option<&FrontendAuth> {
        self.config.frontends.iter().find(|f| f.name == name)
    }

    /// `Name` of the `glidefactoryglobal` ad.
    pub fn global_name(&self) -> String {
        format!("{}@{}", self.config.glidein_name, self.config.factory_name)
    }
}
