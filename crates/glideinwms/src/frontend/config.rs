use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use classad::{Set, Value};
use serde::{Deserialize, Serialize};

use crate::census::{CensusQuery, FactorySource};
use crate::common::config::ValidatedConfig;
use crate::common::error::config_error;
use crate::common::utils::str::is_safe_name;
use crate::common::utils::time::get_duration_from_env;
use crate::common::workdir::WorkDir;
use crate::credentials::{CredentialConfig, CredentialStore, GeneratorRegistry, ScratchArea};
use crate::crypto::{Cypher, SigningKey};
use crate::frontend::history::RemoveExcess;
use crate::frontend::limits::{FrontendLimits, GroupLimits};
use crate::frontend::plugins::{CredentialPlugin, PluginKind};
use crate::matching::{FanOut, MatchPolicy, MatchingConfig};

/// Overrides `loop_delay` (milliseconds).
pub const LOOP_DELAY_ENV: &str = "GWMS_LOOP_DELAY_MS";

/// Share of the loop delay an iteration may take before it is abandoned.
const DEADLINE_FRACTION: f64 = 0.8;

fn default_loop_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sym_key_lifetime() -> Duration {
    Duration::from_secs(3600)
}

fn default_request_lifetime() -> Duration {
    Duration::from_secs(600)
}

fn default_generator_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cypher() -> Cypher {
    Cypher::Aes256Cbc
}

fn default_fanout_threshold() -> usize {
    FanOut::default().threshold
}

fn default_match_workers() -> usize {
    FanOut::default().workers
}

fn default_true() -> bool {
    true
}

fn default_recycle_after() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
    pub frontend_name: String,
    /// Identity the Frontend authenticates with at the collectors.
    pub identity: String,
    #[serde(
        default = "default_loop_delay",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub loop_delay: Duration,
    #[serde(
        default = "default_query_timeout",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub query_timeout: Duration,
    pub user_pool: String,
    #[serde(default)]
    pub schedds: Vec<String>,
    #[serde(default)]
    pub factories: Vec<FactorySource>,
    #[serde(default = "default_cypher")]
    pub sym_key_cypher: Cypher,
    #[serde(
        default = "default_sym_key_lifetime",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub sym_key_lifetime: Duration,
    /// How long a Factory may act on a request the Frontend stopped refreshing.
    #[serde(
        default = "default_request_lifetime",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub request_lifetime: Duration,
    #[serde(
        default = "default_generator_timeout",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub generator_timeout: Duration,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub limits: FrontendLimits,
    #[serde(default = "default_fanout_threshold")]
    pub match_fanout_threshold: usize,
    #[serde(default = "default_match_workers")]
    pub match_workers: usize,
    /// `GlideinParam*` attributes of every request.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningKeyConfig {
    pub id: String,
    /// Hex encoded secret shared with the Factories.
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    pub signing_key: SigningKeyConfig,
    #[serde(default)]
    pub plugin: PluginKind,
    /// Iterations after which the credential of an inactive user is reassigned.
    #[serde(default = "default_recycle_after")]
    pub recycle_after: u64,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub limits: GroupLimits,
    /// Asks the Factories to remove the pilots of this group.
    #[serde(default)]
    pub request_removal: Option<RemoveExcess>,
    /// With `request_removal`, remove only pilots above the request.
    #[serde(default)]
    pub excess_only: bool,
    #[serde(default)]
    pub remove_excess_margin: u64,
    /// Idle pilots older than this are removed by the Factory. Zero keeps them.
    #[serde(default, with = "crate::common::utils::time::humantime_serde")]
    pub idle_lifetime: Duration,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

fn check_name(what: &str, name: &str) -> crate::Result<()> {
    if !is_safe_name(name) {
        return config_error(format!(
            "{what} `{name}` may only contain [A-Za-z0-9._@-]"
        ));
    }
    Ok(())
}

impl GroupConfig {
    fn validate(&self, frontend: &FrontendConfig) -> crate::Result<()> {
        check_name("Group name", &self.name)?;
        check_name("Signing key id", &self.signing_key.id)?;
        let mut ids = Set::new();
        for credential in &self.credentials {
            credential.validate()?;
            if !ids.insert(credential.id.as_str()) {
                return config_error(format!(
                    "Group `{}` defines credential `{}` twice",
                    self.name, credential.id
                ));
            }
        }
        if self.enabled && self.credentials.is_empty() {
            return config_error(format!("Group `{}` has no credentials", self.name));
        }
        if self.limits.idle_ramp_divisor == 0 {
            return config_error(format!(
                "Group `{}`: idle_ramp_divisor must be positive",
                self.name
            ));
        }
        if self.limits.fraction_running < 0.0 {
            return config_error(format!(
                "Group `{}`: fraction_running must not be negative",
                self.name
            ));
        }
        MatchPolicy::compile(&frontend.matching, &self.matching)?;
        Ok(())
    }
}

impl ValidatedConfig for FrontendConfig {
    fn validate(&self) -> crate::Result<()> {
        check_name("Frontend name", &self.frontend_name)?;
        if self.identity.is_empty() {
            return config_error("Frontend identity must not be empty".to_string());
        }
        if self.loop_delay.is_zero() {
            return config_error("loop_delay must be positive".to_string());
        }
        if self.match_workers == 0 {
            return config_error("match_workers must be positive".to_string());
        }
        let mut names = Set::new();
        for group in &self.groups {
            group.validate(self)?;
            if !names.insert(group.name.as_str()) {
                return config_error(format!("Group `{}` is defined twice", group.name));
            }
        }
        Ok(())
    }
}

/// Everything a group iteration needs from the group configuration, resolved and compiled.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub config: GroupConfig,
    /// `<frontend>.<group>`
    pub client_name: String,
    pub policy: MatchPolicy,
    pub signing_key: SigningKey,
    pub plugin: CredentialPlugin,
    pub plugin_state_path: PathBuf,
    pub scratch_dir: PathBuf,
}

impl GroupSnapshot {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Credential store of the group. Credentials with a `creation_script` get a command
    /// generator bounded by `generator_timeout`.
    pub fn credential_store(&self, generator_timeout: Duration) -> crate::Result<CredentialStore> {
        let generators = GeneratorRegistry::builder()
            .with_scripts(&self.config.credentials, generator_timeout)
            .finish();
        CredentialStore::new(
            self.config.credentials.clone(),
            Rc::new(generators),
            ScratchArea::new(self.scratch_dir.clone()),
        )
    }
}

/// Frontend-wide part of the configuration. Groups are looked up by name.
#[derive(Debug, Clone)]
pub struct FrontendSnapshot {
    pub config: FrontendConfig,
    pub workdir: WorkDir,
    pub loop_delay: Duration,
    pub iteration_deadline: Duration,
    pub groups: Vec<GroupSnapshot>,
}

impl FrontendSnapshot {
    /// Resolves a validated configuration. Only enabled groups (and only `only_group`, when
    /// given) are kept.
    pub fn load(
        workdir: &WorkDir,
        config: FrontendConfig,
        only_group: Option<&str>,
    ) -> crate::Result<Self> {
        let loop_delay = get_duration_from_env(LOOP_DELAY_ENV).unwrap_or(config.loop_delay);
        let state_dir = workdir.state_dir();
        let mut groups = Vec::new();
        for group in config
            .groups
            .iter()
            .filter(|g| g.enabled)
            .filter(|g| only_group.is_none_or(|name| name == g.name))
        {
            let signing_key = SigningKey::load(
                &group.signing_key.id,
                &workdir.resolve(&group.signing_key.file),
            )
            .map_err(|error| {
                crate::common::error::GwmsError::ConfigError(format!(
                    "Cannot load signing key of group `{}`: {error}",
                    group.name
                ))
            })?;
            let mut group_config = group.clone();
            for credential in &mut group_config.credentials {
                credential.files = credential.files.iter().map(|f| workdir.resolve(f)).collect();
            }
            groups.push(GroupSnapshot {
                client_name: format!("{}.{}", config.frontend_name, group.name),
                policy: MatchPolicy::compile(&config.matching, &group.matching)?,
                signing_key,
                plugin: CredentialPlugin::new(group.plugin, group.recycle_after),
                plugin_state_path: state_dir.join(format!("plugin_{}", group.name)),
                scratch_dir: state_dir.join("scratch").join(&group.name),
                config: group_config,
            });
        }
        if let Some(name) = only_group {
            if groups.is_empty() {
                return config_error(format!("Group `{name}` is not configured or disabled"));
            }
        }
        Ok(Self {
            iteration_deadline: loop_delay.mul_f64(DEADLINE_FRACTION),
            loop_delay,
            workdir: workdir.clone(),
            groups,
            config,
        })
    }

    pub fn group(&self, name: &str) -> Option<&GroupSnapshot> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn census_query(&self, group: &GroupSnapshot) -> CensusQuery {
        CensusQuery {
            user_pool: self.config.user_pool.clone(),
            schedds: self.config.schedds.clone(),
            job_query: group.policy.job_query.clone(),
            factory_query: group.policy.factory_query.clone(),
            factories: self.config.factories.clone(),
            client_name: group.client_name.clone(),
            frontend_name: self.config.frontend_name.clone(),
            timeout: self.config.query_timeout,
        }
    }

    pub fn fan_out(&self) -> FanOut {
        FanOut {
            threshold: self.config.match_fanout_threshold,
            workers: self.config.match_workers,
        }
    }

    /// Plain request parameters of a group: Frontend parameters overridden by the group's.
    pub fn params(&self, group: &GroupSnapshot) -> BTreeMap<String, Value> {
        let mut params = self.config.params.clone();
        params.extend(group.config.params.clone());
        params
    }
}
