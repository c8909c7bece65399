//! Credential selection: which credentials of a group carry the request for one Entry, and
//! how the Entry's request is split among them.
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::Path;

use classad::Set;
use itertools::Itertools;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::common::error::GwmsError;
use crate::common::utils::fs::write_atomic;
use crate::credentials::{CredentialConfig, CredentialType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    #[default]
    ProxyFirst,
    ProxyAll,
    ProxyUserRr,
    ProxyUserCardinality,
    ProxyUserMapWRecycling,
}

/// Part of an Entry request carried by one credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialShare {
    pub credential_id: String,
    pub idle: u64,
    pub max_run: u64,
}

/// The request computed for one Entry, before it is split among credentials.
#[derive(Debug, Clone)]
pub struct EntryRequest<'a> {
    pub entry: &'a str,
    pub trust_domain: &'a str,
    pub auth_methods: &'a [CredentialType],
    pub min_idle: u64,
    pub max_run: u64,
    /// Matched idle jobs of each user on this Entry.
    pub idle_users: &'a BTreeMap<String, u64>,
}

/// `n·i/p − n·(i−1)/p`: the i-th (1-based) of `p` parts of `n` that sum up to `n`.
pub fn fair_split(i: u64, n: u64, p: u64) -> u64 {
    if p == 0 {
        return 0;
    }
    n * i / p - n * (i - 1) / p
}

fn shuffle_seed(entry: &str, iteration: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    entry.hash(&mut hasher);
    iteration.hash(&mut hasher);
    hasher.finish()
}

/// Splits `idle` and `max_run` among `count` credentials.
///
/// The idle parts are shuffled so that the rounding surplus does not always land on the same
/// credential; the shuffle depends only on the Entry and the iteration.
pub fn fair_assign(idle: u64, max_run: u64, count: usize, entry: &str, iteration: u64) -> Vec<(u64, u64)> {
    let parts = count as u64;
    let mut idle_parts: Vec<u64> = (1..=parts).map(|i| fair_split(i, idle, parts)).collect();
    let mut rng = StdRng::seed_from_u64(shuffle_seed(entry, iteration));
    idle_parts.shuffle(&mut rng);
    idle_parts
        .into_iter()
        .zip((1..=parts).map(|i| fair_split(i, max_run, parts)))
        .map(|(idle, max_run)| (idle.min(max_run), max_run))
        .collect()
}

/// Selection state that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginState {
    pub cursor: u64,
    pub updated: i64,
    /// Iterations of the group seen by the plugin.
    pub iteration: u64,
    pub users: BTreeSet<String>,
    /// Per credential domain: user to credential.
    pub user_map: BTreeMap<String, BTreeMap<String, String>>,
    /// Iteration in which the assignee of a credential last had jobs.
    pub last_seen: BTreeMap<String, u64>,
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value.trim().parse().map_err(|_| {
        GwmsError::DeserializationError(format!("Invalid value `{value}` of `{key}`"))
    })
}

fn parse_pairs(value: &str) -> crate::Result<Vec<(String, String)>> {
    value
        .split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.rsplit_once(':')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    GwmsError::DeserializationError(format!("Invalid pair `{item}`"))
                })
        })
        .collect()
}

fn join_pairs<'a>(pairs: impl Iterator<Item = (&'a String, String)>) -> String {
    pairs
        .map(|(key, value)| format!("{key}:{value}"))
        .join(",")
}

impl PluginState {
    pub fn parse(content: &str) -> crate::Result<Self> {
        let mut state = PluginState::default();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                return Err(GwmsError::DeserializationError(format!(
                    "Invalid plugin state line `{line}`"
                )));
            };
            match key {
                "cursor" => state.cursor = parse_number(key, value)?,
                "updated" => state.updated = parse_number(key, value)?,
                "iteration" => state.iteration = parse_number(key, value)?,
                "users" => {
                    state.users = value
                        .split(',')
                        .filter(|u| !u.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "last_seen" => {
                    for (credential, seen) in parse_pairs(value)? {
                        let seen = parse_number(key, &seen)?;
                        state.last_seen.insert(credential, seen);
                    }
                }
                _ => match key.strip_prefix("map.") {
                    Some(domain) => {
                        state
                            .user_map
                            .insert(domain.to_string(), parse_pairs(value)?.into_iter().collect());
                    }
                    None => log::debug!("Ignoring unknown plugin state key `{key}`"),
                },
            }
        }
        Ok(state)
    }

    pub fn to_text(&self) -> String {
        let mut text = format!(
            "cursor={}\nupdated={}\niteration={}\nusers={}\n",
            self.cursor,
            self.updated,
            self.iteration,
            self.users.iter().join(",")
        );
        for (domain, map) in &self.user_map {
            text.push_str(&format!(
                "map.{domain}={}\n",
                join_pairs(map.iter().map(|(u, c)| (u, c.clone())))
            ));
        }
        text.push_str(&format!(
            "last_seen={}\n",
            join_pairs(self.last_seen.iter().map(|(c, n)| (c, n.to_string())))
        ));
        text
    }

    /// Loads the state; a missing or unreadable file starts from scratch.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Ok(state) => state,
                Err(error) => {
                    log::warn!("Ignoring plugin state {}: {error}", path.display());
                    Self::default()
                }
            },
            Err(error) if error.kind() == ErrorKind::NotFound => Self::default(),
            Err(error) => {
                log::warn!("Cannot read plugin state {}: {error}", path.display());
                Self::default()
            }
        }
    }

    pub fn store(&self, path: &Path) -> crate::Result<()> {
        write_atomic(path, self.to_text().as_bytes(), 0o600)
    }
}

/// Selection policy of one group.
#[derive(Debug, Clone, Copy)]
pub struct CredentialPlugin {
    kind: PluginKind,
    recycle_after: u64,
}

impl CredentialPlugin {
    pub fn new(kind: PluginKind, recycle_after: u64) -> Self {
        Self {
            kind,
            recycle_after,
        }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Advances the state to a new iteration in which `users` have jobs in the queue.
    pub fn begin_iteration(&self, state: &mut PluginState, users: &Set<String>, now: i64) {
        let users: BTreeSet<String> = users.iter().cloned().collect();
        state.iteration += 1;
        state.updated = now;
        if self.kind == PluginKind::ProxyUserRr {
            let disappeared = state.users.difference(&users).count() as u64;
            state.cursor += disappeared;
        }
        if self.kind == PluginKind::ProxyUserMapWRecycling {
            let iteration = state.iteration;
            let recycle_after = self.recycle_after;
            let last_seen = &state.last_seen;
            for map in state.user_map.values_mut() {
                map.retain(|user, credential| {
                    let seen = last_seen.get(credential).copied().unwrap_or(0);
                    users.contains(user) || iteration - seen <= recycle_after
                });
            }
            state.user_map.retain(|_, map| !map.is_empty());
        }
        state.users = users;
    }

    /// Picks the credentials for one Entry. `credentials` are all credentials of the group
    /// in configuration order.
    pub fn select(
        &self,
        state: &mut PluginState,
        credentials: &[CredentialConfig],
        request: &EntryRequest,
    ) -> Vec<CredentialShare> {
        let eligible: Vec<&CredentialConfig> = credentials
            .iter()
            .filter(|c| c.is_eligible(request.trust_domain, request.auth_methods))
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        let user_count = state.users.len().max(1);
        let chosen: Vec<&CredentialConfig> = match self.kind {
            PluginKind::ProxyFirst => vec![eligible[0]],
            PluginKind::ProxyAll => eligible,
            PluginKind::ProxyUserCardinality => eligible.into_iter().take(user_count).collect(),
            PluginKind::ProxyUserRr => {
                let start = (state.cursor % credentials.len() as u64) as usize;
                credentials[start..]
                    .iter()
                    .chain(&credentials[..start])
                    .filter(|c| c.is_eligible(request.trust_domain, request.auth_methods))
                    .take(user_count)
                    .collect()
            }
            PluginKind::ProxyUserMapWRecycling => {
                return self.select_mapped(state, &eligible, request);
            }
        };
        fair_assign(
            request.min_idle,
            request.max_run,
            chosen.len(),
            request.entry,
            state.iteration,
        )
        .into_iter()
        .zip(chosen)
        .map(|((idle, max_run), credential)| CredentialShare {
            credential_id: credential.id.clone(),
            idle,
            max_run,
        })
        .collect()
    }

    fn select_mapped(
        &self,
        state: &mut PluginState,
        eligible: &[&CredentialConfig],
        request: &EntryRequest,
    ) -> Vec<CredentialShare> {
        let domain = format!(
            "{}/{}",
            request.trust_domain,
            request
                .auth_methods
                .iter()
                .map(|m| m.name())
                .collect::<Vec<_>>()
                .join("+")
        );
        let iteration = state.iteration;
        let mut map = state.user_map.remove(&domain).unwrap_or_default();
        map.retain(|_, credential| eligible.iter().any(|c| &c.id == credential));

        let mut served: Vec<(&str, u64)> = Vec::new();
        for (user, jobs) in request.idle_users.iter().filter(|(_, jobs)| **jobs > 0) {
            let credential = match map.get(user) {
                Some(credential) => Some(credential.clone()),
                None => {
                    let unused = eligible
                        .iter()
                        .filter(|c| !map.values().any(|used| used == &c.id))
                        .min_by_key(|c| state.last_seen.get(&c.id).copied().unwrap_or(0))
                        .map(|c| c.id.clone());
                    let stolen = || {
                        map.iter()
                            .filter(|(assignee, _)| !request.idle_users.contains_key(*assignee))
                            .min_by_key(|(_, c)| state.last_seen.get(*c).copied().unwrap_or(0))
                            .map(|(assignee, c)| (assignee.clone(), c.clone()))
                    };
                    match unused {
                        Some(credential) => Some(credential),
                        None => match stolen() {
                            Some((assignee, credential)) => {
                                log::debug!(
                                    "Credential {credential} moves from {assignee} to {user}"
                                );
                                map.remove(&assignee);
                                Some(credential)
                            }
                            None => None,
                        },
                    }
                }
            };
            match credential {
                Some(credential) => {
                    map.insert(user.clone(), credential.clone());
                    state.last_seen.insert(credential, iteration);
                    served.push((user.as_str(), *jobs));
                }
                None => log::debug!(
                    "No free credential for user {user} on {}",
                    request.entry
                ),
            }
        }

        let shares = if served.is_empty() {
            vec![CredentialShare {
                credential_id: eligible[0].id.clone(),
                idle: request.min_idle,
                max_run: request.max_run,
            }]
        } else {
            let total_jobs: u64 = served.iter().map(|(_, jobs)| jobs).sum();
            let share = |jobs: u64, total: u64| {
                let value = jobs * total / total_jobs;
                if total > 0 { value.max(1) } else { value }
            };
            served
                .iter()
                .filter_map(|(user, jobs)| {
                    let credential = map.get(*user)?;
                    let max_run = share(*jobs, request.max_run);
                    Some(CredentialShare {
                        credential_id: credential.clone(),
                        idle: share(*jobs, request.min_idle).min(max_run),
                        max_run,
                    })
                })
                .collect()
        };
        if !map.is_empty() {
            state.user_map.insert(domain, map);
        }
        shares
    }
}
