//! Partitioning of user jobs across Entries.
//!
//! Jobs are first clustered by the attributes the match expression can observe, so that the
//! expression runs once per (cluster, Entry) pair instead of once per (job, Entry) pair.
//! Clusters matching the same set of Entries form a *unique set*; the jobs of a unique set
//! are shared equally among its Entries.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use classad::expr::entry_cpus;
use classad::{ClassAd, EvalError, Expression, Map, Scope, Set, Value};
use serde::{Deserialize, Serialize};

use crate::census::{EntryDescription, JobCensus, JobClass};
use crate::common::error::{GwmsError, config_error};

pub const JOB_ROOT: &str = "job";
pub const GLIDEIN_ROOT: &str = "glidein";

const DEFAULT_JOB_QUERY: &str = "JobUniverse == 5 && IS_MONITOR_VM =!= true";

/// Guards `ceil` against float noise when a share sums up to an integer.
const SHARE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    String,
    Int,
    Real,
    Bool,
}

impl AttrType {
    fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (AttrType::String, Value::Str(_))
                | (AttrType::Int, Value::Int(_))
                | (AttrType::Real, Value::Real(_) | Value::Int(_))
                | (AttrType::Bool, Value::Bool(_))
        )
    }
}

/// Matching part of a Frontend or group configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchingConfig {
    #[serde(default)]
    pub match_expr: Option<Expression>,
    #[serde(default)]
    pub job_query_expr: Option<Expression>,
    #[serde(default)]
    pub factory_query_expr: Option<Expression>,
    #[serde(default)]
    pub job_match_attrs: BTreeMap<String, AttrType>,
    #[serde(default)]
    pub factory_match_attrs: BTreeMap<String, AttrType>,
}

/// Compiled matching rules of one group: the Frontend-wide and group rules combined.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPolicy {
    pub match_expr: Expression,
    pub job_query: Expression,
    pub factory_query: Expression,
    pub job_attrs: BTreeMap<String, AttrType>,
    pub factory_attrs: BTreeMap<String, AttrType>,
    /// Job attributes that decide the outcome of `match_expr`.
    cluster_attrs: Vec<String>,
}

fn combine(parts: [&Option<Expression>; 2]) -> Option<Expression> {
    parts
        .into_iter()
        .flatten()
        .cloned()
        .reduce(|acc, expr| acc.and(&expr))
}

impl MatchPolicy {
    pub fn compile(frontend: &MatchingConfig, group: &MatchingConfig) -> crate::Result<Self> {
        let match_expr = combine([&frontend.match_expr, &group.match_expr])
            .unwrap_or_else(Expression::always_true);
        for name in match_expr.identifiers() {
            if name != JOB_ROOT && name != GLIDEIN_ROOT {
                return config_error(format!(
                    "Match expression `{match_expr}` refers to `{name}`; only `{JOB_ROOT}` and `{GLIDEIN_ROOT}` are available"
                ));
            }
        }
        let job_query = match combine([&frontend.job_query_expr, &group.job_query_expr]) {
            Some(expr) => expr,
            None => Expression::parse(DEFAULT_JOB_QUERY)?,
        };
        let factory_query = combine([&frontend.factory_query_expr, &group.factory_query_expr])
            .unwrap_or_else(Expression::always_true);

        let mut job_attrs = frontend.job_match_attrs.clone();
        job_attrs.extend(group.job_match_attrs.clone());
        let mut factory_attrs = frontend.factory_match_attrs.clone();
        factory_attrs.extend(group.factory_match_attrs.clone());

        let mut cluster_attrs: Vec<String> = job_attrs.keys().cloned().collect();
        cluster_attrs.extend(match_expr.member_names(JOB_ROOT));
        cluster_attrs.sort_unstable();
        cluster_attrs.dedup();

        Ok(Self {
            match_expr,
            job_query,
            factory_query,
            job_attrs,
            factory_attrs,
            cluster_attrs,
        })
    }

    pub fn cluster_attrs(&self) -> &[String] {
        &self.cluster_attrs
    }
}

/// When and how widely evaluation is spread over blocking workers.
#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    pub threshold: usize,
    pub workers: usize,
}

impl Default for FanOut {
    fn default() -> Self {
        Self {
            threshold: 10000,
            workers: 4,
        }
    }
}

/// Jobs attributed to one Entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryMatch {
    /// Jobs shared proportionally with the other Entries they match, rounded up.
    pub prop: BTreeMap<JobClass, u64>,
    /// Jobs that match only this Entry.
    pub hereonly: BTreeMap<JobClass, u64>,
    /// Every job matching this Entry.
    pub total: BTreeMap<JobClass, u64>,
    /// Pilots worth of cores, shared like `prop`.
    pub prop_cores: BTreeMap<JobClass, u64>,
    /// Idle matching jobs per user.
    pub idle_users: BTreeMap<String, u64>,
}

fn get(counts: &BTreeMap<JobClass, u64>, class: JobClass) -> u64 {
    counts.get(&class).copied().unwrap_or(0)
}

impl EntryMatch {
    pub fn prop(&self, class: JobClass) -> u64 {
        get(&self.prop, class)
    }

    pub fn hereonly(&self, class: JobClass) -> u64 {
        get(&self.hereonly, class)
    }

    pub fn total(&self, class: JobClass) -> u64 {
        get(&self.total, class)
    }

    pub fn prop_cores(&self, class: JobClass) -> u64 {
        get(&self.prop_cores, class)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    /// Every Entry of the census, matched or not.
    pub entries: BTreeMap<String, EntryMatch>,
    pub unmatched: BTreeMap<JobClass, u64>,
    pub match_errors: u64,
}

impl MatchResult {
    pub fn entry(&self, name: &str) -> Option<&EntryMatch> {
        self.entries.get(name)
    }

    pub fn unmatched(&self, class: JobClass) -> u64 {
        get(&self.unmatched, class)
    }
}

/// Jobs with identical values of the cluster attributes.
struct Cluster {
    representative: usize,
    jobs: Vec<usize>,
}

fn cluster_jobs(policy: &MatchPolicy, jobs: &JobCensus) -> Vec<Cluster> {
    let mut mismatched: Set<&str> = Set::new();
    let mut clusters: BTreeMap<Vec<Option<String>>, Cluster> = BTreeMap::new();
    for (index, job) in jobs.jobs.iter().enumerate() {
        for (name, attr_type) in &policy.job_attrs {
            if let Some(value) = job.ad.get(name) {
                if !attr_type.accepts(value) && mismatched.insert(name.as_str()) {
                    log::warn!(
                        "Job attribute {name} is declared as {attr_type:?} but job {} has {}",
                        job.ad.name(),
                        value.to_literal()
                    );
                }
            }
        }
        let key = policy
            .cluster_attrs
            .iter()
            .map(|name| job.ad.get(name).map(Value::to_literal))
            .collect();
        clusters
            .entry(key)
            .or_insert_with(|| Cluster {
                representative: index,
                jobs: Vec::new(),
            })
            .jobs
            .push(index);
    }
    clusters.into_values().collect()
}

fn check_entry_attrs(policy: &MatchPolicy, entries: &[EntryDescription]) {
    for (name, attr_type) in &policy.factory_attrs {
        for entry in entries {
            if let Some(value) = entry.attrs.get(name) {
                if !attr_type.accepts(value) {
                    log::warn!(
                        "Entry attribute {name} is declared as {attr_type:?} but Entry {} has {}",
                        entry.name,
                        value.to_literal()
                    );
                    break;
                }
            }
        }
    }
}

/// Outcome of evaluating representatives against a slice of Entries.
struct Evaluation {
    /// `matches[r][e]`: representative `r` matches Entry `e` of the slice.
    matches: Vec<Vec<bool>>,
    errors: u64,
}

fn evaluate(
    expr: &Expression,
    representatives: &[ClassAd],
    entries: &[EntryDescription],
    cancelled: &AtomicBool,
) -> Option<Evaluation> {
    let mut evaluation = Evaluation {
        matches: Vec::with_capacity(representatives.len()),
        errors: 0,
    };
    for job in representatives {
        if cancelled.load(Ordering::Relaxed) {
            return None;
        }
        let row = entries
            .iter()
            .map(|entry| {
                let scope = Scope::strict()
                    .bind_record(JOB_ROOT, job)
                    .bind_record(GLIDEIN_ROOT, entry);
                match expr.eval_bool(&scope) {
                    Ok(result) => result,
                    Err(EvalError::MissingAttribute(name)) => {
                        log::debug!(
                            "Job {} does not match Entry {}: missing attribute {name}",
                            job.name(),
                            entry.name
                        );
                        false
                    }
                    Err(error) => {
                        log::debug!(
                            "Match expression failed for job {} and Entry {}: {error}",
                            job.name(),
                            entry.name
                        );
                        evaluation.errors += 1;
                        false
                    }
                }
            })
            .collect();
        evaluation.matches.push(row);
    }
    Some(evaluation)
}

/// Stops the blocking workers when the matching future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

async fn evaluate_fanned_out(
    expr: &Expression,
    representatives: Vec<ClassAd>,
    entries: &[EntryDescription],
    workers: usize,
) -> crate::Result<Evaluation> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let _guard = CancelOnDrop(cancelled.clone());
    let expr = Arc::new(expr.clone());
    let representatives = Arc::new(representatives);
    let chunk_size = entries.len().div_ceil(workers.max(1)).max(1);

    let handles: Vec<_> = entries
        .chunks(chunk_size)
        .map(|chunk| {
            let expr = expr.clone();
            let representatives = representatives.clone();
            let chunk = chunk.to_vec();
            let cancelled = cancelled.clone();
            tokio::task::spawn_blocking(move || {
                evaluate(&expr, &representatives, &chunk, &cancelled)
            })
        })
        .collect();

    let mut evaluation = Evaluation {
        matches: vec![Vec::with_capacity(entries.len()); representatives.len()],
        errors: 0,
    };
    for handle in handles {
        let part = handle
            .await
            .map_err(|error| GwmsError::GenericError(format!("Match worker failed: {error}")))?
            .ok_or_else(|| GwmsError::GenericError("Matching was cancelled".to_string()))?;
        evaluation.errors += part.errors;
        for (row, part_row) in evaluation.matches.iter_mut().zip(part.matches) {
            row.extend(part_row);
        }
    }
    Ok(evaluation)
}

/// Partitions the jobs of the census across the Entries.
pub async fn match_jobs(
    policy: &MatchPolicy,
    jobs: &JobCensus,
    entries: &[EntryDescription],
    fan_out: FanOut,
) -> crate::Result<MatchResult> {
    check_entry_attrs(policy, entries);
    let clusters = cluster_jobs(policy, jobs);
    let representatives: Vec<ClassAd> = clusters
        .iter()
        .map(|cluster| jobs.jobs[cluster.representative].ad.clone())
        .collect();

    let evaluation = if jobs.jobs.len() > fan_out.threshold && fan_out.workers > 1 {
        log::debug!(
            "Matching {} jobs in {} clusters against {} entries on {} workers",
            jobs.jobs.len(),
            clusters.len(),
            entries.len(),
            fan_out.workers
        );
        evaluate_fanned_out(&policy.match_expr, representatives, entries, fan_out.workers).await?
    } else {
        let cancelled = AtomicBool::new(false);
        evaluate(&policy.match_expr, &representatives, entries, &cancelled)
            .ok_or_else(|| GwmsError::GenericError("Matching was cancelled".to_string()))?
    };

    Ok(partition(jobs, entries, &clusters, evaluation))
}

fn partition(
    jobs: &JobCensus,
    entries: &[EntryDescription],
    clusters: &[Cluster],
    evaluation: Evaluation,
) -> MatchResult {
    let mut unique_sets: BTreeMap<Vec<usize>, Vec<usize>> = BTreeMap::new();
    for (cluster, row) in evaluation.matches.iter().enumerate() {
        let matched: Vec<usize> = row
            .iter()
            .enumerate()
            .filter_map(|(entry, matched)| matched.then_some(entry))
            .collect();
        unique_sets.entry(matched).or_default().push(cluster);
    }

    let mut result = MatchResult {
        match_errors: evaluation.errors,
        ..Default::default()
    };
    let mut prop: Map<usize, BTreeMap<JobClass, f64>> = Map::new();
    let mut prop_cores: Map<usize, BTreeMap<JobClass, f64>> = Map::new();
    let mut entry_matches: Vec<EntryMatch> = vec![EntryMatch::default(); entries.len()];

    for (set, set_clusters) in &unique_sets {
        let mut counts: BTreeMap<JobClass, u64> = BTreeMap::new();
        let mut cpus: BTreeMap<JobClass, i64> = BTreeMap::new();
        let mut users: BTreeMap<&str, u64> = BTreeMap::new();
        for job in set_clusters
            .iter()
            .flat_map(|cluster| clusters[*cluster].jobs.iter())
            .map(|index| &jobs.jobs[*index])
        {
            for class in &job.classes {
                *counts.entry(*class).or_default() += 1;
                *cpus.entry(*class).or_default() += job.cpus;
            }
            if job.has(JobClass::Idle) && !job.user.is_empty() {
                *users.entry(job.user.as_str()).or_default() += 1;
            }
        }

        if set.is_empty() {
            for (class, count) in counts {
                *result.unmatched.entry(class).or_default() += count;
            }
            continue;
        }

        let size = set.len() as f64;
        for entry in set {
            let entry_cpus = entry_cpus(&entries[*entry].attrs) as f64;
            let entry_match = &mut entry_matches[*entry];
            for (class, count) in &counts {
                *prop.entry(*entry).or_default().entry(*class).or_default() += *count as f64 / size;
                *entry_match.total.entry(*class).or_default() += count;
                if set.len() == 1 {
                    *entry_match.hereonly.entry(*class).or_default() += count;
                }
            }
            for (class, cpus) in &cpus {
                *prop_cores.entry(*entry).or_default().entry(*class).or_default() +=
                    *cpus as f64 / size / entry_cpus;
            }
            for (user, count) in &users {
                *entry_match.idle_users.entry(user.to_string()).or_default() += count;
            }
        }
    }

    let round_up = |value: f64| (value - SHARE_EPSILON).ceil().max(0.0) as u64;
    for (index, (entry, mut entry_match)) in entries.iter().zip(entry_matches).enumerate() {
        if let Some(shares) = prop.get(&index) {
            entry_match.prop = shares
                .iter()
                .map(|(class, share)| (*class, round_up(*share)))
                .collect();
        }
        if let Some(shares) = prop_cores.get(&index) {
            entry_match.prop_cores = shares
                .iter()
                .map(|(class, share)| (*class, round_up(*share)))
                .collect();
        }
        result.entries.insert(entry.name.clone(), entry_match);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use classad::{ClassAd, Expression};

    use super::{AttrType, FanOut, MatchPolicy, MatchingConfig, match_jobs};
    use crate::census::{EntryDescription, JobCensus, JobClass};
    use crate::common::error::GwmsError;

    fn entry(name: &str, site: &str, cpus: i64) -> EntryDescription {
        EntryDescription::from_ad(
            "wms",
            ClassAd::new("glidefactory", &format!("{name}@g@f"))
                .with("GLIDEIN_Site", site)
                .with("GLIDEIN_CPUS", cpus),
        )
        .unwrap()
    }

    fn job(site: &str, status: i64, user: &str) -> ClassAd {
        ClassAd::new("Job", "1.0")
            .with("JobStatus", status)
            .with("DESIRED_Sites", site)
            .with("RequestCpus", 1)
            .with("User", user)
    }

    fn policy(expr: &str) -> MatchPolicy {
        MatchPolicy::compile(
            &MatchingConfig::default(),
            &MatchingConfig {
                match_expr: Some(Expression::parse(expr).unwrap()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn site_policy() -> MatchPolicy {
        policy(r#"glidein["attrs"]["GLIDEIN_Site"] in split(job.DESIRED_Sites, ",")"#)
    }

    fn census(jobs: Vec<ClassAd>) -> JobCensus {
        JobCensus::new(vec![("s1".to_string(), jobs)], 0)
    }

    #[test]
    fn compile_combines_and_validates() {
        let frontend = MatchingConfig {
            match_expr: Some(Expression::parse("job.RequestCpus <= glideinCpus(glidein)").unwrap()),
            job_match_attrs: BTreeMap::from([("RequestMemory".to_string(), AttrType::Int)]),
            ..Default::default()
        };
        let group = MatchingConfig {
            match_expr: Some(Expression::parse("job.Owner != \"bad\"").unwrap()),
            ..Default::default()
        };
        let policy = MatchPolicy::compile(&frontend, &group).unwrap();
        assert_eq!(
            policy.match_expr.source(),
            "(job.RequestCpus <= glideinCpus(glidein)) && (job.Owner != \"bad\")"
        );
        assert_eq!(policy.job_query.source(), "JobUniverse == 5 && IS_MONITOR_VM =!= true");
        assert_eq!(policy.cluster_attrs(), &["Owner", "RequestCpus", "RequestMemory"]);

        let bad = MatchingConfig {
            match_expr: Some(Expression::parse("job.A == Other").unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            MatchPolicy::compile(&MatchingConfig::default(), &bad),
            Err(GwmsError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn proportional_partition() {
        let entries = vec![entry("e1", "A", 1), entry("e2", "B", 1), entry("e3", "C", 4)];
        let jobs = census(vec![
            job("A", 1, "u1"),
            job("A", 1, "u1"),
            job("A,B", 1, "u2"),
            job("A,B", 1, "u2"),
            job("A,B", 1, "u2"),
            job("A,B", 2, "u2"),
            job("Z", 1, "u3"),
        ]);
        let result = match_jobs(&site_policy(), &jobs, &entries, FanOut::default())
            .await
            .unwrap();

        let e1 = result.entry("e1@g@f").unwrap();
        // 2 here-only + 3 shared idle jobs split over two entries
        assert_eq!(e1.prop(JobClass::Idle), 4);
        assert_eq!(e1.hereonly(JobClass::Idle), 2);
        assert_eq!(e1.total(JobClass::Idle), 5);
        assert_eq!(e1.prop(JobClass::Running), 1);
        assert_eq!(e1.idle_users.get("u1"), Some(&2));
        assert_eq!(e1.idle_users.get("u2"), Some(&3));

        let e2 = result.entry("e2@g@f").unwrap();
        assert_eq!(e2.prop(JobClass::Idle), 2);
        assert_eq!(e2.hereonly(JobClass::Idle), 0);
        assert_eq!(e2.prop_cores(JobClass::Idle), 2);

        let e3 = result.entry("e3@g@f").unwrap();
        assert_eq!(e3, &Default::default());
        assert_eq!(result.unmatched(JobClass::Idle), 1);
        assert_eq!(result.match_errors, 0);
    }

    #[tokio::test]
    async fn cores_are_divided_by_entry_cpus() {
        let entries = vec![entry("e1", "A", 4)];
        let jobs = census((0..5).map(|_| job("A", 1, "u1").with("RequestCpus", 2)).collect());
        let result = match_jobs(&site_policy(), &jobs, &entries, FanOut::default())
            .await
            .unwrap();
        assert_eq!(result.entry("e1@g@f").unwrap().prop_cores(JobClass::Idle), 3);
    }

    #[tokio::test]
    async fn failures_do_not_match() {
        let entries = vec![entry("e1", "A", 1)];
        let jobs = census(vec![
            job("A", 1, "u1").with("Weight", 0),
            job("A", 1, "u1").with("Weight", "heavy"),
            job("A", 1, "u1"),
        ]);
        let result = match_jobs(&policy("10 / job.Weight > 1"), &jobs, &entries, FanOut::default())
            .await
            .unwrap();
        // division by zero and a type error count, the missing attribute does not
        assert_eq!(result.match_errors, 2);
        assert_eq!(result.unmatched(JobClass::Idle), 3);
    }

    #[tokio::test]
    async fn fan_out_gives_same_result() {
        let entries: Vec<_> = (0..7)
            .map(|i| entry(&format!("e{i}"), &format!("S{}", i % 3), 1))
            .collect();
        let jobs = census(
            (0..60)
                .map(|i| job(&format!("S{},S{}", i % 3, (i + 1) % 4), 1 + (i % 2), "u"))
                .collect(),
        );
        let sequential = match_jobs(&site_policy(), &jobs, &entries, FanOut::default())
            .await
            .unwrap();
        let parallel = match_jobs(
            &site_policy(),
            &jobs,
            &entries,
            FanOut {
                threshold: 10,
                workers: 3,
            },
        )
        .await
        .unwrap();
        assert_eq!(sequential, parallel);
    }
}
