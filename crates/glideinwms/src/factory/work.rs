use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::factory::admission::{AdmittedRequest, materialize_credentials};
use crate::factory::config::{EntrySnapshot, FactorySnapshot};
use crate::factory::held::oldest_held;
use crate::factory::totals::{GlideinTotals, PilotCounts};
use crate::frontend::history::RemoveExcess;
use crate::submit::{
    PilotRecord, PilotState, RemoveMode, ScheddRegistry, SubmitBackend, SubmitRequest,
    pilots_constraint,
};

pub fn count_pilots<'a>(pilots: impl IntoIterator<Item = &'a PilotRecord>) -> PilotCounts {
    let mut counts = PilotCounts::default();
    for pilot in pilots {
        match pilot.state {
            PilotState::Idle => counts.idle += 1,
            PilotState::Running => counts.running += 1,
            PilotState::Held => counts.held += 1,
            PilotState::Removed | PilotState::Completed => {}
        }
    }
    counts
}

/// Queue of one Entry.
#[derive(Debug, Clone, Default)]
pub struct EntryPilots {
    pub pilots: Vec<PilotRecord>,
}

impl EntryPilots {
    pub fn new(pilots: Vec<PilotRecord>) -> Self {
        Self { pilots }
    }

    pub fn of_client<'a>(
        &'a self,
        client_name: &'a str,
        credential_id: &'a str,
    ) -> impl Iterator<Item = &'a PilotRecord> {
        self.pilots
            .iter()
            .filter(move |p| p.client_name == client_name && p.credential_id == credential_id)
    }

    pub fn counts(&self) -> PilotCounts {
        count_pilots(&self.pilots)
    }

    /// Counts per `<frontend>:<security_class>`.
    pub fn frontend_counts(&self) -> BTreeMap<String, PilotCounts> {
        let mut groups: BTreeMap<String, Vec<&PilotRecord>> = BTreeMap::new();
        for pilot in &self.pilots {
            groups
                .entry(format!("{}:{}", pilot.frontend_name, pilot.security_class))
                .or_default()
                .push(pilot);
        }
        groups
            .into_iter()
            .map(|(key, pilots)| (key, count_pilots(pilots)))
            .collect()
    }
}

/// How many idle pilots to submit for a client. Zero when the Entry does not accept work.
pub fn keep_idle_glideins(
    request: &AdmittedRequest,
    counts: PilotCounts,
    totals: &mut GlideinTotals<'_>,
    schedd_budget: u32,
    accepting: bool,
) -> u64 {
    let frontend_key = request.frontend_key();
    if !accepting || totals.is_over_limit(&frontend_key) {
        return 0;
    }
    let wanted = request
        .req_idle
        .saturating_sub(counts.idle)
        .min(request.req_max.saturating_sub(counts.total()))
        .min(u64::from(schedd_budget));
    totals.can_add_idle_glideins(wanted, &frontend_key)
}

fn newest_first<'a>(
    pilots: &[&'a PilotRecord],
    filter: impl Fn(&PilotRecord) -> bool,
) -> Vec<&'a PilotRecord> {
    let mut selected: Vec<&PilotRecord> = pilots.iter().copied().filter(|p| filter(p)).collect();
    selected.sort_by_key(|p| std::cmp::Reverse((p.submit_time, p.cluster, p.proc)));
    selected
}

/// Pilots to remove because the client asks for fewer than it has.
///
/// Idle pilots above `ReqMaxGlideins` are always removed. `WAIT` removes pilots not yet
/// handed to the site above the idle request, `IDLE` also queued ones, `ALL` also running
/// pilots above the maximum, and every held pilot once the maximum is zero.
pub fn clean_glidein_queue(request: &AdmittedRequest, pilots: &[&PilotRecord]) -> Vec<PilotRecord> {
    let counts = count_pilots(pilots.iter().copied());
    let margin = request.remove_margin;
    let unsubmitted = newest_first(pilots, |p| p.state == PilotState::Idle && !p.submitted_remotely);
    let queued = newest_first(pilots, |p| p.state == PilotState::Idle && p.submitted_remotely);
    let idle_candidates = unsubmitted.iter().chain(&queued);

    let over_max = (counts.idle + counts.running).saturating_sub(request.req_max);
    let idle_excess = match request.remove_excess {
        RemoveExcess::No => 0,
        RemoveExcess::Wait => counts
            .idle
            .saturating_sub(request.req_idle + margin)
            .min(unsubmitted.len() as u64),
        RemoveExcess::Idle | RemoveExcess::All => {
            counts.idle.saturating_sub(request.req_idle + margin)
        }
    };
    let idle_removed = over_max.min(counts.idle).max(idle_excess) as usize;
    let mut removed: Vec<PilotRecord> = idle_candidates
        .take(idle_removed)
        .map(|p| (*p).clone())
        .collect();

    if request.remove_excess == RemoveExcess::All {
        let remaining_idle = counts.idle - removed.len() as u64;
        let running_excess =
            (remaining_idle + counts.running).saturating_sub(request.req_max + margin);
        removed.extend(
            newest_first(pilots, |p| p.state == PilotState::Running)
                .into_iter()
                .take(running_excess as usize)
                .cloned(),
        );
        if request.req_max == 0 {
            removed.extend(
                pilots
                    .iter()
                    .filter(|p| p.state == PilotState::Held)
                    .map(|p| (*p).clone()),
            );
        }
    }
    removed
}

/// Idle pilots older than the lifetime the client asked for.
pub fn expired_idle(request: &AdmittedRequest, pilots: &[&PilotRecord], now: i64) -> Vec<PilotRecord> {
    if request.idle_lifetime == 0 {
        return Vec::new();
    }
    pilots
        .iter()
        .filter(|p| p.state == PilotState::Idle)
        .filter(|p| now - p.submit_time > request.idle_lifetime as i64)
        .map(|p| (*p).clone())
        .collect()
}

/// What one client was left with after an iteration acted on its pilots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientOutcome {
    /// Pilots by state once this iteration's submissions and removals are counted.
    pub counts: PilotCounts,
    /// Idle pilots not yet handed to the site.
    pub pending: u64,
    pub submitted: u32,
    pub removed: u32,
    pub submit_error: Option<String>,
}

impl ClientOutcome {
    fn new(pilots: &[&PilotRecord]) -> Self {
        Self {
            counts: count_pilots(pilots.iter().copied()),
            pending: pilots.iter().filter(|p| is_pending(p)).count() as u64,
            ..Default::default()
        }
    }

    fn add_submitted(&mut self, submitted: u32) {
        self.submitted += submitted;
        self.counts.idle += u64::from(submitted);
        self.pending += u64::from(submitted);
    }

    /// Takes the first `removed` of the targeted pilots out of the counts and returns them
    /// by state.
    fn add_removed(&mut self, targeted: &[PilotRecord], removed: u32) -> PilotCounts {
        let gone = &targeted[..targeted.len().min(removed as usize)];
        let counts = count_pilots(gone);
        self.removed += removed;
        self.counts.idle = self.counts.idle.saturating_sub(counts.idle);
        self.counts.running = self.counts.running.saturating_sub(counts.running);
        self.counts.held = self.counts.held.saturating_sub(counts.held);
        let pending = gone.iter().filter(|p| is_pending(p)).count() as u64;
        self.pending = self.pending.saturating_sub(pending);
        counts
    }
}

fn is_pending(pilot: &PilotRecord) -> bool {
    pilot.state == PilotState::Idle && !pilot.submitted_remotely
}

/// Submits and removes pilots of one Entry on its schedd.
pub struct EntryWork<'a> {
    pub factory: &'a FactorySnapshot,
    pub entry: &'a EntrySnapshot,
    pub backend: &'a dyn SubmitBackend,
    pub registry: &'a ScheddRegistry,
    pub now: i64,
}

impl EntryWork<'_> {
    fn schedd(&self) -> &str {
        &self.entry.config.schedd
    }

    /// Removes the given pilots. Failures are logged and count as nothing removed.
    pub async fn remove(&self, pilots: &[PilotRecord], mode: RemoveMode, why: &str) -> u32 {
        if pilots.is_empty() {
            return 0;
        }
        let constraint = pilots_constraint(pilots);
        match self.backend.remove(self.schedd(), &constraint, mode).await {
            Ok(count) => {
                log::info!(
                    "Entry {}: removed {count} pilot(s) ({why}, {mode})",
                    self.entry.name()
                );
                count
            }
            Err(error) => {
                log::warn!(
                    "Entry {}: cannot remove {} pilot(s) ({why}): {error:#}",
                    self.entry.name(),
                    pilots.len()
                );
                0
            }
        }
    }

    pub async fn release(&self, pilots: &[PilotRecord]) -> u32 {
        if pilots.is_empty() {
            return 0;
        }
        match self
            .backend
            .release(self.schedd(), &pilots_constraint(pilots))
            .await
        {
            Ok(count) => count,
            Err(error) => {
                log::warn!(
                    "Entry {}: cannot release held pilots: {error:#}",
                    self.entry.name()
                );
                0
            }
        }
    }

    pub fn submit_request(
        &self,
        request: &AdmittedRequest,
        count: u32,
        credential_files: Vec<PathBuf>,
    ) -> SubmitRequest {
        let entry = &self.entry.config;
        SubmitRequest {
            factory_name: self.factory.config.factory_name.clone(),
            glidein_name: self.factory.config.glidein_name.clone(),
            entry: entry.name.clone(),
            grid_resource: entry.grid_resource(),
            frontend_name: request.frontend_name.clone(),
            client_name: request.client_name.clone(),
            request_name: request.name.clone(),
            credential_id: request.credential_id.clone(),
            credential_type: request.credential_type,
            security_class: request.security_class.clone(),
            username: request.username.clone(),
            count,
            cores: entry.cpus,
            credential_files,
            params: request.params.clone(),
            submit_attrs: entry.submit_attrs.clone(),
        }
    }

    /// Brings the pilots of one client towards its request.
    pub async fn process(
        &self,
        request: &AdmittedRequest,
        pilots: &[&PilotRecord],
        totals: &mut GlideinTotals<'_>,
        accepting: bool,
    ) -> ClientOutcome {
        let frontend_key = request.frontend_key();
        let mut outcome = ClientOutcome::new(pilots);

        let held_excess = totals.held_excess(&frontend_key) as usize;
        if held_excess > 0 {
            let victims = oldest_held(pilots.iter().copied(), held_excess);
            let removed = self
                .remove(&victims, RemoveMode::Immediate, "too many held")
                .await;
            let removed = outcome.add_removed(&victims, removed);
            totals.remove_glideins(removed, &frontend_key);
        }

        let budget = self
            .registry
            .remaining_budget(self.schedd(), self.entry.name());
        let add = keep_idle_glideins(request, outcome.counts, totals, budget, accepting);
        let mut excess = Vec::new();
        if add > 0 {
            match materialize_credentials(&self.factory.scratch, self.entry.name(), request) {
                Ok(files) => {
                    let submit = self.submit_request(request, add as u32, files);
                    match self.registry.submit(self.backend, self.schedd(), submit).await {
                        Ok(result) => {
                            outcome.add_submitted(result.submitted);
                            if let Some(error) = result.error {
                                log::warn!(
                                    "Entry {}: submitted {} of {add} pilot(s) for {}: {error}",
                                    self.entry.name(),
                                    result.submitted,
                                    request.client_name
                                );
                                outcome.submit_error = Some(error);
                            }
                        }
                        Err(error) => {
                            log::error!(
                                "Entry {}: submission for {} failed: {error:#}",
                                self.entry.name(),
                                request.client_name
                            );
                            outcome.submit_error = Some(format!("{error:#}"));
                        }
                    }
                }
                Err(error) => {
                    log::warn!(
                        "Entry {}: cannot write credentials of {}: {error}",
                        self.entry.name(),
                        request.credential_id
                    );
                    outcome.submit_error = Some(error.to_string());
                }
            }
            totals.add_idle_glideins(add, u64::from(outcome.submitted), &frontend_key);
        } else {
            excess = clean_glidein_queue(request, pilots);
            let removed = self
                .remove(&excess, RemoveMode::Graceful, "above the request")
                .await;
            let removed = outcome.add_removed(&excess, removed);
            totals.remove_glideins(removed, &frontend_key);
        }

        let expired: Vec<PilotRecord> = expired_idle(request, pilots, self.now)
            .into_iter()
            .filter(|pilot| !excess.contains(pilot))
            .collect();
        let removed = self
            .remove(&expired, RemoveMode::Graceful, "idle lifetime exceeded")
            .await;
        outcome.add_removed(&expired, removed);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{EntryPilots, EntryWork, clean_glidein_queue, expired_idle, keep_idle_glideins};
    use crate::factory::admission::AdmittedRequest;
    use crate::factory::config::{EntryLimits, PilotLimits};
    use crate::factory::totals::{GlideinTotals, GlobalBudget, PilotCounts};
    use crate::frontend::history::RemoveExcess;
    use crate::submit::{PilotRecord, PilotState, ScheddRegistry};
    use crate::tests::utils::{
        FACTORY_SCHEDD, FactoryFixtureBuilder, MockSubmitBackend, factory_setup, pilot,
    };

    fn request(idle: u64, max: u64, remove_excess: RemoveExcess) -> AdmittedRequest {
        AdmittedRequest {
            name: "cred1_ce1@g@f@main@fe".to_string(),
            client_name: "fe.main".to_string(),
            frontend_name: "fe".to_string(),
            group_name: "main".to_string(),
            credential_id: "cred1".to_string(),
            credential_type: crate::credentials::CredentialType::Scitoken,
            security_class: "frontend".to_string(),
            username: "fepilot".to_string(),
            req_idle: idle,
            req_max: max,
            remove_excess,
            remove_margin: 0,
            idle_lifetime: 0,
            expires_at: i64::MAX,
            params: Default::default(),
            secrets: [(
                "ScitokenFile".to_string(),
                crate::credentials::Secret::new("token".to_string()),
            )]
            .into(),
        }
    }

    fn pilots(states: &[(PilotState, bool)]) -> Vec<PilotRecord> {
        states
            .iter()
            .enumerate()
            .map(|(i, (state, remote))| {
                let mut record = pilot("ce1", "fe.main", "cred1", *state);
                record.cluster = i as u64 + 1;
                record.submit_time = 1000 + i as i64;
                record.submitted_remotely = *remote;
                record
            })
            .collect()
    }

    fn counts(idle: u64, running: u64, held: u64) -> PilotCounts {
        PilotCounts {
            idle,
            running,
            held,
        }
    }

    #[test]
    fn idle_target_respects_max_and_limits() {
        let limits = EntryLimits::default();
        let global = GlobalBudget::new(1000, 0);
        let mut totals = GlideinTotals::new(&limits, [], &global);
        let req = request(10, 12, RemoveExcess::No);
        assert_eq!(keep_idle_glideins(&req, counts(2, 0, 0), &mut totals, 100, true), 8);
        assert_eq!(keep_idle_glideins(&req, counts(2, 8, 0), &mut totals, 100, true), 2);
        assert_eq!(keep_idle_glideins(&req, counts(2, 0, 0), &mut totals, 3, true), 3);
        assert_eq!(keep_idle_glideins(&req, counts(2, 0, 0), &mut totals, 100, false), 0);

        let tight = EntryLimits {
            total: PilotLimits {
                max_glideins: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut totals =
            GlideinTotals::new(&tight, [("fe:frontend".to_string(), counts(1, 3, 0))], &global);
        assert_eq!(keep_idle_glideins(&req, counts(1, 3, 0), &mut totals, 100, true), 0);
    }

    #[test]
    fn removal_by_excess_mode() {
        use PilotState::{Held, Idle, Running};
        let queue = pilots(&[
            (Idle, false),
            (Idle, false),
            (Idle, true),
            (Idle, true),
            (Running, true),
            (Running, true),
            (Held, true),
        ]);
        let refs: Vec<&PilotRecord> = queue.iter().collect();
        let clusters = |removed: Vec<PilotRecord>| {
            let mut ids: Vec<u64> = removed.iter().map(|p| p.cluster).collect();
            ids.sort();
            ids
        };

        assert!(clean_glidein_queue(&request(1, 100, RemoveExcess::No), &refs).is_empty());
        assert_eq!(
            clusters(clean_glidein_queue(&request(1, 100, RemoveExcess::Wait), &refs)),
            vec![1, 2]
        );
        assert_eq!(
            clusters(clean_glidein_queue(&request(1, 100, RemoveExcess::Idle), &refs)),
            vec![1, 2, 4]
        );
        assert_eq!(
            clusters(clean_glidein_queue(&request(0, 1, RemoveExcess::All), &refs)),
            vec![1, 2, 3, 4, 6]
        );
        assert_eq!(
            clusters(clean_glidein_queue(&request(0, 0, RemoveExcess::All), &refs)),
            vec![1, 2, 3, 4, 5, 6, 7]
        );
        // Idle pilots above the maximum go even without a removal request.
        assert_eq!(
            clusters(clean_glidein_queue(&request(0, 3, RemoveExcess::No), &refs)),
            vec![1, 2, 4]
        );
    }

    #[test]
    fn idle_lifetime() {
        let queue = pilots(&[(PilotState::Idle, true), (PilotState::Running, true)]);
        let refs: Vec<&PilotRecord> = queue.iter().collect();
        let mut req = request(5, 10, RemoveExcess::No);
        assert!(expired_idle(&req, &refs, 5000).is_empty());
        req.idle_lifetime = 3600;
        assert!(expired_idle(&req, &refs, 2000).is_empty());
        assert_eq!(expired_idle(&req, &refs, 10_000).len(), 1);
    }

    #[test]
    fn frontend_counts_group_pilots() {
        let mut queue = pilots(&[(PilotState::Idle, true), (PilotState::Running, true)]);
        queue[1].frontend_name = "other".to_string();
        let entry_pilots = EntryPilots::new(queue);
        let by_frontend = entry_pilots.frontend_counts();
        assert_eq!(by_frontend["fe:frontend"], counts(1, 0, 0));
        assert_eq!(by_frontend["other:frontend"], counts(0, 1, 0));
        assert_eq!(entry_pilots.of_client("fe.main", "cred1").count(), 2);
        assert_eq!(entry_pilots.counts(), counts(1, 1, 0));
    }

    #[tokio::test]
    async fn process_submits_then_trims() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let factory = factory_setup(dir.path(), FactoryFixtureBuilder::default());
        let backend = MockSubmitBackend::new();
        let registry = ScheddRegistry::new(100);
        let global = GlobalBudget::new(1000, 0);
        let limits = factory.entries[0].config.limits.clone();
        let work = EntryWork {
            factory: &factory,
            entry: &factory.entries[0],
            backend: &backend,
            registry: &registry,
            now: 10_000,
        };

        let mut totals = GlideinTotals::new(&limits, [], &global);
        let outcome = work
            .process(&request(4, 10, RemoveExcess::No), &[], &mut totals, true)
            .await;
        assert_eq!(outcome.submitted, 4);
        assert_eq!(outcome.counts, counts(4, 0, 0));
        assert_eq!(outcome.pending, 4);
        assert_eq!(backend.count(FACTORY_SCHEDD, PilotState::Idle), 4);
        {
            let state = backend.state.get();
            assert_eq!(state.submissions[0].entry, "ce1");
            assert_eq!(state.submissions[0].client_name, "fe.main");
        }

        let queue = backend.pilots(FACTORY_SCHEDD);
        let refs: Vec<&PilotRecord> = queue.iter().collect();
        let mut totals = GlideinTotals::new(&limits, [], &global);
        let outcome = work
            .process(&request(1, 10, RemoveExcess::Wait), &refs, &mut totals, true)
            .await;
        assert_eq!(outcome.submitted, 0);
        assert_eq!(outcome.removed, 3);
        assert_eq!(outcome.counts, counts(1, 0, 0));
        assert_eq!(outcome.pending, 1);
        assert_eq!(backend.count(FACTORY_SCHEDD, PilotState::Idle), 1);
    }
}
