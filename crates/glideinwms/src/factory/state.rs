use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use crate::factory::config::{EntrySnapshot, FactorySnapshot};

/// (pool, MyType, Name) of a published ad.
pub type AdKey = (String, String, String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryState {
    #[default]
    Active,
    /// Advertised with `InDowntime`, submits nothing.
    Downtime,
    /// Disabled or removed, waiting for its pilots to finish.
    Draining,
    Stopped,
}

impl EntryState {
    pub fn name(self) -> &'static str {
        match self {
            EntryState::Active => "Active",
            EntryState::Downtime => "Downtime",
            EntryState::Draining => "Draining",
            EntryState::Stopped => "Stopped",
        }
    }

    pub fn accepts_requests(self) -> bool {
        self == EntryState::Active
    }

    /// State of the next iteration. A drained Entry stops once it has no pilots left.
    pub fn next(configured: bool, drain: bool, in_downtime: bool, pilots: u64) -> EntryState {
        match (configured && !drain, in_downtime) {
            (true, true) => EntryState::Downtime,
            (true, false) => EntryState::Active,
            (false, _) if pilots > 0 => EntryState::Draining,
            (false, _) => EntryState::Stopped,
        }
    }
}

impl Display for EntryState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What an Entry keeps between iterations.
#[derive(Debug)]
pub struct EntryRuntime {
    /// Last configuration of the Entry; kept after it disappears from the configuration.
    pub entry: EntrySnapshot,
    /// `false` once the Entry was removed or disabled.
    pub configured: bool,
    pub state: EntryState,
    /// Requests rejected because of their signature, per claimed client, since the start.
    pub rejected_signatures: BTreeMap<String, u64>,
    pub advertised: BTreeSet<AdKey>,
}

impl EntryRuntime {
    pub fn new(entry: EntrySnapshot) -> Self {
        Self {
            entry,
            configured: true,
            state: EntryState::Active,
            rejected_signatures: Default::default(),
            advertised: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.entry.name()
    }

    pub fn drain(&self) -> bool {
        !self.configured || self.entry.config.drain
    }
}

/// Matches the runtimes to a new configuration. Entries no longer configured are kept for
/// draining; stopped ones that are gone from the configuration are dropped.
pub fn reconcile_entries(
    factory: &FactorySnapshot,
    previous: BTreeMap<String, EntryRuntime>,
) -> BTreeMap<String, EntryRuntime> {
    let mut runtimes = BTreeMap::new();
    let mut previous = previous;
    for entry in &factory.entries {
        let runtime = match previous.remove(entry.name()) {
            Some(mut runtime) => {
                runtime.entry = entry.clone();
                runtime.configured = true;
                runtime
            }
            None => EntryRuntime::new(entry.clone()),
        };
        runtimes.insert(entry.name().to_string(), runtime);
    }
    for (name, mut runtime) in previous {
        if runtime.state == EntryState::Stopped && runtime.advertised.is_empty() {
            log::info!("Entry {name} is stopped and no longer configured");
            continue;
        }
        if runtime.configured {
            log::info!("Entry {name} was removed from the configuration, draining it");
        }
        runtime.configured = false;
        runtimes.insert(name, runtime);
    }
    runtimes
}
