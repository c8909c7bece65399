use std::cell::Cell;

use classad::Map;

use crate::factory::config::{EntryLimits, PilotLimits};

/// Pilots of one scope by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PilotCounts {
    pub idle: u64,
    pub running: u64,
    pub held: u64,
}

impl PilotCounts {
    pub fn total(&self) -> u64 {
        self.idle + self.running + self.held
    }
}

/// Pilots of the whole Factory, shared by the Entries of one iteration.
#[derive(Debug, Default)]
pub struct GlobalBudget {
    max_glideins: u64,
    total: Cell<u64>,
}

impl GlobalBudget {
    pub fn new(max_glideins: u64, total: u64) -> Self {
        Self {
            max_glideins,
            total: Cell::new(total),
        }
    }

    pub fn headroom(&self) -> u64 {
        self.max_glideins.saturating_sub(self.total.get())
    }

    pub fn total(&self) -> u64 {
        self.total.get()
    }

    /// Takes up to `wanted` pilots of the headroom. Entries sharing the budget see the
    /// reservation immediately, before any submission completes.
    fn reserve(&self, wanted: u64) -> u64 {
        let granted = wanted.min(self.headroom());
        self.total.set(self.total.get() + granted);
        granted
    }

    fn release(&self, count: u64) {
        self.total.set(self.total.get().saturating_sub(count));
    }
}

struct Scope {
    limits: PilotLimits,
    counts: PilotCounts,
}

impl Scope {
    fn idle_headroom(&self) -> u64 {
        self.limits.max_idle.saturating_sub(self.counts.idle)
    }

    fn total_headroom(&self) -> u64 {
        self.limits.max_glideins.saturating_sub(self.counts.total())
    }

    fn held_excess(&self) -> u64 {
        self.counts.held.saturating_sub(self.limits.max_held)
    }
}

/// Pilot counts of one Entry against its limits, kept current within an iteration so that
/// a client sees the submissions done for clients handled before it.
pub struct GlideinTotals<'a> {
    limits: &'a EntryLimits,
    entry: Scope,
    frontends: Map<String, Scope>,
    global: &'a GlobalBudget,
}

impl<'a> GlideinTotals<'a> {
    /// `frontends` are the current counts per `<frontend>:<security_class>`.
    pub fn new(
        limits: &'a EntryLimits,
        frontends: impl IntoIterator<Item = (String, PilotCounts)>,
        global: &'a GlobalBudget,
    ) -> Self {
        let frontends: Map<String, Scope> = frontends
            .into_iter()
            .map(|(key, counts)| {
                let scope = Scope {
                    limits: limits.for_frontend(&key),
                    counts,
                };
                (key, scope)
            })
            .collect();
        let mut counts = PilotCounts::default();
        for scope in frontends.values() {
            counts.idle += scope.counts.idle;
            counts.running += scope.counts.running;
            counts.held += scope.counts.held;
        }
        Self {
            limits,
            entry: Scope {
                limits: limits.total,
                counts,
            },
            frontends,
            global,
        }
    }

    fn frontend(&mut self, key: &str) -> &mut Scope {
        let limits = self.limits.for_frontend(key);
        self.frontends
            .entry(key.to_string())
            .or_insert_with(|| Scope {
                limits,
                counts: PilotCounts::default(),
            })
    }

    pub fn entry_counts(&self) -> PilotCounts {
        self.entry.counts
    }

    /// How many of `wanted` idle pilots may be added for a Frontend.
    ///
    /// The result is reserved in the Factory-wide budget and must be settled with
    /// [`GlideinTotals::add_idle_glideins`].
    pub fn can_add_idle_glideins(&mut self, wanted: u64, frontend_key: &str) -> u64 {
        let entry_idle = self.entry.idle_headroom();
        let entry_total = self.entry.total_headroom();
        let frontend = self.frontend(frontend_key);
        let local = wanted
            .min(entry_idle)
            .min(entry_total)
            .min(frontend.idle_headroom())
            .min(frontend.total_headroom());
        self.global.reserve(local)
    }

    /// Counts `submitted` of the `reserved` pilots and gives the rest back to the Factory.
    pub fn add_idle_glideins(&mut self, reserved: u64, submitted: u64, frontend_key: &str) {
        self.entry.counts.idle += submitted;
        self.frontend(frontend_key).counts.idle += submitted;
        self.global.release(reserved.saturating_sub(submitted));
    }

    /// Records removed pilots so later clients see the freed room.
    pub fn remove_glideins(&mut self, removed: PilotCounts, frontend_key: &str) {
        let subtract = |counts: &mut PilotCounts| {
            counts.idle = counts.idle.saturating_sub(removed.idle);
            counts.running = counts.running.saturating_sub(removed.running);
            counts.held = counts.held.saturating_sub(removed.held);
        };
        subtract(&mut self.entry.counts);
        subtract(&mut self.frontend(frontend_key).counts);
    }

    /// The Entry or the Frontend already has at least as many pilots as allowed.
    pub fn is_over_limit(&mut self, frontend_key: &str) -> bool {
        let entry_full = self.entry.total_headroom() == 0;
        let frontend = self.frontend(frontend_key);
        entry_full || frontend.total_headroom() == 0
    }

    /// Held pilots above `max_held` of the Entry or the Frontend, whichever is more.
    pub fn held_excess(&mut self, frontend_key: &str) -> u64 {
        let entry = self.entry.held_excess();
        entry.max(self.frontend(frontend_key).held_excess())
    }
}

#[cfg(test)]
mod tests {
    use super::{GlideinTotals, GlobalBudget, PilotCounts};
    use crate::factory::config::{EntryLimits, PilotLimits};

    fn limits() -> EntryLimits {
        EntryLimits {
            total: PilotLimits {
                max_glideins: 20,
                max_idle: 10,
                max_held: 3,
            },
            per_frontend: PilotLimits {
                max_glideins: 15,
                max_idle: 8,
                max_held: 2,
            },
            frontends: [(
                "vip:frontend".to_string(),
                PilotLimits {
                    max_glideins: 20,
                    max_idle: 10,
                    max_held: 5,
                },
            )]
            .into(),
        }
    }

    fn counts(idle: u64, running: u64, held: u64) -> PilotCounts {
        PilotCounts {
            idle,
            running,
            held,
        }
    }

    #[test]
    fn clamps_by_every_scope() {
        let limits = limits();
        let global = GlobalBudget::new(1000, 0);
        let mut totals = GlideinTotals::new(
            &limits,
            [("fe:frontend".to_string(), counts(2, 3, 0))],
            &global,
        );
        // Frontend idle headroom 6.
        assert_eq!(totals.can_add_idle_glideins(50, "fe:frontend"), 6);
        totals.add_idle_glideins(6, 6, "fe:frontend");
        assert_eq!(totals.can_add_idle_glideins(50, "fe:frontend"), 0);
        // Entry idle headroom is now 2.
        assert_eq!(totals.can_add_idle_glideins(50, "vip:frontend"), 2);
        totals.add_idle_glideins(2, 2, "vip:frontend");
        assert_eq!(totals.entry_counts(), counts(10, 3, 0));
        assert_eq!(global.total(), 8);
    }

    #[test]
    fn global_budget_is_shared() {
        let limits = limits();
        let global = GlobalBudget::new(10, 7);
        let mut first = GlideinTotals::new(&limits, [], &global);
        assert_eq!(first.can_add_idle_glideins(5, "fe:frontend"), 3);
        first.add_idle_glideins(3, 3, "fe:frontend");
        let mut second = GlideinTotals::new(&limits, [], &global);
        assert_eq!(second.can_add_idle_glideins(5, "fe:frontend"), 0);
    }

    #[test]
    fn reservation_holds_until_settled() {
        let limits = limits();
        let global = GlobalBudget::new(10, 0);
        let mut first = GlideinTotals::new(&limits, [], &global);
        let mut second = GlideinTotals::new(&limits, [], &global);

        // Both Entries ask before either submission finishes.
        assert_eq!(first.can_add_idle_glideins(8, "fe:frontend"), 8);
        assert_eq!(second.can_add_idle_glideins(8, "fe:frontend"), 2);
        assert_eq!(global.headroom(), 0);

        // Only 5 of the first reservation went through.
        first.add_idle_glideins(8, 5, "fe:frontend");
        assert_eq!(global.total(), 7);
        assert_eq!(first.entry_counts(), counts(5, 0, 0));
        second.add_idle_glideins(2, 0, "fe:frontend");
        assert_eq!(global.total(), 5);
        assert_eq!(second.can_add_idle_glideins(8, "fe:frontend"), 5);
    }

    #[test]
    fn limits_and_held_excess() {
        let limits = limits();
        let global = GlobalBudget::new(1000, 0);
        let mut totals = GlideinTotals::new(
            &limits,
            [
                ("fe:frontend".to_string(), counts(0, 12, 4)),
                ("vip:frontend".to_string(), counts(0, 2, 0)),
            ],
            &global,
        );
        assert!(totals.is_over_limit("fe:frontend"));
        assert!(!totals.is_over_limit("vip:frontend"));
        assert_eq!(totals.held_excess("fe:frontend"), 2);
        assert_eq!(totals.held_excess("vip:frontend"), 1);

        totals.remove_glideins(counts(0, 0, 2), "fe:frontend");
        assert_eq!(totals.held_excess("fe:frontend"), 0);
        assert!(!totals.is_over_limit("fe:frontend"));
    }
}
