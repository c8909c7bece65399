use std::cell::{Cell, RefCell};
use std::rc::Rc;

use classad::Map;

use crate::submit::{SubmitBackend, SubmitOutcome, SubmitRequest, SubmitResult};

#[derive(Default)]
struct ScheddSlot {
    /// Serializes submissions to the schedd.
    lock: tokio::sync::Mutex<()>,
    /// Pilots submitted by each Entry to this schedd in the current iteration.
    used: RefCell<Map<String, u32>>,
    submitted_total: Cell<u64>,
}

/// Submit budgets and locks of the schedds a Factory submits to.
///
/// All Entries on one schedd submit one after another; each Entry may submit at most
/// `max_submits_per_cycle` pilots per iteration to each schedd.
pub struct ScheddRegistry {
    max_submits_per_cycle: u32,
    schedds: RefCell<Map<String, Rc<ScheddSlot>>>,
}

impl ScheddRegistry {
    pub fn new(max_submits_per_cycle: u32) -> Self {
        Self {
            max_submits_per_cycle,
            schedds: Default::default(),
        }
    }

    pub fn max_submits_per_cycle(&self) -> u32 {
        self.max_submits_per_cycle
    }

    fn slot(&self, schedd: &str) -> Rc<ScheddSlot> {
        self.schedds
            .borrow_mut()
            .entry(schedd.to_string())
            .or_default()
            .clone()
    }

    /// Starts a new iteration with full budgets.
    pub fn reset_budgets(&self) {
        for slot in self.schedds.borrow().values() {
            slot.used.borrow_mut().clear();
        }
    }

    pub fn remaining_budget(&self, schedd: &str, entry: &str) -> u32 {
        let used = self
            .slot(schedd)
            .used
            .borrow()
            .get(entry)
            .copied()
            .unwrap_or(0);
        self.max_submits_per_cycle.saturating_sub(used)
    }

    /// Number of pilots submitted to a schedd since the start of the process.
    pub fn submitted_total(&self, schedd: &str) -> u64 {
        self.slot(schedd).submitted_total.get()
    }

    /// Submits through `backend` while holding the schedd lock, capped by the Entry's
    /// remaining budget.
    pub async fn submit(
        &self,
        backend: &dyn SubmitBackend,
        schedd: &str,
        mut request: SubmitRequest,
    ) -> SubmitResult<SubmitOutcome> {
        let slot = self.slot(schedd);
        let _guard = slot.lock.lock().await;

        let used = slot.used.borrow().get(&request.entry).copied().unwrap_or(0);
        let remaining = self.max_submits_per_cycle.saturating_sub(used);
        if remaining < request.count {
            log::debug!(
                "Entry {} reached the submit budget on {schedd}, submitting {remaining} of {}",
                request.entry,
                request.count
            );
            request.count = remaining;
        }
        if request.count == 0 {
            return Ok(SubmitOutcome::nothing());
        }

        let outcome = backend.submit(schedd, &request).await?;
        *slot
            .used
            .borrow_mut()
            .entry(request.entry.clone())
            .or_default() += outcome.submitted;
        slot.submitted_total
            .set(slot.submitted_total.get() + u64::from(outcome.submitted));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ScheddRegistry;
    use crate::tests::utils::{MockSubmitBackend, submit_request};

    #[tokio::test]
    async fn budget_is_per_entry_and_iteration() {
        let backend = MockSubmitBackend::new();
        let registry = ScheddRegistry::new(10);

        let outcome = registry
            .submit(&backend, "schedd1", submit_request("e1", 7))
            .await
            .unwrap();
        assert_eq!(outcome.submitted, 7);
        let outcome = registry
            .submit(&backend, "schedd1", submit_request("e1", 7))
            .await
            .unwrap();
        assert_eq!(outcome.submitted, 3);
        assert_eq!(registry.remaining_budget("schedd1", "e1"), 0);
        assert_eq!(registry.remaining_budget("schedd1", "e2"), 10);
        assert_eq!(registry.remaining_budget("schedd2", "e1"), 10);

        registry.reset_budgets();
        assert_eq!(registry.remaining_budget("schedd1", "e1"), 10);
        assert_eq!(registry.submitted_total("schedd1"), 10);
    }

    #[tokio::test]
    async fn partial_failure_only_charges_submitted_pilots() {
        let backend = MockSubmitBackend::new();
        backend.state.get_mut().fail_after = Some(2);
        let registry = ScheddRegistry::new(10);
        let outcome = registry
            .submit(&backend, "schedd1", submit_request("e1", 5))
            .await
            .unwrap();
        assert_eq!(outcome.submitted, 2);
        assert!(outcome.error.is_some());
        assert_eq!(registry.remaining_budget("schedd1", "e1"), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn submits_to_one_schedd_are_serialized() {
        let backend = MockSubmitBackend::new();
        backend.state.get_mut().submit_delay = Some(Duration::from_secs(1));
        let registry = ScheddRegistry::new(50);
        let (a, b, c) = tokio::join!(
            registry.submit(&backend, "schedd1", submit_request("e1", 5)),
            registry.submit(&backend, "schedd1", submit_request("e2", 5)),
            registry.submit(&backend, "schedd2", submit_request("e3", 5)),
        );
        assert_eq!(a.unwrap().submitted + b.unwrap().submitted + c.unwrap().submitted, 15);
        assert_eq!(backend.state.get().max_in_flight, 1);
    }
}
