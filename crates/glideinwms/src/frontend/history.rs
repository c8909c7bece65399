use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::error::GwmsError;

/// Iterations without idle jobs after which surplus unsubmitted pilots are removed.
const IDLE0_THRESHOLD: u32 = 5;
/// Iterations with only idle pilots after which idle pilots are removed.
const GLIDEEMPTY_THRESHOLD: u32 = 10;
/// Iterations without any pilot after which the request asks for a full cleanup.
const GLIDETOTAL0_THRESHOLD: u32 = 10;

/// How aggressively a Factory may remove pilots that exceed the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoveExcess {
    #[default]
    No,
    /// Remove pilots that were not submitted to the site yet.
    Wait,
    /// Also remove pilots queued idle at the site.
    Idle,
    /// Also remove running and held pilots.
    All,
}

impl RemoveExcess {
    pub fn name(self) -> &'static str {
        match self {
            RemoveExcess::No => "NO",
            RemoveExcess::Wait => "WAIT",
            RemoveExcess::Idle => "IDLE",
            RemoveExcess::All => "ALL",
        }
    }
}

impl Display for RemoveExcess {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RemoveExcess {
    type Err = GwmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NO" | "" => Ok(RemoveExcess::No),
            "WAIT" => Ok(RemoveExcess::Wait),
            "IDLE" => Ok(RemoveExcess::Idle),
            "ALL" => Ok(RemoveExcess::All),
            _ => Err(GwmsError::GenericError(format!(
                "Unknown removal type `{value}`"
            ))),
        }
    }
}

/// What one iteration saw on one Entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryObservation {
    pub idle_jobs: u64,
    pub idle_glideins: u64,
    pub total_glideins: u64,
}

/// Consecutive-iteration counters of one Entry, kept across iterations of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryHistory {
    idle0: u32,
    glideempty: u32,
    glidetotal0: u32,
}

fn bump(counter: u32, condition: bool) -> u32 {
    if condition { counter + 1 } else { 0 }
}

impl EntryHistory {
    /// History after one more observation. The current value is not modified so that an
    /// aborted iteration leaves no trace.
    pub fn observe(&self, observation: EntryObservation) -> EntryHistory {
        EntryHistory {
            idle0: bump(self.idle0, observation.idle_jobs == 0),
            glideempty: bump(
                self.glideempty,
                observation.total_glideins > 0
                    && observation.idle_glideins == observation.total_glideins,
            ),
            glidetotal0: bump(self.glidetotal0, observation.total_glideins == 0),
        }
    }

    /// Removal level the Entry's requests ask for.
    pub fn remove_excess(&self) -> RemoveExcess {
        if self.idle0 <= IDLE0_THRESHOLD {
            return RemoveExcess::No;
        }
        if self.glidetotal0 > GLIDETOTAL0_THRESHOLD {
            RemoveExcess::All
        } else if self.glideempty > GLIDEEMPTY_THRESHOLD {
            RemoveExcess::Idle
        } else {
            RemoveExcess::Wait
        }
    }
}
