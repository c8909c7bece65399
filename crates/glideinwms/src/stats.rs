//! Monitoring records emitted once per Frontend group iteration and once per Factory Entry
//! iteration, and the sinks they are written to.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::common::error::ErrorKind;

static ITERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Monotonic number of the next iteration, shared by all loops of the process.
pub fn next_iteration() -> u64 {
    ITERATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Per-Entry numbers of one Frontend group iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryRecord {
    pub entry: String,
    pub prop_idle: u64,
    pub hereonly_idle: u64,
    pub effective_idle: u64,
    pub min_idle: u64,
    pub max_run: u64,
    pub glideins_total: u64,
    pub glideins_idle: u64,
    pub glideins_running: u64,
    pub requests: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub limits_triggered: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: u64,
    pub group: String,
    /// Start of the iteration (epoch seconds).
    pub time: i64,
    pub duration_ms: u64,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub jobs_idle: u64,
    pub jobs_running: u64,
    pub unmatched_idle: u64,
    pub unmatched_running: u64,
    pub match_errors: u64,
    pub requests_published: u32,
    pub requests_invalidated: u32,
    pub publish_errors: u32,
    pub entries: Vec<EntryRecord>,
}

/// Outcome of one Factory Entry iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryIterationRecord {
    pub iteration: u64,
    pub factory: String,
    pub entry: String,
    pub time: i64,
    pub duration_ms: u64,
    pub state: String,
    pub in_downtime: bool,
    pub requests_received: u32,
    pub requests_accepted: u32,
    /// Dropped requests by reason.
    pub rejected: BTreeMap<String, u32>,
    pub submitted: u32,
    pub removed: u32,
    pub released: u32,
    pub submit_errors: u32,
    pub pilots_idle: u32,
    pub pilots_running: u32,
    pub pilots_held: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatsEvent {
    GroupIteration(IterationRecord),
    EntryIteration(EntryIterationRecord),
}

pub trait StatsSink {
    fn emit(&self, event: StatsEvent);
}

/// Writes a one-line summary of every record into the log.
#[derive(Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn emit(&self, event: StatsEvent) {
        match event {
            StatsEvent::GroupIteration(record) => {
                if record.aborted {
                    log::warn!(
                        "Group {} iteration {} aborted after {} ms ({}): {}",
                        record.group,
                        record.iteration,
                        record.duration_ms,
                        record.error_kind.map(ErrorKind::name).unwrap_or("unknown"),
                        record.error.as_deref().unwrap_or("unknown reason")
                    );
                } else {
                    log::info!(
                        "Group {} iteration {}: {} idle/{} running jobs, {} unmatched, {} requests published, {} invalidated, {} match errors ({} ms)",
                        record.group,
                        record.iteration,
                        record.jobs_idle,
                        record.jobs_running,
                        record.unmatched_idle,
                        record.requests_published,
                        record.requests_invalidated,
                        record.match_errors,
                        record.duration_ms
                    );
                }
            }
            StatsEvent::EntryIteration(record) => {
                log::info!(
                    "Entry {} iteration {} ({}): {}/{} requests accepted, submitted {}, removed {}, released {}, pilots {} idle/{} running/{} held",
                    record.entry,
                    record.iteration,
                    record.state,
                    record.requests_accepted,
                    record.requests_received,
                    record.submitted,
                    record.removed,
                    record.released,
                    record.pilots_idle,
                    record.pilots_running,
                    record.pilots_held
                );
            }
        }
    }
}

/// Appends every record as one JSON object per line.
pub struct JsonLinesSink {
    file: RefCell<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create_or_append(path: &Path) -> crate::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: RefCell::new(BufWriter::new(file)),
        })
    }

    fn store(&self, event: &StatsEvent) -> crate::Result<()> {
        let mut file = self.file.borrow_mut();
        serde_json::to_writer(&mut *file, event)?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

impl StatsSink for JsonLinesSink {
    fn emit(&self, event: StatsEvent) {
        if let Err(error) = self.store(&event) {
            log::error!("Cannot write stats record: {error:?}");
        }
    }
}

/// Forwards every record to several sinks.
pub struct FanOutSink {
    sinks: Vec<Box<dyn StatsSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Box<dyn StatsSink>>) -> Self {
        Self { sinks }
    }
}

impl StatsSink for FanOutSink {
    fn emit(&self, event: StatsEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
