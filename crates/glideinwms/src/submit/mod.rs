//! Local queue of pilots (an HTCondor schedd) used by the Factory.
mod condor;
mod registry;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use classad::{ClassAd, Expression};

pub use condor::CondorSubmitBackend;
pub use registry::ScheddRegistry;

use crate::credentials::CredentialType;

pub type SubmitResult<T> = anyhow::Result<T>;
pub type SubmitFuture<T> = Pin<Box<dyn Future<Output = SubmitResult<T>>>>;

pub const ATTR_CLUSTER_ID: &str = "ClusterId";
pub const ATTR_PROC_ID: &str = "ProcId";
pub const ATTR_JOB_STATUS: &str = "JobStatus";
pub const ATTR_HOLD_REASON_CODE: &str = "HoldReasonCode";
pub const ATTR_HOLD_REASON_SUBCODE: &str = "HoldReasonSubCode";
pub const ATTR_NUM_SYSTEM_HOLDS: &str = "NumSystemHolds";
pub const ATTR_QDATE: &str = "QDate";
pub const ATTR_ENTERED_STATUS: &str = "EnteredCurrentStatus";
pub const ATTR_GRID_JOB_STATUS: &str = "GridJobStatus";
pub const ATTR_REQUEST_CPUS: &str = "RequestCpus";
pub const ATTR_GLIDEIN_FACTORY: &str = "GlideinFactory";
pub const ATTR_GLIDEIN_NAME: &str = "GlideinName";
pub const ATTR_GLIDEIN_ENTRY: &str = "GlideinEntryName";
pub const ATTR_GLIDEIN_CLIENT: &str = "GlideinClient";
pub const ATTR_GLIDEIN_FRONTEND: &str = "GlideinFrontendName";
pub const ATTR_GLIDEIN_REQUEST: &str = "GlideinRequestName";
pub const ATTR_GLIDEIN_CREDENTIAL: &str = "GlideinCredentialIdentifier";
pub const ATTR_GLIDEIN_SECURITY_CLASS: &str = "GlideinSecurityClass";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PilotState {
    Idle,
    Running,
    Removed,
    Completed,
    Held,
}

impl PilotState {
    pub fn from_job_status(status: i64) -> Option<Self> {
        match status {
            1 => Some(PilotState::Idle),
            2 => Some(PilotState::Running),
            3 => Some(PilotState::Removed),
            4 => Some(PilotState::Completed),
            5 => Some(PilotState::Held),
            _ => None,
        }
    }

    pub fn job_status(self) -> i64 {
        match self {
            PilotState::Idle => 1,
            PilotState::Running => 2,
            PilotState::Removed => 3,
            PilotState::Completed => 4,
            PilotState::Held => 5,
        }
    }
}

/// One pilot job as seen in the local queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PilotRecord {
    pub cluster: u64,
    pub proc: u64,
    pub state: PilotState,
    pub hold_code: Option<i64>,
    pub hold_subcode: Option<i64>,
    pub num_system_holds: i64,
    pub entry: String,
    pub client_name: String,
    pub frontend_name: String,
    pub request_name: String,
    pub credential_id: String,
    pub security_class: String,
    pub cores: i64,
    pub submit_time: i64,
    pub entered_status_time: i64,
    /// `false` while the pilot was not yet handed to the remote site.
    pub submitted_remotely: bool,
}

impl PilotRecord {
    /// Reads a pilot from a queue ad. Ads that are not pilots of a Factory yield `None`.
    pub fn from_ad(ad: &ClassAd) -> Option<Self> {
        let state = PilotState::from_job_status(ad.get_int(ATTR_JOB_STATUS)?)?;
        let submit_time = ad.get_int(ATTR_QDATE).unwrap_or(0);
        Some(Self {
            cluster: ad.get_int(ATTR_CLUSTER_ID)?.try_into().ok()?,
            proc: ad.get_int(ATTR_PROC_ID)?.try_into().ok()?,
            state,
            hold_code: ad.get_int(ATTR_HOLD_REASON_CODE),
            hold_subcode: ad.get_int(ATTR_HOLD_REASON_SUBCODE),
            num_system_holds: ad.get_int(ATTR_NUM_SYSTEM_HOLDS).unwrap_or(0),
            entry: ad.get_str(ATTR_GLIDEIN_ENTRY)?.to_string(),
            client_name: ad.get_str(ATTR_GLIDEIN_CLIENT)?.to_string(),
            frontend_name: ad.get_str(ATTR_GLIDEIN_FRONTEND).unwrap_or_default().to_string(),
            request_name: ad.get_str(ATTR_GLIDEIN_REQUEST).unwrap_or_default().to_string(),
            credential_id: ad.get_str(ATTR_GLIDEIN_CREDENTIAL)?.to_string(),
            security_class: ad
                .get_str(ATTR_GLIDEIN_SECURITY_CLASS)
                .unwrap_or_default()
                .to_string(),
            cores: ad.get_int(ATTR_REQUEST_CPUS).unwrap_or(1),
            submit_time,
            entered_status_time: ad.get_int(ATTR_ENTERED_STATUS).unwrap_or(submit_time),
            submitted_remotely: ad
                .get_str(ATTR_GRID_JOB_STATUS)
                .is_some_and(|status| !status.eq_ignore_ascii_case("unsubmitted")),
        })
    }

    pub fn to_ad(&self) -> ClassAd {
        let mut ad = ClassAd::default()
            .with("MyType", "Job")
            .with(ATTR_CLUSTER_ID, self.cluster)
            .with(ATTR_PROC_ID, self.proc)
            .with(ATTR_JOB_STATUS, self.state.job_status())
            .with(ATTR_NUM_SYSTEM_HOLDS, self.num_system_holds)
            .with(ATTR_GLIDEIN_ENTRY, self.entry.as_str())
            .with(ATTR_GLIDEIN_CLIENT, self.client_name.as_str())
            .with(ATTR_GLIDEIN_FRONTEND, self.frontend_name.as_str())
            .with(ATTR_GLIDEIN_REQUEST, self.request_name.as_str())
            .with(ATTR_GLIDEIN_CREDENTIAL, self.credential_id.as_str())
            .with(ATTR_GLIDEIN_SECURITY_CLASS, self.security_class.as_str())
            .with(ATTR_REQUEST_CPUS, self.cores)
            .with(ATTR_QDATE, self.submit_time)
            .with(ATTR_ENTERED_STATUS, self.entered_status_time);
        if let Some(code) = self.hold_code {
            ad.insert(ATTR_HOLD_REASON_CODE, code);
        }
        if let Some(code) = self.hold_subcode {
            ad.insert(ATTR_HOLD_REASON_SUBCODE, code);
        }
        if self.submitted_remotely {
            ad.insert(ATTR_GRID_JOB_STATUS, "IDLE");
        }
        ad
    }

    pub fn id(&self) -> String {
        format!("{}.{}", self.cluster, self.proc)
    }
}

/// Constraint selecting exactly the given pilots.
pub fn pilots_constraint<'a>(pilots: impl IntoIterator<Item = &'a PilotRecord>) -> Expression {
    pilots
        .into_iter()
        .map(|p| {
            Expression::attr_equals_int(ATTR_CLUSTER_ID, p.cluster as i64)
                .and(&Expression::attr_equals_int(ATTR_PROC_ID, p.proc as i64))
        })
        .reduce(|acc, term| acc.or(&term))
        .unwrap_or_else(Expression::always_false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Let the pilot shut down on its own terms.
    Graceful,
    /// Forget the pilot right away, even if the remote site does not acknowledge it.
    Immediate,
    Hold,
}

impl Display for RemoveMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoveMode::Graceful => f.write_str("graceful"),
            RemoveMode::Immediate => f.write_str("immediate"),
            RemoveMode::Hold => f.write_str("hold"),
        }
    }
}

/// Pilots to submit for one (client, credential) group.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub factory_name: String,
    pub glidein_name: String,
    pub entry: String,
    /// `<grid_type> <gatekeeper>` of the Entry.
    pub grid_resource: String,
    pub frontend_name: String,
    pub client_name: String,
    pub request_name: String,
    pub credential_id: String,
    pub credential_type: CredentialType,
    pub security_class: String,
    pub username: String,
    /// Hard upper bound on the number of pilots.
    pub count: u32,
    pub cores: u32,
    pub credential_files: Vec<PathBuf>,
    pub params: BTreeMap<String, String>,
    pub submit_attrs: BTreeMap<String, String>,
}

impl SubmitRequest {
    /// Attributes every submitted pilot carries.
    pub fn pilot_attributes(&self) -> Vec<(&'static str, String)> {
        vec![
            (ATTR_GLIDEIN_FACTORY, self.factory_name.clone()),
            (ATTR_GLIDEIN_NAME, self.glidein_name.clone()),
            (ATTR_GLIDEIN_ENTRY, self.entry.clone()),
            (ATTR_GLIDEIN_CLIENT, self.client_name.clone()),
            (ATTR_GLIDEIN_FRONTEND, self.frontend_name.clone()),
            (ATTR_GLIDEIN_REQUEST, self.request_name.clone()),
            (ATTR_GLIDEIN_CREDENTIAL, self.credential_id.clone()),
            (ATTR_GLIDEIN_SECURITY_CLASS, self.security_class.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOutcome {
    /// First and last cluster ids of the submitted pilots.
    pub cluster_range: Option<(u64, u64)>,
    pub submitted: u32,
    /// Set when the backend stopped before submitting all requested pilots.
    pub error: Option<String>,
}

impl SubmitOutcome {
    pub fn nothing() -> Self {
        Self::default()
    }
}

/// Handler of one kind of local queue.
pub trait SubmitBackend {
    fn enum_pilots(&self, schedd: &str, constraint: &Expression) -> SubmitFuture<Vec<PilotRecord>>;

    /// Submits at most `request.count` pilots. Partial success is reported in the outcome.
    fn submit(&self, schedd: &str, request: &SubmitRequest) -> SubmitFuture<SubmitOutcome>;

    /// Removes the pilots matching the constraint and returns how many were affected.
    fn remove(&self, schedd: &str, constraint: &Expression, mode: RemoveMode) -> SubmitFuture<u32>;

    /// Releases held pilots matching the constraint.
    fn release(&self, schedd: &str, constraint: &Expression) -> SubmitFuture<u32>;

    fn reconfigure(&self, schedd: &str) -> SubmitFuture<()>;
}
