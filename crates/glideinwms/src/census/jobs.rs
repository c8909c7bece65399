use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use classad::{ClassAd, Set};
use smallvec::SmallVec;

const ATTR_JOB_STATUS: &str = "JobStatus";
const ATTR_ENTERED_STATUS: &str = "EnteredCurrentStatus";
const ATTR_SERVER_TIME: &str = "ServerTime";
const ATTR_VOMS_FQAN: &str = "x509UserProxyFirstFQAN";
const ATTR_USER_PROXY: &str = "x509userproxy";
const ATTR_USER: &str = "User";
const ATTR_REQUEST_CPUS: &str = "RequestCpus";
const ATTR_REMOTE_HOST: &str = "RemoteHost";

/// Jobs idle for at least this long are "old" and feed the idle reserve.
const OLD_IDLE_AGE: i64 = 600;
const IDLE_HOUR_AGE: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobClass {
    Idle,
    OldIdle,
    Idle3600,
    VomsIdle,
    ProxyIdle,
    Running,
    Held,
}

impl JobClass {
    pub const ALL: [JobClass; 7] = [
        JobClass::Idle,
        JobClass::OldIdle,
        JobClass::Idle3600,
        JobClass::VomsIdle,
        JobClass::ProxyIdle,
        JobClass::Running,
        JobClass::Held,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobClass::Idle => "Idle",
            JobClass::OldIdle => "OldIdle",
            JobClass::Idle3600 => "Idle_3600",
            JobClass::VomsIdle => "VomsIdle",
            JobClass::ProxyIdle => "ProxyIdle",
            JobClass::Running => "Running",
            JobClass::Held => "Held",
        }
    }

    pub fn is_idle(self) -> bool {
        !matches!(self, JobClass::Running | JobClass::Held)
    }
}

impl Display for JobClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One user job with the classes it falls into.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub schedd: String,
    pub ad: ClassAd,
    pub classes: SmallVec<[JobClass; 4]>,
    pub user: String,
    pub cpus: i64,
    /// Slot the job runs in, for running jobs.
    pub remote_host: Option<String>,
}

impl JobRecord {
    /// Classifies a queue ad. Jobs that are neither idle, running nor held yield `None`.
    pub fn classify(schedd: &str, ad: ClassAd, now: i64) -> Option<Self> {
        let mut classes = SmallVec::new();
        match ad.get_int(ATTR_JOB_STATUS)? {
            1 => {
                classes.push(JobClass::Idle);
                let server_time = ad.get_int(ATTR_SERVER_TIME).unwrap_or(now);
                let idle_for = ad
                    .get_int(ATTR_ENTERED_STATUS)
                    .map(|entered| server_time - entered)
                    .unwrap_or(0);
                if idle_for >= OLD_IDLE_AGE {
                    classes.push(JobClass::OldIdle);
                }
                if idle_for >= IDLE_HOUR_AGE {
                    classes.push(JobClass::Idle3600);
                }
                if ad.contains(ATTR_VOMS_FQAN) {
                    classes.push(JobClass::VomsIdle);
                }
                if ad.contains(ATTR_USER_PROXY) {
                    classes.push(JobClass::ProxyIdle);
                }
            }
            2 => classes.push(JobClass::Running),
            5 => classes.push(JobClass::Held),
            _ => return None,
        }
        Some(Self {
            schedd: schedd.to_string(),
            user: ad.get_str(ATTR_USER).unwrap_or_default().to_string(),
            cpus: ad.get_int(ATTR_REQUEST_CPUS).unwrap_or(1).max(1),
            remote_host: ad.get_str(ATTR_REMOTE_HOST).map(str::to_string),
            ad,
            classes,
        })
    }

    pub fn has(&self, class: JobClass) -> bool {
        self.classes.contains(&class)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobCensus {
    pub jobs: Vec<JobRecord>,
    pub counts: BTreeMap<JobClass, u64>,
    pub users: Set<String>,
    pub idle_users: Set<String>,
}

impl JobCensus {
    pub fn new(queues: Vec<(String, Vec<ClassAd>)>, now: i64) -> Self {
        let mut census = JobCensus::default();
        for (schedd, ads) in queues {
            for ad in ads {
                if let Some(job) = JobRecord::classify(&schedd, ad, now) {
                    census.add(job);
                }
            }
        }
        census
    }

    fn add(&mut self, job: JobRecord) {
        for class in &job.classes {
            *self.counts.entry(*class).or_default() += 1;
        }
        if !job.user.is_empty() {
            self.users.insert(job.user.clone());
            if job.has(JobClass::Idle) {
                self.idle_users.insert(job.user.clone());
            }
        }
        self.jobs.push(job);
    }

    pub fn count(&self, class: JobClass) -> u64 {
        self.counts.get(&class).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use classad::ClassAd;

    use super::{JobCensus, JobClass, JobRecord};

    fn job(status: i64) -> ClassAd {
        ClassAd::new("Job", "1.0")
            .with("JobStatus", status)
            .with("EnteredCurrentStatus", 1000)
            .with("User", "alice@example.org")
    }

    #[test]
    fn idle_classes() {
        let record = JobRecord::classify("s1", job(1), 1100).unwrap();
        assert_eq!(record.classes.as_slice(), &[JobClass::Idle]);

        let record = JobRecord::classify("s1", job(1).with("x509userproxy", "/tmp/p"), 1600).unwrap();
        assert_eq!(
            record.classes.as_slice(),
            &[JobClass::Idle, JobClass::OldIdle, JobClass::ProxyIdle]
        );

        let record = JobRecord::classify(
            "s1",
            job(1)
                .with("ServerTime", 5000)
                .with("x509UserProxyFirstFQAN", "/vo/Role=NULL"),
            1100,
        )
        .unwrap();
        assert_eq!(
            record.classes.as_slice(),
            &[JobClass::Idle, JobClass::OldIdle, JobClass::Idle3600, JobClass::VomsIdle]
        );
    }

    #[test]
    fn other_states() {
        let running = JobRecord::classify("s1", job(2).with("RemoteHost", "slot1@wn"), 0).unwrap();
        assert!(running.has(JobClass::Running));
        assert_eq!(running.remote_host.as_deref(), Some("slot1@wn"));
        assert!(JobRecord::classify("s1", job(5), 0).unwrap().has(JobClass::Held));
        assert!(JobRecord::classify("s1", job(4), 0).is_none());
        assert!(JobRecord::classify("s1", ClassAd::new("Job", "x"), 0).is_none());
    }

    #[test]
    fn census_counters() {
        let census = JobCensus::new(
            vec![
                ("s1".to_string(), vec![job(1), job(1).with("User", "bob"), job(2)]),
                ("s2".to_string(), vec![job(2).with("User", "carol"), job(3)]),
            ],
            1100,
        );
        assert_eq!(census.jobs.len(), 4);
        assert_eq!(census.count(JobClass::Idle), 2);
        assert_eq!(census.count(JobClass::Running), 2);
        assert_eq!(census.count(JobClass::Held), 0);
        assert_eq!(census.users.len(), 3);
        assert_eq!(census.idle_users.len(), 2);
        assert_eq!(census.jobs[3].schedd, "s2");
    }
}
