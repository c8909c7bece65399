use glideinwms::census::{EntryDescription, JobCensus};
use glideinwms::classad::{ClassAd, Expression};
use glideinwms::matching::{MatchPolicy, MatchingConfig};

const SITES: [&str; 4] = ["CERN", "FNAL", "UCSD", "UNL"];

pub fn create_entries(count: usize) -> Vec<EntryDescription> {
    (0..count)
        .map(|index| {
            let ad = ClassAd::new("glidefactory", &format!("entry{index}@gfactory@factory"))
                .with("GLIDEIN_Site", SITES[index % SITES.len()])
                .with("GLIDEIN_CPUS", 1 + (index % 8) as i64);
            EntryDescription::from_ad("wms", ad).unwrap()
        })
        .collect()
}

/// Idle jobs spread over a few distinct site lists so that they form several clusters.
pub fn create_jobs(count: usize) -> JobCensus {
    let jobs = (0..count)
        .map(|index| {
            let sites = SITES[..1 + index % SITES.len()].join(",");
            ClassAd::new("Job", &format!("{index}.0"))
                .with("JobUniverse", 5)
                .with("JobStatus", 1)
                .with("DESIRED_Sites", sites)
                .with("RequestCpus", 1 + (index % 2) as i64)
                .with("User", format!("user{}", index % 16))
        })
        .collect();
    JobCensus::new(vec![("schedd1".to_string(), jobs)], 0)
}

pub fn site_policy() -> MatchPolicy {
    MatchPolicy::compile(
        &MatchingConfig::default(),
        &MatchingConfig {
            match_expr: Some(
                Expression::parse(
                    r#"glidein["attrs"]["GLIDEIN_Site"] in split(job.DESIRED_Sites, ",")"#,
                )
                .unwrap(),
            ),
            ..Default::default()
        },
    )
    .unwrap()
}
