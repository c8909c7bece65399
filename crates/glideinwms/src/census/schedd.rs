use classad::ClassAd;

const ATTR_TOTAL_RUNNING_JOBS: &str = "TotalRunningJobs";
const ATTR_MAX_JOBS_RUNNING: &str = "MaxJobsRunning";
const ATTR_TRANSFER_UPLOADING: &str = "TransferQueueNumUploading";
const ATTR_TRANSFER_MAX_UPLOADING: &str = "TransferQueueMaxUploading";
const ATTR_CURB_MATCHMAKING: &str = "CurbMatchmaking";

/// Fraction of a schedd limit above which the schedd is considered overloaded.
const OVERLOAD_FRACTION: f64 = 0.95;

fn over_limit(ad: &ClassAd, current: &str, max: &str) -> bool {
    let (Some(current), Some(max)) = (ad.get_real(current), ad.get_real(max)) else {
        return false;
    };
    max > 0.0 && current >= OVERLOAD_FRACTION * max
}

/// A schedd that cannot take more work is left out of the iteration.
pub fn is_overloaded(ad: &ClassAd) -> bool {
    over_limit(ad, ATTR_TOTAL_RUNNING_JOBS, ATTR_MAX_JOBS_RUNNING)
        || over_limit(ad, ATTR_TRANSFER_UPLOADING, ATTR_TRANSFER_MAX_UPLOADING)
        || ad.get_bool(ATTR_CURB_MATCHMAKING).unwrap_or(false)
}

/// Names of the configured schedds whose `Scheduler` ad reports them as overloaded.
pub fn blacklisted_schedds(configured: &[String], ads: &[ClassAd]) -> Vec<String> {
    configured
        .iter()
        .filter(|schedd| {
            ads.iter()
                .find(|ad| ad.name() == schedd.as_str())
                .is_some_and(|ad| {
                    let overloaded = is_overloaded(ad);
                    if overloaded {
                        log::warn!("Schedd {schedd} is overloaded, skipping it this iteration");
                    }
                    overloaded
                })
        })
        .cloned()
        .collect()
}
