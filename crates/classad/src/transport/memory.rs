use std::collections::BTreeMap;
use std::time::Duration;

use crate::ad::{ATTR_AUTHENTICATED_IDENTITY, ClassAd};
use crate::common::{Map, WrappedRcRefCell};
use crate::transport::{Query, QuerySource, Transport, TransportError, TransportFuture};

type AdKey = (String, String);

fn ad_key(my_type: &str, name: &str) -> AdKey {
    (my_type.to_ascii_lowercase(), name.to_string())
}

#[derive(Default)]
struct CollectorState {
    pools: Map<String, BTreeMap<AdKey, ClassAd>>,
    queues: Map<String, Vec<ClassAd>>,
    failure: Option<TransportError>,
    delay: Option<Duration>,
    advertise_count: usize,
    invalidate_count: usize,
}

/// In-process directory service.
///
/// Several [`MemoryTransport`] clients with different identities can share one collector,
/// which lets a Frontend and a Factory talk to each other inside a single test.
#[derive(Clone, Default)]
pub struct MemoryCollector {
    state: WrappedRcRefCell<CollectorState>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport whose advertised ads carry `identity` as `AuthenticatedIdentity`.
    pub fn client(&self, identity: &str) -> MemoryTransport {
        MemoryTransport {
            collector: self.clone(),
            identity: identity.to_string(),
        }
    }

    /// Stores an ad as is, bypassing identity stamping.
    pub fn insert(&self, pool: &str, ad: ClassAd) {
        let key = ad_key(ad.my_type(), ad.name());
        self.state
            .get_mut()
            .pools
            .entry(pool.to_string())
            .or_default()
            .insert(key, ad);
    }

    pub fn get(&self, pool: &str, my_type: &str, name: &str) -> Option<ClassAd> {
        self.state
            .get()
            .pools
            .get(pool)
            .and_then(|ads| ads.get(&ad_key(my_type, name)))
            .cloned()
    }

    /// All ads of the given type in the pool, ordered by name.
    pub fn ads(&self, pool: &str, my_type: &str) -> Vec<ClassAd> {
        let my_type = my_type.to_ascii_lowercase();
        self.state
            .get()
            .pools
            .get(pool)
            .map(|ads| {
                ads.iter()
                    .filter(|((t, _), _)| *t == my_type)
                    .map(|(_, ad)| ad.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops an ad as if it expired.
    pub fn remove(&self, pool: &str, my_type: &str, name: &str) -> Option<ClassAd> {
        self.state
            .get_mut()
            .pools
            .get_mut(pool)
            .and_then(|ads| ads.remove(&ad_key(my_type, name)))
    }

    /// Replaces the job queue of a schedd.
    pub fn set_jobs(&self, schedd: &str, jobs: Vec<ClassAd>) {
        self.state
            .get_mut()
            .queues
            .insert(schedd.to_string(), jobs);
    }

    /// Makes every following call fail with `error` until reset with `None`.
    pub fn fail_with(&self, error: Option<TransportError>) {
        self.state.get_mut().failure = error;
    }

    /// Delays every following query by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.get_mut().delay = delay;
    }

    pub fn advertise_count(&self) -> usize {
        self.state.get().advertise_count
    }

    pub fn invalidate_count(&self) -> usize {
        self.state.get().invalidate_count
    }

    fn check_failure(&self) -> Result<(), TransportError> {
        match &self.state.get().failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    collector: MemoryCollector,
    identity: String,
}

impl MemoryTransport {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn collector(&self) -> &MemoryCollector {
        &self.collector
    }
}

impl Transport for MemoryTransport {
    fn query(&self, pool: &str, query: &Query) -> TransportFuture<Vec<ClassAd>> {
        let collector = self.collector.clone();
        let pool = pool.to_string();
        let query = query.clone();
        Box::pin(async move {
            let delay = collector.state.get().delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            collector.check_failure()?;

            let ads: Vec<ClassAd> = {
                let state = collector.state.get();
                match &query.source {
                    QuerySource::Collector => state
                        .pools
                        .get(&pool)
                        .map(|ads| ads.values().cloned().collect())
                        .unwrap_or_default(),
                    QuerySource::Schedd(schedd) => match state.queues.get(schedd) {
                        Some(jobs) => jobs.clone(),
                        None => {
                            return Err(TransportError::Unreachable(format!(
                                "Schedd {schedd} is not known to the collector"
                            )));
                        }
                    },
                }
            };
            Ok(query.apply(ads))
        })
    }

    fn advertise(&self, pool: &str, ad: &ClassAd) -> TransportFuture<()> {
        let collector = self.collector.clone();
        let pool = pool.to_string();
        let mut ad = ad.clone();
        let identity = self.identity.clone();
        Box::pin(async move {
            collector.check_failure()?;
            if ad.my_type().is_empty() || ad.name().is_empty() {
                return Err(TransportError::InvalidAd(
                    "An advertised ad needs both MyType and Name".to_string(),
                ));
            }
            ad.insert(ATTR_AUTHENTICATED_IDENTITY, identity);
            collector.insert(&pool, ad);
            collector.state.get_mut().advertise_count += 1;
            Ok(())
        })
    }

    fn invalidate(&self, pool: &str, my_type: &str, name: &str) -> TransportFuture<()> {
        let collector = self.collector.clone();
        let pool = pool.to_string();
        let key = ad_key(my_type, name);
        Box::pin(async move {
            collector.check_failure()?;
            let mut state = collector.state.get_mut();
            if let Some(ads) = state.pools.get_mut(&pool) {
                ads.remove(&key);
            }
            state.invalidate_count += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MemoryCollector;
    use crate::ClassAd;
    use crate::expr::Expression;
    use crate::transport::{Query, Transport, TransportError};

    #[tokio::test]
    async fn advertise_stamps_identity() {
        let collector = MemoryCollector::new();
        let client = collector.client("frontend@example.org");
        client
            .advertise("wms", &ClassAd::new("glideclient", "r@g@fe"))
            .await
            .unwrap();
        let ad = collector.get("wms", "glideclient", "r@g@fe").unwrap();
        assert_eq!(ad.authenticated_identity(), Some("frontend@example.org"));
        assert_eq!(collector.advertise_count(), 1);
    }

    #[tokio::test]
    async fn advertise_replaces_by_key() {
        let collector = MemoryCollector::new();
        let client = collector.client("fe");
        for idle in [1, 2] {
            client
                .advertise(
                    "wms",
                    &ClassAd::new("glideclient", "r@g@fe").with("ReqIdleGlideins", idle),
                )
                .await
                .unwrap();
        }
        let ads = collector.ads("wms", "glideclient");
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].get_int("ReqIdleGlideins"), Some(2));
    }

    #[tokio::test]
    async fn query_filters_by_type_and_constraint() {
        let collector = MemoryCollector::new();
        collector.insert("wms", ClassAd::new("glidefactory", "e1@g@f").with("GLIDEIN_CPUS", 8));
        collector.insert("wms", ClassAd::new("glidefactory", "e2@g@f").with("GLIDEIN_CPUS", 1));
        collector.insert("wms", ClassAd::new("glideclient", "r@g@fe"));

        let client = collector.client("fe");
        let ads = client
            .query(
                "wms",
                &Query::new("glidefactory").constraint(Expression::parse("GLIDEIN_CPUS > 4").unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].name(), "e1@g@f");
        assert!(client.query("other", &Query::new("glidefactory")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalidate_missing_ad_is_ok() {
        let collector = MemoryCollector::new();
        let client = collector.client("fe");
        collector.insert("wms", ClassAd::new("glideclient", "r@g@fe"));
        client.invalidate("wms", "glideclient", "r@g@fe").await.unwrap();
        client.invalidate("wms", "glideclient", "r@g@fe").await.unwrap();
        assert!(collector.ads("wms", "glideclient").is_empty());
        assert_eq!(collector.invalidate_count(), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_surfaced() {
        let collector = MemoryCollector::new();
        let client = collector.client("fe");
        collector.fail_with(Some(TransportError::AuthDenied("denied".to_string())));
        assert!(matches!(
            client.query("wms", &Query::new("glidefactory")).await,
            Err(TransportError::AuthDenied(_))
        ));
        assert!(client.advertise("wms", &ClassAd::new("x", "y")).await.is_err());
        collector.fail_with(None);
        assert!(client.advertise("wms", &ClassAd::new("x", "y")).await.is_ok());
    }

    #[tokio::test]
    async fn job_queries_read_schedd_queue() {
        let collector = MemoryCollector::new();
        collector.set_jobs(
            "schedd1@submit",
            vec![
                ClassAd::default().with("MyType", "Job").with("JobStatus", 1),
                ClassAd::default().with("MyType", "Job").with("JobStatus", 2),
            ],
        );
        let client = collector.client("fe");
        let query = Query::jobs("schedd1@submit")
            .constraint(Expression::parse("JobStatus == 1").unwrap());
        assert_eq!(client.query("user", &query).await.unwrap().len(), 1);
        assert!(matches!(
            client.query("user", &Query::jobs("unknown")).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_query_respects_timeout() {
        let collector = MemoryCollector::new();
        collector.set_delay(Some(Duration::from_secs(30)));
        let client = collector.client("fe");
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.query("wms", &Query::new("glidefactory")),
        )
        .await;
        assert!(result.is_err());
    }
}
