//! Access to the directory service (collector) and to schedd job queues.
//!
//! A transport exposes three verbs: query, advertise and invalidate. Calls either fully
//! succeed or fail; nothing is retried inside a call, callers retry on their next tick.
mod condor;
mod memory;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub use condor::CondorTransport;
pub use memory::{MemoryCollector, MemoryTransport};

use crate::ad::{ATTR_MY_TYPE, ClassAd};
use crate::expr::Expression;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Collector unreachable: {0}")]
    Unreachable(String),
    #[error("Authorization denied: {0}")]
    AuthDenied(String),
    #[error("Invalid ClassAd: {0}")]
    InvalidAd(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Local error: {0}")]
    Local(String),
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Local(error.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
pub type TransportFuture<T> = Pin<Box<dyn Future<Output = TransportResult<T>>>>;

/// Where a query is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    /// The collector of the pool.
    Collector,
    /// The job queue of one schedd registered in the pool.
    Schedd(String),
}

#[derive(Debug, Clone)]
pub struct Query {
    pub my_type: String,
    pub source: QuerySource,
    pub constraint: Option<Expression>,
    pub projection: Option<Vec<String>>,
}

impl Query {
    pub fn new(my_type: &str) -> Self {
        Self {
            my_type: my_type.to_string(),
            source: QuerySource::Collector,
            constraint: None,
            projection: None,
        }
    }

    /// Job query against one schedd.
    pub fn jobs(schedd: &str) -> Self {
        Self {
            source: QuerySource::Schedd(schedd.to_string()),
            ..Self::new("Job")
        }
    }

    /// Adds a constraint; several constraints are combined with `&&`.
    pub fn constraint(mut self, constraint: Expression) -> Self {
        self.constraint = Some(match self.constraint.take() {
            Some(existing) => existing.and(&constraint),
            None => constraint,
        });
        self
    }

    pub fn projection(mut self, attributes: Vec<String>) -> Self {
        self.projection = Some(attributes);
        self
    }

    pub fn matches(&self, ad: &ClassAd) -> bool {
        ad.get_str(ATTR_MY_TYPE)
            .is_some_and(|t| t.eq_ignore_ascii_case(&self.my_type))
            && self.constraint.as_ref().is_none_or(|c| c.matches(ad))
    }

    /// Filters and projects raw results of the underlying service.
    pub(crate) fn apply(&self, ads: Vec<ClassAd>) -> Vec<ClassAd> {
        ads.into_iter()
            .filter(|ad| self.matches(ad))
            .map(|mut ad| {
                if let Some(attributes) = &self.projection {
                    ad.project(attributes);
                }
                ad
            })
            .collect()
    }
}

/// Adapter over the directory service.
///
/// The returned futures are not `Send`; all control loops drive them on a
/// single-threaded runtime.
pub trait Transport {
    /// Returns all ads of the query type satisfying its constraint, or an error.
    fn query(&self, pool: &str, query: &Query) -> TransportFuture<Vec<ClassAd>>;

    /// Update-or-insert keyed by `(MyType, Name)`.
    fn advertise(&self, pool: &str, ad: &ClassAd) -> TransportFuture<()>;

    /// Deletes the ad with the given key. Deleting a missing ad is not an error.
    fn invalidate(&self, pool: &str, my_type: &str, name: &str) -> TransportFuture<()>;
}
