#![deny(clippy::await_holding_refcell_ref)]

//! ClassAds, the expression language evaluated over them and the transports that move them
//! between a collector and its clients.

pub mod ad;
pub mod common;
pub mod expr;
pub mod tools;
pub mod transport;

pub use ad::{ClassAd, Value, quote_string};
pub use common::{Map, Set, WrappedRcRefCell};
pub use expr::{EvalError, EvalMode, EvalValue, Expression, Record, Scope};
pub use transport::{
    CondorTransport, MemoryCollector, MemoryTransport, Query, QuerySource, Transport,
    TransportError, TransportFuture, TransportResult,
};
