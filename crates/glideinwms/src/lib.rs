#![deny(clippy::await_holding_refcell_ref)]

//! Control loops that provision pilots: Frontend groups request them from Factory Entries,
//! which submit them to the local schedd.

pub mod census;
pub mod common;
pub mod credentials;
pub mod crypto;
pub mod downtime;
pub mod factory;
pub mod frontend;
pub mod matching;
pub mod stats;
pub mod submit;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::GwmsError;
pub type Result<T> = std::result::Result<T, Error>;

// Reexports
pub use classad;
pub use classad::{Map, Set, WrappedRcRefCell};

pub const GWMS_VERSION: &str = match option_env!("GWMS_BUILD_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};
