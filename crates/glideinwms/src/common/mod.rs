pub mod attrs;
pub mod cli;
pub mod config;
pub mod error;
pub mod rpc;
pub mod setup;
pub mod utils;
pub mod workdir;
