//! The Factory: per Entry, it admits the requests of the Frontends and keeps the local queue
//! of pilots in line with them.
pub mod admission;
pub mod ads;
pub mod config;
pub mod held;
pub mod iteration;
pub mod process;
pub mod state;
pub mod totals;
pub mod work;

pub use config::{EntryConfig, FactoryConfig, FactorySnapshot};
pub use iteration::{FactoryContext, FactoryState, run_factory_iteration};
pub use process::{FactoryMessage, FactoryOptions, FactoryService, create_factory_service};
pub use state::EntryState;
