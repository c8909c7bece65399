//! The Frontend: per group, it watches the user pool and asks the Factories for pilots.
pub mod config;
pub mod history;
pub mod iteration;
pub mod limits;
pub mod plugins;
pub mod process;
pub mod request;
pub mod resource;

pub use config::{FrontendConfig, FrontendSnapshot, GroupConfig, GroupSnapshot};
pub use iteration::{GroupContext, GroupState, run_group_iteration};
pub use process::{FrontendMessage, FrontendOptions, FrontendService, create_frontend_service};
