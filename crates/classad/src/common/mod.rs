mod data_structures;
pub(crate) mod parser;
mod wrapped;

pub use data_structures::{Map, Set};
pub use parser::{CharParser, format_errors_cli};
pub use wrapped::WrappedRcRefCell;
