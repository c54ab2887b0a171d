pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{MegaError, MegaResult};
pub use types::{NodeHandle, NodeType, UserHandle};
