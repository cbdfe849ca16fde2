pub mod config;
pub mod deadline;
pub mod error;
pub mod types;

pub use config::SiftConfig;
pub use deadline::Deadline;
pub use error::{Result, SiftError, ValidationError};
pub use types::*;
