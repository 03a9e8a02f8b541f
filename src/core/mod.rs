pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod lock;
pub mod report;
pub mod ssh;
pub mod updates;

pub(crate) mod paths;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
