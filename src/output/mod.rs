//! JSON envelope and exit-code mapping for the CLI.

mod response;

pub use response::*;
