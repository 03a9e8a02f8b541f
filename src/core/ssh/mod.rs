//! Local/SSH routing for shell commands.

mod client;

pub use client::*;
