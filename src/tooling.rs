//! Tooling & Integration Layer
//!
//! The command-line front end: the daemon entry point and control-socket clients.

pub mod cli;

pub use cli::{Cli, CliContext, Commands};
