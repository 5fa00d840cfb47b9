//! CLI module for the convergence engine.
//!
//! This module provides the command-line interface for applying, verifying
//! and tearing down a desired-state declaration.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, ReportCommands};
pub use output::OutputFormatter;
