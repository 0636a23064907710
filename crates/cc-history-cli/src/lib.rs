//! Library for the cc-history CLI: command implementations, terminal output
//! and background daemon management.

pub mod commands;
pub mod daemon_manager;
pub mod output;
pub mod shutdown;

pub use commands::CliContext;
pub use output::OutputFormat;
