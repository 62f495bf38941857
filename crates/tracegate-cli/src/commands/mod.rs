//! CLI subcommand implementations.

pub mod emit;
pub mod sessions;
