//! CLI subcommand implementations.

pub mod ingest;
