//! Command-line interface for flowforge.
//!
//! Provides commands for executing pipeline threads, resolving checkpoint
//! decisions, and inspecting or sweeping persisted thread state.

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, Cli, Commands, ExecuteArgs, ResumeArgs, StateArgs, StoreArgs,
};
