// ABOUTME: Subcommand implementations of the hatchery binary
// ABOUTME: Each module owns its clap arguments and an async execute function

pub mod remote;
pub mod run;
pub mod serve;
pub mod volumes;
