//! ## sensorgw-cli
//! **Operational entrypoint of the sensor gateway**
//!
//! Starts the gateway, validates configuration files and produces test
//! frames for manual checks against a running instance.

use clap::Parser;

mod commands;

use commands::Cli;

fn main() -> anyhow::Result<()> {
    commands::run_command(Cli::parse())
}
