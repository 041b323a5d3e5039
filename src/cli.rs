//! CLI surface for the groom agent.

use std::ffi::OsString;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "groom",
    version,
    about = "Per-host package-management agent"
)]
pub struct Cli {
    /// Apply the committed transaction and exit (executor mode).
    #[arg(long)]
    pub execute: bool,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}
