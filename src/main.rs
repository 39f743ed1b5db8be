//! Caption inference executable.

use anyhow::Result;
use captionforge_runtime::cli::{run_cli, Cli};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
