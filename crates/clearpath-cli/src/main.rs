use anyhow::Result;
use clap::Parser;
use clearpath_cli::{init_tracing, run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_filter());
    run_cli(cli)
}
