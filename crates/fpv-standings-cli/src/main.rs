use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = fpv_standings_cli::Cli::parse();
    fpv_standings_cli::init_logging(cli.verbose);
    fpv_standings_cli::run_cli(cli)
}
