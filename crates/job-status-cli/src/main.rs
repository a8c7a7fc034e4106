use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = job_status_cli::Cli::parse();
    job_status_cli::observability::init_logging(cli.log_format());
    job_status_cli::run_cli(cli)
}
