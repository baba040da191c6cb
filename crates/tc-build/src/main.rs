use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = tc_build::cli::Cli::parse();
    tc_build::app::run(cli)
}
