use anyhow::Result;
use clap::Parser;
use snvi::cli::{linear_gaussian, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::LinearGaussian(args) => {
            linear_gaussian::run(args)?;
        }
    }

    Ok(())
}
