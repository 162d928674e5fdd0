// worklets - command line entry point

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use worklets::cli::Commands;

#[derive(Parser, Debug)]
#[command(
    name = "worklets",
    version,
    about = "Run JavaScript worklets on dedicated runtime threads"
)]
struct Cli {
    /// More log output (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli.command.run()
}
