use arxiv_daily::cli::{Cli, GetVerbosity};
use arxiv_daily::logging::setup_logger;
use clap::Parser;
use std::process::exit;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.color {
        clap::ColorChoice::Auto => colorchoice::ColorChoice::Auto,
        clap::ColorChoice::Always => colorchoice::ColorChoice::Always,
        clap::ColorChoice::Never => colorchoice::ColorChoice::Never,
    }
    .write_global();
    setup_logger(cli.cmd.get_verbosity().tracing_level_filter());

    if let Err(e) = cli.cmd.run().await {
        error!("{e}");
        exit(1);
    }
}
