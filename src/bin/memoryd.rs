use clap::Parser;
use log::{error, info};
use memoryd::daemon;
use memoryd::util::config::AppConfig;
use memoryd::util::logging;
use std::process;

#[derive(Parser)]
#[command(author, version, about = "Location memory daemon", long_about = None)]
struct Cli {
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    logging::set_run_id(logging::generate_run_id());

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    info!(
        "Starting memoryd (listen: {}, database: {})",
        config.listen, config.database
    );

    if let Err(e) = daemon::run(config) {
        error!("memoryd error: {e:#}");
        process::exit(1);
    }
}
