use std::{io::IsTerminal, path::PathBuf};

use bus::{BusServer, LocalBus};
use clap::Parser;
use config::Settings;
use engine::DebugEngine;
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(version, about = "Debug adapter orchestration process")]
struct Args {
    /// Settings file; defaults to the user configuration directory
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Override the address front-ends connect to
    #[clap(short, long)]
    bus_address: Option<String>,

    /// Print the effective settings and exit
    #[clap(long)]
    print_config: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::io::stderr().is_terminal() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init();
    }
}

fn main() -> eyre::Result<()> {
    init_logging();
    let _ = color_eyre::install();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).wrap_err("loading settings")?;
    if let Some(address) = args.bus_address {
        settings.bus_address = address;
    }
    if args.print_config {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    let bus = LocalBus::new();
    let server =
        BusServer::bind(settings.bus_address.as_str(), bus.clone()).wrap_err("starting bus")?;
    tracing::info!(address = %server.local_addr(), "waiting for front-ends");

    let engine = DebugEngine::new(&settings, bus).wrap_err("creating debug engine")?;
    let (_shutdown, shutdown_rx) = crossbeam_channel::bounded(0);
    engine.run(&shutdown_rx)
}
