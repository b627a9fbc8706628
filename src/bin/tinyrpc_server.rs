use std::{error::Error, net::IpAddr, path::PathBuf};

use clap::Parser;
use log::error;
use tinyrpc::{DemoService, Server, ServerConfig, SignalKind, logging};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Listen for new connections at address
    #[arg(short, long)]
    address: Option<IpAddr>,
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,
    /// Worker threads answering connections
    #[arg(short, long)]
    workers: Option<usize>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(address) = cli.address {
        config.address = address;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }

    logging::init(&config.log_level)?;

    let service = DemoService::new(config.login.clone(), config.password.clone());
    let mut server = Server::bind(config, service)?;
    server.connect_signal(SignalKind::Interrupt)?;
    server.connect_signal(SignalKind::Terminate)?;

    if let Err(e) = server.run() {
        error!("server stopped on error: {e}");
        return Err(e.into());
    }
    Ok(())
}
