use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use siberite::{Config, Server};

#[derive(Parser, Debug)]
#[command(
    name = "siberite",
    version,
    about = "Persistent work-queue server speaking the memcache text protocol"
)]
struct Cli {
    /// Listen address.
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Data directory holding one store per queue.
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Per-connection read deadline in seconds (0 disables it).
    #[arg(long, value_name = "SECS")]
    idle_timeout_secs: Option<u64>,

    /// Config file (JSON); flags override file values.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        tracing::error!("error: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> siberite::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(secs) = cli.idle_timeout_secs {
        config.idle_timeout_secs = secs;
    }

    let server = Server::bind(&config)?;
    tracing::info!("data directory: {}", config.data_dir.display());
    server.run()
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
