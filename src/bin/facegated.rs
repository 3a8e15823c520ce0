use facegate::{
    common::{Config, Isolation},
    HelperCapture, Server, SessionHandler,
};

use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "facegated")]
#[command(about = "Facegate face authentication daemon")]
struct Args {
    /// Config file (default: /etc/facegate/facegate.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the camera device index
    #[arg(long)]
    device: Option<u32>,

    /// Handle connections on threads instead of forked processes
    #[arg(long)]
    threads: bool,

    /// Debug logging with source locations
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(device) = args.device {
        config.camera.device_index = device;
    }
    if args.threads {
        config.server.isolation = Isolation::Thread;
    }
    config.validate()?;

    tracing::info!(
        "Starting facegated (data: {}, camera helper: {}, device {})",
        config.storage.data_dir.display(),
        config.camera.helper_path.display(),
        config.camera.device_index
    );

    let server = match Server::listen(&config.server) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Cannot listen on {}: {}", config.server.socket_path.display(), e);
            return Err(e).context("Failed to bind daemon socket");
        }
    };

    let socket_path = server.socket_path().to_path_buf();
    ctrlc::set_handler(move || {
        tracing::info!("Shutting down, removing {}", socket_path.display());
        let _ = std::fs::remove_file(&socket_path);
        std::process::exit(0);
    })
    .context("Failed to install signal handler")?;

    let capture = Arc::new(HelperCapture::new(&config.camera));
    let handler = SessionHandler::new(config, capture);

    let accept = server.serve(handler)?;
    if accept.join().is_err() {
        anyhow::bail!("Accept loop terminated unexpectedly");
    }
    Ok(())
}

fn setup_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .init();
    }
}
