use facegate::{
    best_distance,
    common::Config,
    core::train_user,
    DescriptorEngine, ModelStore, SampleStore, ServiceClient,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Face authentication: model training and daemon client")]
struct Cli {
    /// Config file (default: /etc/facegate/facegate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the daemon socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Debug logging with source locations
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild a user's model from their enrollment samples
    Train { user: String },
    /// Match an image file against a user's model
    Predict { user: String, image: PathBuf },
    /// Ask the daemon to capture enrollment samples
    Enroll { user: String },
    /// Ask the daemon to authenticate a user
    Auth { user: String },
    /// Show a user's model policy
    Info { user: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(socket) = cli.socket {
        config.server.socket_path = socket;
    }

    let data_dir = &config.storage.data_dir;
    let models = ModelStore::new(data_dir, config.matcher.threshold);

    match cli.command {
        Commands::Train { user } => {
            let engine = DescriptorEngine::new(config.matcher.grid)?;
            let report = train_user(
                &user,
                &SampleStore::new(data_dir),
                &models,
                &engine,
                config.matcher.threshold,
            )
            .with_context(|| format!("Training {} failed", user))?;

            println!(
                "Trained {}: {} samples, dim {}, threshold {:.4}",
                user, report.policy.n_samples, report.policy.dim, report.policy.threshold
            );
            for name in &report.skipped {
                println!("  skipped unreadable {}", name);
            }
        }
        Commands::Predict { user, image } => {
            let model = models
                .load(&user)
                .with_context(|| format!("No usable model for {}", user))?;
            let frame = image::open(&image)
                .with_context(|| format!("Cannot read {}", image.display()))?
                .to_luma8();

            let engine = DescriptorEngine::new(model.policy.grid)?;
            let nearest = best_distance(&engine.extract(&frame), &model.descriptors)?;
            let threshold = config.matcher.effective_threshold(model.policy.threshold);

            println!("match: {}", nearest.distance <= threshold);
            println!("distance: {:.6} (threshold {:.4})", nearest.distance, threshold);
            println!("best sample: {}", model.policy.sample_name(nearest.index));
        }
        Commands::Enroll { user } => {
            let client = ServiceClient::new(&config.server.socket_path);
            let response = client.enroll(&user)?;
            print!("{}", String::from_utf8_lossy(&response.to_line()));
            if !response.ok {
                std::process::exit(1);
            }
        }
        Commands::Auth { user } => {
            let client = ServiceClient::new(&config.server.socket_path);
            let response = client.auth(&user)?;
            print!("{}", String::from_utf8_lossy(&response.to_line()));
            if response.matched != Some(true) {
                std::process::exit(1);
            }
        }
        Commands::Info { user } => {
            let model = models
                .load(&user)
                .with_context(|| format!("No usable model for {}", user))?;
            let policy = &model.policy;
            println!("user:       {}", policy.user);
            println!("format:     {:?}", model.format);
            println!("grid:       {}", policy.grid);
            println!("dim:        {}", policy.dim);
            println!("samples:    {}", policy.n_samples);
            println!(
                "threshold:  {:.4} (effective {:.4})",
                policy.threshold,
                config.matcher.effective_threshold(policy.threshold)
            );
            for name in &policy.filenames {
                println!("  {}", name);
            }
        }
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
