use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use pricegate::core::FetchParams;
use pricegate::core::config::AppConfig;
use pricegate::core::log::init_logging;
use pricegate::server::lifecycle::ShutdownOutcome;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration at --config-path or the default location
    Setup,
    /// Run the price service until SIGINT or SIGTERM
    Serve,
    /// Fetch a single price and print it as JSON
    Fetch {
        /// Query parameters as KEY=VALUE pairs
        #[arg(required = true)]
        params: Vec<FetchParams>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => setup(cli.config_path.as_deref()),
        Some(Commands::Serve) => serve(cli.config_path.as_deref()).await,
        Some(Commands::Fetch { params }) => fetch(cli.config_path.as_deref(), params).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}

/// Uses the default config location when present, otherwise the defaults.
fn config_or_default(config_path: Option<&str>) -> Result<AppConfig> {
    if config_path.is_none() && !AppConfig::default_config_path()?.exists() {
        tracing::info!("No configuration found, using defaults");
        return Ok(AppConfig::default());
    }
    pricegate::load_config(config_path)
}

async fn serve(config_path: Option<&str>) -> Result<()> {
    let config = config_or_default(config_path)?;
    match pricegate::serve(&config).await? {
        ShutdownOutcome::Clean => Ok(()),
        outcome @ ShutdownOutcome::Forced => {
            tracing::error!("Shutdown deadline exceeded, exiting");
            std::process::exit(outcome.exit_code());
        }
    }
}

async fn fetch(config_path: Option<&str>, params: Vec<FetchParams>) -> Result<()> {
    let config = config_or_default(config_path)?;
    let params: FetchParams = params
        .iter()
        .flat_map(|p| p.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let result = pricegate::fetch_once(&config, &params).await?;
    println!("{}", serde_json::to_string_pretty(&result.to_record())?);
    if result.is_error() {
        anyhow::bail!(
            "Price fetch failed: {}",
            result.error_message().unwrap_or_default()
        );
    }
    Ok(())
}

fn setup(config_path: Option<&str>) -> Result<()> {
    let path = pricegate::write_default_config(config_path)?;
    tracing::info!("Created default configuration at {}", path.display());
    Ok(())
}
