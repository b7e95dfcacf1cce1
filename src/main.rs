pub mod config;
pub mod data;
pub mod geocode;
pub mod layers;
pub mod render;
pub mod server;
pub mod types;
pub mod view;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pre-render the overlay tile pyramids for every display mode
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the interactive map
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

fn http_client(config: &config::AppConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.geocoder.user_agent.clone())
        .timeout(Duration::from_secs(config.geocoder.timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate { config } => {
            info!("Generating tiles with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            let client = http_client(&app_config)?;

            let points = data::load_data(&app_config, &client).await;
            render::generate_tiles(&app_config, &points)?;

            info!("Generation complete");
        }
        Commands::Serve { config } => {
            info!("Serving map with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            let client = http_client(&app_config)?;

            let points = data::load_data(&app_config, &client).await;
            server::start_server(app_config, points, client).await?;
        }
    }

    Ok(())
}
