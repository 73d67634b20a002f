//! bitnet-lambda - serve a BitNet llama-server from inside a serverless function.
//!
//! Launches the inference binary on first use, waits until the model is
//! loaded, and proxies one completion request per invocation. The process is
//! kept warm across invocations and stopped when the host shuts down.

mod config;
mod deploy;
mod download;
mod error;
mod handler;
mod protocol;
mod runtime;
mod supervisor;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bitnet-lambda")]
#[command(author, version, about = "Serverless supervisor and proxy for a local BitNet llama-server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve invocations from the function runtime API
    Serve {
        /// Start the inference server before the first invocation arrives
        #[arg(long)]
        warm: bool,
    },
    /// Run a single invocation locally and print the response
    Invoke {
        /// Event JSON (read from stdin if omitted)
        #[arg(value_name = "EVENT")]
        event: Option<String>,
    },
    /// Download the model weights from the model hub
    DownloadModel {
        /// Hub token (defaults to HUGGINGFACE_HUB_TOKEN or HF_TOKEN)
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,
        /// Directory to place the weights in
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
    /// Print stack and resource names for the configured environment
    Names,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { warm } => {
            init_logging(false);
            let config = config::Config::load().context("Failed to load configuration")?;
            info!(
                "Starting bitnet-lambda runtime (model: {})",
                config.server.model_path.display()
            );
            runtime::run(config, warm).await
        }
        Commands::Invoke { event } => {
            init_logging(true);
            handle_invoke(event).await
        }
        Commands::DownloadModel { token, dir } => handle_download(token, dir).await,
        Commands::Names => handle_names(),
        Commands::Config => handle_config(),
    }
}

/// Initialize logging. Function logs are captured as plain text.
fn init_logging(ansi: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("bitnet_lambda=info".parse().unwrap())
                .add_directive("llama_server=info".parse().unwrap())
                .add_directive("reqwest=warn".parse().unwrap()),
        )
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();
}

/// Run one event through the handler, as the runtime would.
async fn handle_invoke(event: Option<String>) -> Result<()> {
    let raw = match event {
        Some(event) => event,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read event from stdin")?;
            buf
        }
    };
    let event: serde_json::Value =
        serde_json::from_str(&raw).context("Event is not valid JSON")?;

    let config = config::Config::load().context("Failed to load configuration")?;
    let supervisor = supervisor::Supervisor::new(config)?;

    let result = tokio::select! {
        result = handler::handle_event(&supervisor, event) => Some(result),
        _ = runtime::shutdown_signal() => None,
    };
    supervisor.shutdown().await;

    match result {
        Some(Ok(response)) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Some(Err(e)) => Err(e.into()),
        None => {
            eprintln!("Interrupted");
            std::process::exit(130);
        }
    }
}

/// Handle the download-model command.
async fn handle_download(token: Option<String>, dir: Option<PathBuf>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(dir) = dir {
        config.download.model_dir = dir;
    }

    println!("Model will be saved to: {}", config.download.model_dir.display());

    let token = download::resolve_token(token);
    if token.is_none() {
        println!("No hub token found; trying an anonymous download");
    }

    match download::download_model(&config.download, token.as_deref()).await? {
        download::DownloadOutcome::AlreadyPresent { path, size } => {
            println!("Model already exists and appears valid");
            println!("  File path: {}", path.display());
            println!("  File size: {}", download::format_size(size));
        }
        download::DownloadOutcome::Downloaded { path, size } => {
            println!("Model downloaded successfully from {}", config.download.repo_id);
            println!("  File path: {}", path.display());
            println!("  File size: {}", download::format_size(size));
        }
    }
    Ok(())
}

/// Handle the names command.
fn handle_names() -> Result<()> {
    let config = config::Config::load()?;
    let deployment = &config.deployment;

    println!("Stack:     {}", deployment.stack_name());
    println!("Function:  {}", deployment.function_name());
    println!("Role:      {}", deployment.role_name());
    println!("Log group: {}", deployment.log_group_name());
    println!(
        "Sizing:    {} MB, {} min timeout, {}",
        deployment.memory_size_mb, deployment.timeout_minutes, deployment.architecture
    );

    println!("\nTags:");
    for (key, value) in deployment.tags() {
        println!("  {} = {}", key, value);
    }

    println!("\nFunction environment:");
    for (key, value) in deploy::function_environment(&config.server) {
        println!("  {} = {}", key, value);
    }
    Ok(())
}

/// Handle the config command.
fn handle_config() -> Result<()> {
    let config = config::Config::load()?;
    match config::Config::config_path() {
        Ok(path) if path.exists() => println!("# Loaded from {}", path.display()),
        Ok(path) => println!("# No file at {}; showing defaults", path.display()),
        Err(_) => println!("# No config directory; showing defaults"),
    }
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
