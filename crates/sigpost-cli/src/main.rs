#![deny(unsafe_code)]

//! sigpost CLI: server, client, and operator control plane.

mod ctl;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sigpost_config::AppConfig;
use sigpost_core::client::{ClientExit, ClientRuntime};
use sigpost_core::{ClientId, Server, Store, TracingSink};

/// sigpost: signal-driven command and file dispatch between a server and its clients.
#[derive(Parser)]
#[command(name = "sigpost", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "sigpost.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until Ctrl-C.
    Serve,

    /// Run a client that checks in with the server.
    Client {
        /// Client id (multiple of 4). Overrides the configured one.
        #[arg(long)]
        id: Option<ClientId>,
    },

    /// Inspect clients and queue work for them.
    Ctl {
        #[command(subcommand)]
        action: ctl::CtlAction,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).await;
    let filter = match cli.verbose {
        0 => config
            .as_ref()
            .map(|c| c.logging.level.clone())
            .unwrap_or_else(|_| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
    let config = config?;

    match cli.command {
        Commands::Serve => cmd_serve(config).await?,
        Commands::Client { id } => cmd_client(config, id).await?,
        Commands::Ctl { action } => {
            let store = Store::from_config(&config.store)
                .with_context(|| format!("cannot open store at '{}'", config.store.path))?;
            let output = ctl::run(&store, action)?;
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_serve(config: AppConfig) -> Result<()> {
    let store = Store::from_config(&config.store)
        .with_context(|| format!("cannot open store at '{}'", config.store.path))?;
    info!("Starting sigpost server");
    let server = Server::new(config, store, Arc::new(TracingSink));
    server.run().await?;
    Ok(())
}

async fn cmd_client(config: AppConfig, id: Option<ClientId>) -> Result<()> {
    let id = match id {
        Some(id) => id,
        None if config.client.client_id != 0 => ClientId::new(config.client.client_id)?,
        None => ClientId::generate(),
    };
    let runtime = ClientRuntime::new(&config, id);
    match runtime.run().await? {
        ClientExit::Killed => info!(client_id = %id, "Client killed by server"),
        ClientExit::Shutdown => info!(client_id = %id, "Client stopped"),
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("invalid configuration '{}'", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_client_id_is_validated() {
        assert!(Cli::try_parse_from(["sigpost", "client", "--id", "1024"]).is_ok());
        assert!(Cli::try_parse_from(["sigpost", "client", "--id", "1025"]).is_err());
    }

    #[test]
    fn test_ctl_target_ids_are_validated() {
        assert!(Cli::try_parse_from(["sigpost", "ctl", "cmd", "8", "ls"]).is_ok());
        assert!(Cli::try_parse_from(["sigpost", "ctl", "cmd", "7", "ls"]).is_err());
        assert!(Cli::try_parse_from(["sigpost", "ctl", "pull", "6", "/etc/hosts"]).is_err());
        assert!(Cli::try_parse_from(["sigpost", "ctl", "push", "107374182000", "f.bin"]).is_err());
    }

    #[test]
    fn test_verbosity_and_config_flags() {
        let cli = Cli::try_parse_from(["sigpost", "-vv", "-c", "other.toml", "serve"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[tokio::test]
    async fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.server.listen_port, 4433);
    }

    #[tokio::test]
    async fn test_invalid_config_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[transfer]\nmax_chunk_bytes = 0\n").unwrap();
        assert!(load_config(&path).await.is_err());
    }
}
