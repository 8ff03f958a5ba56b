use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use modelsmith::config::{AppConfig, CliOverrides, SandboxBackendKind};

mod cmd;

#[derive(Parser)]
#[command(name = "modelsmith")]
#[command(version, about = "Conversational financial model generation server")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file (defaults to ./modelsmith.toml when present)
    #[arg(short, long, global = true, env = "MODELSMITH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Sandbox backend: process or docker
        #[arg(long)]
        sandbox_backend: Option<SandboxBackendKind>,

        /// Enable dev mode (permissive CORS for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations, then exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let mut overrides = CliOverrides {
            verbose: self.verbose,
            ..CliOverrides::default()
        };
        match &self.command {
            Commands::Serve {
                host,
                port,
                db_path,
                sandbox_backend,
                dev,
            } => {
                overrides.host = host.clone();
                overrides.port = *port;
                overrides.db_path = db_path.clone();
                overrides.sandbox_backend = *sandbox_backend;
                overrides.dev_mode = *dev;
            }
            Commands::InitDb { db_path } => {
                overrides.db_path = db_path.clone();
            }
            Commands::Config { .. } => {}
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.config.as_deref(), &cli.overrides())?;

    match &cli.command {
        Commands::Serve { .. } => {
            let _guard = modelsmith::logging::init(&config.logging)?;
            cmd::cmd_serve(config).await?;
        }
        Commands::InitDb { .. } => cmd::cmd_init_db(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
