//! portico - rule-based local proxy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use portico::{
    bootstrap::bootstrap,
    config::{Config, Settings, CONFIG_FILE},
    hub::Overrides,
    log,
    server::Server,
};
use portico_events::LogLevel;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "portico")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Home directory.
    #[arg(short = 'd', long)]
    directory: Option<PathBuf>,

    /// Configuration file path.
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Test the configuration file and exit.
    #[arg(short = 't', long)]
    test_config: bool,

    /// Override the control API address.
    #[arg(long = "ext-ctl")]
    external_controller: Option<String>,

    /// Override the control API secret.
    #[arg(long)]
    secret: Option<String>,
}

impl Cli {
    /// Flags override the environment.
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::from_env()?;

        if let Some(dir) = &self.directory {
            settings.home_dir = absolute(dir)?;
            settings.config_path = settings.home_dir.join(CONFIG_FILE);
        }
        if let Some(config) = &self.config {
            settings.config_path = absolute(config)?;
        }
        if let Some(addr) = &self.external_controller {
            settings.external_controller = Some(addr.clone());
        }
        if let Some(secret) = &self.secret {
            settings.secret = Some(secret.clone());
        }

        Ok(settings)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;

    let log = log::install(settings.log_format, LogLevel::Info)?;

    if cli.test_config {
        let path = settings.config_path.display().to_string();
        match Config::load(&settings.config_path) {
            Ok(_) => {
                info!(config = %path, "Configuration file test succeeded");
                return Ok(());
            }
            Err(e) => {
                error!(config = %path, error = %e, "Configuration file test failed");
                std::process::exit(1);
            }
        }
    }

    bootstrap(&settings.home_dir, &settings.config_path).context("Server bootstrap failed")?;

    let config = Config::load(&settings.config_path)
        .with_context(|| format!("Failed to load {}", settings.config_path.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %settings.config_path.display(),
        "Starting portico"
    );

    let overrides = Overrides {
        external_controller: settings.external_controller,
        secret: settings.secret,
    };
    let server = Server::new(settings.config_path, overrides, log);
    server.serve(config).await
}
