pub mod audit;
pub mod command;
pub mod config;
pub mod key;
pub mod paths;
pub mod secret;
pub mod serve;
pub mod token;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::actions::ActionResult;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "install-guard")]
#[command(
    author,
    version,
    about = "Token-gated installer core: encrypted secrets and whitelisted commands"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Application root (overrides app.root from config.toml)
    #[arg(long, global = true, env = "INSTALL_GUARD_APP_ROOT")]
    pub app_root: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gated installer HTTP server
    Serve(serve::ServeArgs),

    /// Show or regenerate the installer access token
    Token(token::TokenArgs),

    /// Application master key (APP_KEY)
    Key(key::KeyArgs),

    /// Encrypted secret storage
    Secret(secret::SecretArgs),

    /// Whitelisted installation commands
    Command(command::CommandArgs),

    /// Show or verify the security audit log
    Audit(audit::AuditArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}

impl Cli {
    /// Load config.toml and apply global overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load()?;
        if let Some(ref root) = self.app_root {
            config.app.root = root.clone();
        }
        Ok(config)
    }
}

/// Print an action result; a failed action becomes a non-zero exit.
pub(crate) fn report(result: ActionResult) -> Result<()> {
    if !result.success {
        let detail = result
            .error
            .as_ref()
            .and_then(|e| e.detail.clone())
            .unwrap_or_default();
        if let Some(data) = result.data {
            eprintln!("{}", serde_json::to_string_pretty(&data)?);
        }
        anyhow::bail!("{} {}", result.message, detail);
    }

    println!("{}", result.message);
    if let Some(data) = result.data {
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}
