use anyhow::Result;
use clap::{Args, Subcommand};

use crate::actions::Installer;
use crate::config::Config;

#[derive(Args)]
pub struct KeyArgs {
    #[command(subcommand)]
    pub command: KeyCommands,
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Report whether APP_KEY is set in the env file
    Status,

    /// Generate APP_KEY and write it to the env file
    Generate {
        /// Replace an existing key (secrets encrypted with it become unreadable)
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: KeyArgs, config: &Config) -> Result<()> {
    let installer = Installer::from_config(config);
    let provisioner = installer.provisioner();

    match args.command {
        KeyCommands::Status => {
            let state = if provisioner.key_exists() {
                "present"
            } else {
                "missing or malformed"
            };
            println!("Env file: {}", provisioner.env_file().display());
            println!("APP_KEY:  {}", state);
            Ok(())
        }
        KeyCommands::Generate { force } => super::report(installer.generate_key(force)),
    }
}
