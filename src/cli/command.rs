use anyhow::Result;
use clap::{Args, Subcommand};

use crate::actions::Installer;
use crate::config::Config;

#[derive(Args)]
pub struct CommandArgs {
    #[command(subcommand)]
    pub command: CommandCommands,
}

#[derive(Subcommand)]
pub enum CommandCommands {
    /// List the allowed command forms
    List,

    /// Run an allowed command in the application root
    Run {
        /// Binary (php, composer)
        binary: String,

        /// Arguments, e.g. `artisan migrate --force`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

pub async fn run(args: CommandArgs, config: &Config) -> Result<()> {
    let installer = Installer::from_config(config);

    match args.command {
        CommandCommands::List => {
            for (binary, prefix) in installer.guard().whitelist().iter() {
                println!("{} {}", binary, prefix.join(" "));
            }
            Ok(())
        }
        CommandCommands::Run { binary, args } => {
            super::report(installer.run_command(&binary, &args).await)
        }
    }
}
