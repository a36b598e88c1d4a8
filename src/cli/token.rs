use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::gate::{AccessGate, MemorySession, TokenRecord};

#[derive(Args)]
pub struct TokenArgs {
    #[command(subcommand)]
    pub command: TokenCommands,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Print the current access token, issuing one if none exists
    Show,

    /// Replace the token; the old one stops working immediately
    Regenerate,
}

pub async fn run(args: TokenArgs, config: &Config) -> Result<()> {
    let gate = AccessGate::new(&config.paths, config.gate.clone())?;

    let record = match args.command {
        TokenCommands::Show => gate.current_token()?,
        TokenCommands::Regenerate => {
            let record = gate.regenerate_token(&mut MemorySession::new())?;
            println!("Access token regenerated. Open wizard sessions must re-authenticate.");
            record
        }
    };

    print_record(&record, config);
    Ok(())
}

fn print_record(record: &TokenRecord, config: &Config) {
    let created = Utc
        .timestamp_opt(record.created_at, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| record.created_at.to_string());

    println!();
    println!("Token:      {}", record.token);
    println!("Created:    {}", created);
    println!(
        "Bound IP:   {}",
        record.ip.as_deref().unwrap_or("(not yet bound)")
    );
    println!();
    println!(
        "Wizard API: http://{}:{}/api/install/status",
        config.server.bind, config.server.port
    );
    println!("Send the token in the X-Install-Token header.");
}
