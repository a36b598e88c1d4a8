use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::security::AuditLog;

#[derive(Args)]
pub struct AuditArgs {
    /// Print entries as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Check the hash chain instead of printing entries
    #[arg(long)]
    pub verify: bool,

    /// Show only the last N entries
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

pub async fn run(args: AuditArgs, config: &Config) -> Result<()> {
    let log = AuditLog::new(config.paths.audit_log());

    if args.verify {
        let broken = log.verify()?;
        if broken.is_empty() {
            println!("Audit chain intact ({})", log.path().display());
            return Ok(());
        }
        let lines: Vec<String> = broken.iter().map(|i| (i + 1).to_string()).collect();
        anyhow::bail!("Audit chain broken at line(s): {}", lines.join(", "));
    }

    let entries = log.read()?;
    let skip = args
        .limit
        .map(|n| entries.len().saturating_sub(n))
        .unwrap_or(0);

    for entry in entries.iter().skip(skip) {
        if args.json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!(
                "{}  {:<18} {:<6} {}{}",
                entry.ts,
                entry.action.as_str(),
                entry.source,
                entry.subject,
                entry
                    .detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}
