//! CLI subcommand: `install-guard paths`
//!
//! Prints the resolved XDG paths and the per-application files derived from config.

use anyhow::Result;

use crate::config::Config;

pub fn run(config: &Config) -> Result<()> {
    let paths = &config.paths;

    println!("install-guard Paths (XDG Base Directory)");
    println!("========================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  secrets:        {}", config.secrets_dir().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  access token:   {}", paths.token_file().display());
    println!("  attempt log:    {}", paths.attempts_file().display());
    println!("  audit log:      {}", paths.audit_log().display());
    println!("  state lock:     {}", paths.state_lock().display());
    println!();
    println!("Application:  {}", config.app_root().display());
    println!("  env file:       {}", config.env_file().display());

    Ok(())
}
