use anyhow::Result;
use clap::Parser;

use install_guard::cli::{self, Cli, Commands};
use install_guard::config::LoggingConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    init_logging(cli.verbose, &config.logging);

    match cli.command {
        Commands::Serve(args) => cli::serve::run(args, config).await,
        Commands::Token(args) => cli::token::run(args, &config).await,
        Commands::Key(args) => cli::key::run(args, &config).await,
        Commands::Secret(args) => cli::secret::run(args, &config).await,
        Commands::Command(args) => cli::command::run(args, &config).await,
        Commands::Audit(args) => cli::audit::run(args, &config).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(&config),
    }
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let log_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // stdout carries command output (secret retrieve, token show)
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
