use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::actions::Installer;
use crate::concurrency::write_private;
use crate::config::Config;
use crate::security::UploadedFile;

#[derive(Args)]
pub struct SecretArgs {
    #[command(subcommand)]
    pub command: SecretCommands,
}

#[derive(Subcommand)]
pub enum SecretCommands {
    /// Encrypt and store a secret
    Store {
        /// Secret name (sanitized to a flat file stem)
        name: String,

        /// Read content from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Validate the file as a certificate upload (.p12, .pfx, .pem, ...)
        #[arg(long, requires = "file")]
        certificate: bool,

        /// Store an associated password, read from this environment variable
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,
    },

    /// Decrypt a secret to stdout or a file
    Retrieve {
        name: String,

        /// Write to this path (mode 0600) instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Print the associated password instead of the content
        #[arg(long)]
        password: bool,
    },

    /// Delete a secret and its password
    Delete { name: String },

    /// List stored secrets
    List,
}

pub async fn run(args: SecretArgs, config: &Config) -> Result<()> {
    let installer = Installer::from_config(config);

    match args.command {
        SecretCommands::Store {
            name,
            file,
            certificate,
            password_env,
        } => {
            let password = match password_env {
                Some(var) => Some(
                    std::env::var(&var)
                        .with_context(|| format!("environment variable {} is not set", var))?,
                ),
                None => None,
            };

            let content = match file {
                Some(ref path) => std::fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };

            let result = match (certificate, file) {
                (true, Some(path)) => {
                    let upload = UploadedFile {
                        original_name: path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        bytes: content,
                    };
                    installer.store_certificate(&upload, &name, password.as_deref())
                }
                _ => installer.store_secret(&name, &content, password.as_deref()),
            };
            super::report(result)
        }

        SecretCommands::Retrieve {
            name,
            out,
            password,
        } => {
            let bytes = if password {
                let pwd = installer.retrieve_password(&name)?;
                pwd.as_bytes().to_vec()
            } else {
                installer.retrieve_secret(&name)?.to_vec()
            };
            let bytes = zeroize::Zeroizing::new(bytes);

            match out {
                Some(path) => {
                    write_private(&path, &bytes)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("Wrote {} bytes to {}", bytes.len(), path.display());
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
            }
            Ok(())
        }

        SecretCommands::Delete { name } => super::report(installer.delete_secret(&name)),

        SecretCommands::List => super::report(installer.list_secrets()),
    }
}
