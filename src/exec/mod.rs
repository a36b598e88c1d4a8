//! Whitelisted command execution for installation steps.

pub mod executor;
pub mod guard;
pub mod whitelist;

pub use executor::{CommandExecutor, ProcessExecutor, ProcessOutput};
pub use guard::{CommandError, CommandGuard, CommandOutput};
pub use whitelist::CommandWhitelist;
